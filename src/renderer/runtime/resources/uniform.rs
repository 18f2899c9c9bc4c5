use crate::renderer::Result;

use super::arena::{align_up, ArenaAllocator, Region};

/// Arena for the uniform buffer: every block is padded to the device's
/// minimum uniform buffer offset alignment and placed on that boundary.
#[derive(Debug, Clone)]
pub struct UniformAligner {
    arena: ArenaAllocator,
    min_alignment: u64,
}

impl UniformAligner {
    pub fn new(capacity: u64, min_alignment: u64) -> Self {
        Self::with_arena(ArenaAllocator::new(capacity), min_alignment)
    }

    pub fn with_arena(arena: ArenaAllocator, min_alignment: u64) -> Self {
        Self {
            arena,
            min_alignment: min_alignment.max(1),
        }
    }

    #[inline]
    pub fn min_alignment(&self) -> u64 {
        self.min_alignment
    }

    /// Bytes actually reserved for a block of `size` bytes.
    #[inline]
    pub fn block_size(&self, size: u64) -> u64 {
        align_up(size.max(1), self.min_alignment)
    }

    pub fn allocate_uniform(&mut self, size: u64) -> Option<u64> {
        let rounded = self.block_size(size);
        let offset = self.arena.allocate(rounded, self.min_alignment)?;
        debug_assert_eq!(offset % self.min_alignment, 0);
        Some(offset)
    }

    pub fn required_capacity(&self, size: u64) -> u64 {
        self.arena
            .required_capacity(self.block_size(size), self.min_alignment)
    }

    pub fn free_uniform(&mut self, offset: u64) -> Result<Region> {
        self.arena.free(offset)
    }

    #[inline]
    pub fn arena(&self) -> &ArenaAllocator {
        &self.arena
    }

    #[inline]
    pub fn set_capacity(&mut self, capacity: u64) {
        self.arena.set_capacity(capacity);
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::renderer::RendererError;

    #[test]
    fn small_blocks_are_padded_to_alignment() {
        let mut uniforms = UniformAligner::new(4096, 256);
        assert_eq!(uniforms.allocate_uniform(60), Some(0));
        assert_eq!(uniforms.allocate_uniform(60), Some(256));
        assert_eq!(uniforms.arena().regions()[0].size, 256);
    }

    #[test]
    fn freed_block_is_reused_before_appending() {
        let mut arena = ArenaAllocator::new(4096);
        arena.allocate_at(0, 128).unwrap();
        arena.allocate_at(256, 128).unwrap();
        arena.allocate_at(512, 128).unwrap();
        let mut uniforms = UniformAligner::with_arena(arena, 256);

        uniforms.free_uniform(256).unwrap();
        assert_eq!(uniforms.allocate_uniform(128), Some(256));
    }

    #[test]
    fn every_offset_is_aligned() {
        let mut rng = StdRng::seed_from_u64(7);
        for alignment in [16, 64, 256] {
            let mut uniforms = UniformAligner::new(1 << 16, alignment);
            let mut live = Vec::new();
            for _ in 0..200 {
                if rng.gen_bool(0.3) && !live.is_empty() {
                    let victim = live.swap_remove(rng.gen_range(0..live.len()));
                    uniforms.free_uniform(victim).unwrap();
                    continue;
                }
                let offset = uniforms.allocate_uniform(rng.gen_range(1..200)).unwrap();
                assert_eq!(offset % alignment, 0);
                live.push(offset);
            }
        }
    }

    #[test]
    fn overflow_reports_required_capacity() {
        let mut uniforms = UniformAligner::new(512, 256);
        uniforms.allocate_uniform(200).unwrap();
        uniforms.allocate_uniform(200).unwrap();
        assert_eq!(uniforms.allocate_uniform(10), None);
        assert_eq!(uniforms.required_capacity(10), 768);

        uniforms.set_capacity(768);
        assert_eq!(uniforms.allocate_uniform(10), Some(512));
        assert!(matches!(
            uniforms.free_uniform(100),
            Err(RendererError::InvalidOffset { offset: 100 })
        ));
    }
}
