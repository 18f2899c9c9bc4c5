//! Region bookkeeping for one growable linear buffer.
//!
//! The allocator never touches GPU memory. It keeps a sorted list of the
//! occupied `(offset, size)` regions and answers "where does a block of this
//! size go?"; when nothing fits below the current capacity the owner grows
//! the buffer, calls [`ArenaAllocator::set_capacity`] and asks again.

use crate::renderer::{RendererError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// How a free gap is chosen when several fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Lowest-offset gap that fits.
    #[default]
    FirstFit,
    /// Gap leaving the least slack; ties go to the lower offset.
    BestFit,
}

/// Rounds `value` up to a multiple of `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[derive(Debug, Clone)]
pub struct ArenaAllocator {
    /// Sorted by offset, never overlapping.
    regions: Vec<Region>,
    capacity: u64,
    placement: Placement,
}

impl ArenaAllocator {
    pub fn new(capacity: u64) -> Self {
        Self::with_placement(capacity, Placement::FirstFit)
    }

    pub fn with_placement(capacity: u64, placement: Placement) -> Self {
        Self {
            regions: Vec::new(),
            capacity,
            placement,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: u64) {
        debug_assert!(capacity >= self.high_water());
        self.capacity = capacity;
    }

    #[inline]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// End of the last occupied region.
    pub fn high_water(&self) -> u64 {
        self.regions.last().map_or(0, Region::end)
    }

    pub fn used(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Capacity that guarantees `allocate(size, alignment)` succeeds by
    /// appending after the last region.
    pub fn required_capacity(&self, size: u64, alignment: u64) -> u64 {
        align_up(self.high_water(), alignment) + size.max(1)
    }

    /// Places a block of `size` bytes at an offset that is a multiple of
    /// `alignment`. `None` means no gap below the capacity fits.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(size > 0, "zero sized arena allocation");
        let size = size.max(1);

        let fits = self.gaps().filter_map(|(index, start, end)| {
            let offset = align_up(start, alignment);
            let slack = end.checked_sub(offset)?.checked_sub(size)?;
            Some((index, offset, slack))
        });

        let (index, offset) = match self.placement {
            Placement::FirstFit => fits.map(|(i, o, _)| (i, o)).next()?,
            Placement::BestFit => fits
                .min_by_key(|&(_, offset, slack)| (slack, offset))
                .map(|(i, o, _)| (i, o))?,
        };

        self.regions.insert(index, Region { offset, size });
        Some(offset)
    }

    /// Places a block at exactly `offset`.
    pub fn allocate_at(&mut self, offset: u64, size: u64) -> Result<u64> {
        let region = Region {
            offset,
            size: size.max(1),
        };
        let index = self.regions.partition_point(|r| r.offset < offset);

        let after_prev = index == 0 || self.regions[index - 1].end() <= offset;
        let before_next = self
            .regions
            .get(index)
            .map_or(true, |next| region.end() <= next.offset);

        if !after_prev || !before_next || region.end() > self.capacity {
            return Err(RendererError::RegionUnavailable {
                offset,
                size: region.size,
            });
        }

        self.regions.insert(index, region);
        Ok(offset)
    }

    /// Releases the region starting at `offset`.
    pub fn free(&mut self, offset: u64) -> Result<Region> {
        match self.regions.binary_search_by_key(&offset, |r| r.offset) {
            Ok(index) => Ok(self.regions.remove(index)),
            Err(_) => Err(RendererError::InvalidOffset { offset }),
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.regions
            .binary_search_by_key(&offset, |r| r.offset)
            .is_ok()
    }

    /// `(insertion index, gap start, gap end)` for every gap, including the
    /// one before the first region and the tail up to the capacity.
    fn gaps(&self) -> impl Iterator<Item = (usize, u64, u64)> + '_ {
        let starts = std::iter::once(0).chain(self.regions.iter().map(Region::end));
        let ends = self
            .regions
            .iter()
            .map(|r| r.offset)
            .chain(std::iter::once(self.capacity));

        starts
            .zip(ends)
            .enumerate()
            .map(|(index, (start, end))| (index, start, end))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn assert_disjoint(arena: &ArenaAllocator) {
        for pair in arena.regions().windows(2) {
            assert!(
                pair[0].end() <= pair[1].offset,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn empty_arena_places_at_zero() {
        let mut arena = ArenaAllocator::new(64);
        assert_eq!(arena.allocate(10, 16), Some(0));
    }

    #[test]
    fn freed_gap_is_reused_first_fit() {
        let mut arena = ArenaAllocator::new(1024);
        let a = arena.allocate(400, 1).unwrap();
        let b = arena.allocate(400, 1).unwrap();
        assert_eq!((a, b), (0, 400));

        arena.free(a).unwrap();
        assert_eq!(arena.allocate(300, 1), Some(0));
        assert_disjoint(&arena);
    }

    #[test]
    fn no_fit_until_capacity_grows() {
        let mut arena = ArenaAllocator::new(1024);
        arena.allocate(400, 1).unwrap();
        arena.allocate(400, 1).unwrap();
        assert_eq!(arena.allocate(300, 1), None);
        assert_eq!(arena.len(), 2);

        let required = arena.required_capacity(300, 1);
        assert_eq!(required, 1100);
        arena.set_capacity(required);
        assert_eq!(arena.allocate(300, 1), Some(800));
    }

    #[test]
    fn gap_start_is_rounded_to_alignment() {
        let mut arena = ArenaAllocator::new(256);
        arena.allocate_at(0, 10).unwrap();
        arena.allocate_at(40, 10).unwrap();

        // [10, 40) holds 30 bytes but only 24 once rounded up to 16.
        assert_eq!(arena.allocate(24, 16), Some(16));
        assert_eq!(arena.allocate(24, 16), Some(64));
        assert_disjoint(&arena);
    }

    #[test]
    fn first_fit_prefers_lowest_gap_and_best_fit_the_tightest() {
        let layout = |placement| {
            let mut arena = ArenaAllocator::with_placement(1000, placement);
            arena.allocate_at(100, 100).unwrap(); // gap [0, 100)
            arena.allocate_at(250, 100).unwrap(); // gap [200, 250)
            arena.allocate_at(400, 600).unwrap();
            arena
        };

        let mut first = layout(Placement::FirstFit);
        assert_eq!(first.allocate(40, 1), Some(0));

        let mut best = layout(Placement::BestFit);
        assert_eq!(best.allocate(40, 1), Some(200));
    }

    #[test]
    fn forced_placement_rejects_overlap() {
        let mut arena = ArenaAllocator::new(512);
        arena.allocate_at(128, 128).unwrap();
        assert!(matches!(
            arena.allocate_at(200, 16),
            Err(RendererError::RegionUnavailable { .. })
        ));
        assert!(arena.allocate_at(64, 65).is_err());
        assert!(arena.allocate_at(500, 16).is_err());
        assert_eq!(arena.allocate_at(64, 64).unwrap(), 64);
    }

    #[test]
    fn freeing_unknown_offset_is_an_error() {
        let mut arena = ArenaAllocator::new(128);
        arena.allocate(32, 1).unwrap();
        assert!(matches!(
            arena.free(5),
            Err(RendererError::InvalidOffset { offset: 5 })
        ));
        arena.free(0).unwrap();
        assert!(matches!(
            arena.free(0),
            Err(RendererError::InvalidOffset { offset: 0 })
        ));
    }

    #[test]
    fn gaps_too_small_for_the_block_are_skipped() {
        let mut arena = ArenaAllocator::new(1024);
        arena.allocate_at(0, 100).unwrap();
        arena.allocate_at(110, 100).unwrap();

        // Zero-width gap before offset 0 and a 10 byte gap, then the tail.
        assert_eq!(arena.allocate(50, 1), Some(210));
        // [100, 110) rounds up to 112, past the end of the gap.
        assert_eq!(arena.allocate(8, 16), Some(272));
        assert_disjoint(&arena);

        let mut best = ArenaAllocator::with_placement(256, Placement::BestFit);
        best.allocate_at(0, 64).unwrap();
        best.allocate_at(70, 100).unwrap();
        assert_eq!(best.allocate(32, 1), Some(170));
        assert_eq!(best.allocate(100, 1), None);
    }

    #[test]
    fn regions_never_overlap_under_churn() {
        let mut rng = StdRng::seed_from_u64(0x2545_f491_4f6c_dd1d);
        let mut arena = ArenaAllocator::new(4096);
        let mut live = Vec::new();

        for _ in 0..2000 {
            if rng.gen_range(0..3) == 0 && !live.is_empty() {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                arena.free(victim).unwrap();
            } else {
                let size = rng.gen_range(1..=200);
                let alignment = [1, 4, 16, 256][rng.gen_range(0..4)];
                let offset = match arena.allocate(size, alignment) {
                    Some(offset) => offset,
                    None => {
                        let required = arena.required_capacity(size, alignment);
                        arena.set_capacity(required * 3 / 2);
                        arena.allocate(size, alignment).unwrap()
                    }
                };
                assert_eq!(offset % alignment, 0);
                live.push(offset);
            }
            assert_disjoint(&arena);
            assert!(arena.high_water() <= arena.capacity());
        }
        assert_eq!(arena.len(), live.len());
    }
}
