use serde::Serialize;

use crate::config::RendererConfig;

use super::{
    device::{DescriptorWrite, GpuDevice},
    utilities::{AssetCategory, BufferKind, DeviceLimits, MAIN_BUFFER_ALIGNMENT},
    RendererError, Result,
};

use self::{
    resources::{
        arena::ArenaAllocator,
        buffers::{BufferGrowthManager, CapacityState},
        descriptors::{DescriptorPoolManager, PoolRecord},
        mesh::{self, MainBufferOffsets, VertexBlob},
        textures::{TextureBinding, TextureMemoryManager},
        uniform::UniformAligner,
        AssetBinding, AssetHandle, Registry, TextureHandle, UniformBlock, UniformBlockHandle,
    },
    run::FrameSync,
};

pub mod resources;
pub mod run;

/// Live counts and capacities of everything the renderer manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendererStats {
    pub assets: usize,
    pub textures: usize,
    pub uniform_blocks: usize,
    pub main_buffer: CapacityState,
    pub uniform_buffer: CapacityState,
    pub staging_buffer: CapacityState,
    pub texture_memory_capacity: u64,
    pub texture_memory_used: u64,
    pub pools: Vec<PoolStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub category: AssetCategory,
    pub capacity: u32,
    pub live_count: u32,
    pub generation: u32,
}

/// Handles descriptor sets were last written against: uniform buffer
/// generation and texture memory generation.
type DescriptorEpoch = (u32, u32);

pub struct Renderer<D: GpuDevice> {
    device: D,
    limits: DeviceLimits,

    main_arena: ArenaAllocator,
    uniforms: UniformAligner,
    buffers: BufferGrowthManager<D>,
    descriptors: DescriptorPoolManager<D>,
    textures: TextureMemoryManager<D>,
    registry: Registry<D::DescriptorSet>,
    descriptor_epoch: DescriptorEpoch,

    frames: FrameSync,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn new(mut device: D, config: &RendererConfig) -> Result<Self> {
        config.validate()?;
        let limits = device.limits();

        let mut buffers = BufferGrowthManager::new(
            &mut device,
            config.main_buffer_capacity,
            config.uniform_buffer_capacity,
            config.staging_buffer_capacity,
        )?;
        let mut descriptors = DescriptorPoolManager::new(config.descriptor_pool_capacity);
        if let Err(e) = descriptors.setup(&mut device) {
            descriptors.destroy(&mut device);
            buffers.destroy(&mut device);
            return Err(e);
        }

        let frames = FrameSync::new(device.frames_in_flight());
        log::info!(
            "renderer ready: {} frames in flight, uniform alignment {}, max anisotropy {}, max texture size {}",
            frames.len(),
            limits.min_uniform_alignment,
            limits.max_anisotropy,
            limits.max_texture_dimension
        );

        Ok(Self {
            main_arena: ArenaAllocator::new(config.main_buffer_capacity),
            uniforms: UniformAligner::new(
                config.uniform_buffer_capacity,
                limits.min_uniform_alignment,
            ),
            descriptor_epoch: (buffers.generation(BufferKind::Uniform), 0),
            buffers,
            descriptors,
            textures: TextureMemoryManager::new(config.texture_memory_capacity, config.mipmaps),
            registry: Registry::default(),
            frames,
            limits,
            device,
        })
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[inline]
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn asset(&self, handle: AssetHandle) -> Result<&AssetBinding<D::DescriptorSet>> {
        self.registry.asset(handle)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&TextureBinding<D>> {
        self.textures.get(handle)
    }

    /// The placeholder sampled in place of absent or removed textures, once
    /// something needed it.
    pub fn missing_texture(&self) -> Option<TextureHandle> {
        self.textures.missing_handle()
    }

    pub fn uniform_block(&self, handle: UniformBlockHandle) -> Result<UniformBlock> {
        self.registry.uniform_block(handle)
    }

    pub fn descriptor_pool(&self, category: AssetCategory) -> &PoolRecord<D::DescriptorPool> {
        self.descriptors.record(category)
    }

    pub fn buffer_state(&self, kind: BufferKind) -> CapacityState {
        self.buffers.state(kind)
    }

    pub fn buffer_handle(&self, kind: BufferKind) -> D::Buffer {
        self.buffers.handle(kind)
    }

    pub fn stats(&self) -> RendererStats {
        RendererStats {
            assets: self.registry.asset_count(),
            textures: self.textures.len(),
            uniform_blocks: self.registry.uniform_block_count(),
            main_buffer: self.buffers.state(BufferKind::Main),
            uniform_buffer: self.buffers.state(BufferKind::Uniform),
            staging_buffer: self.buffers.state(BufferKind::Staging),
            texture_memory_capacity: self.textures.memory_capacity(),
            texture_memory_used: self.textures.memory_used(),
            pools: AssetCategory::ALL
                .into_iter()
                .map(|category| {
                    let record = self.descriptors.record(category);
                    PoolStats {
                        category,
                        capacity: record.capacity,
                        live_count: record.live_count,
                        generation: record.generation,
                    }
                })
                .collect(),
        }
    }

    // ================= ASSETS ===============

    /// Uploads an asset's vertex and index streams, reserves its uniform
    /// block and gives it a descriptor set. `texture` is only used by mapped
    /// categories; an absent or stale handle samples the missing texture.
    pub fn submit_asset(
        &mut self,
        vertices: &VertexBlob,
        indices: &[u32],
        category: AssetCategory,
        texture: Option<TextureHandle>,
    ) -> Result<AssetHandle> {
        let streams = mesh::prepare(vertices, indices, category)?;

        let mut placed = Vec::with_capacity(4);
        let offsets = self.place_streams(
            [
                Some(streams.position),
                streams.texcoord,
                streams.normal,
                Some(streams.index),
            ],
            &mut placed,
        );
        let offsets = match offsets {
            Ok(offsets) => offsets,
            Err(e) => {
                for offset in placed {
                    self.main_arena.free(offset)?;
                }
                return Err(e);
            }
        };
        let main_buffer_offsets = MainBufferOffsets {
            position: offsets[0].unwrap_or_default(),
            texcoord: offsets[1],
            normal: offsets[2],
            index: offsets[3].unwrap_or_default(),
        };

        let uniform_offset = match self.place_uniform(category.uniform_block_size()) {
            Ok(offset) => offset,
            Err(e) => {
                for offset in main_buffer_offsets.regions() {
                    self.main_arena.free(offset)?;
                }
                return Err(e);
            }
        };

        let asset_id = self.registry.next_asset_handle();
        self.registry.insert_asset(AssetBinding {
            asset_id,
            category,
            main_buffer_offsets,
            uniform_offset,
            index_count: streams.index_count,
            texture: texture.filter(|_| category.is_mapped()),
            descriptor_set_handle: None,
            is_descriptor_allocated: false,
        });

        if let Err(e) = self.issue_descriptor_sets(category) {
            self.discard_asset(asset_id)?;
            return Err(e);
        }
        self.frames.mark_all_dirty();

        log::debug!(
            "{category} asset {} submitted: {} indices, uniform block at {uniform_offset}",
            asset_id.id(),
            streams.index_count
        );
        Ok(asset_id)
    }

    /// Releases an asset's buffer regions and descriptor set.
    pub fn remove_asset(&mut self, handle: AssetHandle) -> Result<()> {
        self.registry.asset(handle)?;
        // Freed regions may be reused while a submitted frame still reads them.
        self.wait_for_submitted_frames()?;

        let category = self.discard_asset(handle)?;
        self.frames.mark_all_dirty();

        log::debug!("{category} asset {} removed", handle.id());
        Ok(())
    }

    /// Drops a binding and returns its regions and set.
    fn discard_asset(&mut self, handle: AssetHandle) -> Result<AssetCategory> {
        let mut binding = self.registry.remove_asset(handle)?;
        for offset in binding.main_buffer_offsets.regions() {
            self.main_arena.free(offset)?;
        }
        self.uniforms.free_uniform(binding.uniform_offset)?;
        self.sync_high_water();
        self.descriptors.free_set(&mut self.device, &mut binding)?;
        Ok(binding.category)
    }

    /// Writes `bytes` into the asset's uniform block at `offset`.
    pub fn update_uniform(&mut self, handle: AssetHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        let binding = self.registry.asset(handle)?;
        let block_size = binding.category.uniform_block_size();
        check_uniform_bounds(offset, bytes.len(), block_size)?;
        let target = binding.uniform_offset + offset;
        self.buffers
            .write(&mut self.device, BufferKind::Uniform, target, bytes)
    }

    // ================= TEXTURES ===============

    /// Uploads RGBA8 pixels and returns a handle mapped assets can sample.
    pub fn submit_texture(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<TextureHandle> {
        let handle = self
            .textures
            .upload(&mut self.device, &mut self.buffers, pixels, width, height)?;
        self.refresh_descriptors()?;
        Ok(handle)
    }

    /// Destroys a texture. Assets still referring to it sample the missing
    /// texture from then on.
    pub fn remove_texture(&mut self, handle: TextureHandle) -> Result<()> {
        if !self.textures.contains(handle) || self.textures.missing_handle() == Some(handle) {
            return Err(handle.invalid());
        }
        self.wait_for_submitted_frames()?;
        self.textures.remove(&mut self.device, handle)?;

        let users: Vec<_> = self
            .registry
            .assets()
            .filter(|b| b.texture == Some(handle) && b.is_descriptor_allocated)
            .map(|b| b.asset_id)
            .collect();
        for asset_id in &users {
            let binding = self.registry.asset(*asset_id)?;
            let (category, uniform_offset) = (binding.category, binding.uniform_offset);
            let write = self.descriptor_write(category, uniform_offset, Some(handle))?;
            let binding = self.registry.asset(*asset_id)?;
            self.descriptors.refresh_set(&mut self.device, binding, &write);
        }
        self.refresh_descriptors()?;
        if !users.is_empty() {
            self.frames.mark_all_dirty();
        }

        log::debug!(
            "texture {} removed, {} assets fall back to the missing texture",
            handle.id(),
            users.len()
        );
        Ok(())
    }

    // ================= UNIFORM BLOCKS ===============

    /// Reserves a free-standing uniform block (camera, light, ...) of `size`
    /// bytes, zero-filled.
    pub fn allocate_uniform_block(&mut self, size: u64) -> Result<UniformBlockHandle> {
        let offset = self.place_uniform(size)?;
        Ok(self
            .registry
            .insert_uniform_block(UniformBlock { offset, size }))
    }

    pub fn update_uniform_block(
        &mut self,
        handle: UniformBlockHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let block = self.registry.uniform_block(handle)?;
        check_uniform_bounds(offset, bytes.len(), block.size)?;
        self.buffers.write(
            &mut self.device,
            BufferKind::Uniform,
            block.offset + offset,
            bytes,
        )
    }

    pub fn free_uniform_block(&mut self, handle: UniformBlockHandle) -> Result<()> {
        self.registry.uniform_block(handle)?;
        self.wait_for_submitted_frames()?;
        let block = self.registry.remove_uniform_block(handle)?;
        self.uniforms.free_uniform(block.offset)?;
        self.sync_high_water();
        Ok(())
    }

    // ================= PLACEMENT ===============

    fn place_streams(
        &mut self,
        streams: [Option<&[u8]>; 4],
        placed: &mut Vec<u64>,
    ) -> Result<[Option<u64>; 4]> {
        let mut offsets = [None; 4];
        for (slot, bytes) in offsets.iter_mut().zip(streams) {
            if let Some(bytes) = bytes {
                let offset = self.place_main(bytes)?;
                placed.push(offset);
                *slot = Some(offset);
            }
        }
        Ok(offsets)
    }

    /// Places `bytes` in the main buffer, growing it when no gap fits.
    fn place_main(&mut self, bytes: &[u8]) -> Result<u64> {
        let size = bytes.len() as u64;
        let offset = match self.main_arena.allocate(size, MAIN_BUFFER_ALIGNMENT) {
            Some(offset) => offset,
            None => {
                let required = self.main_arena.required_capacity(size, MAIN_BUFFER_ALIGNMENT);
                self.grow(BufferKind::Main, required)?;
                self.main_arena
                    .allocate(size, MAIN_BUFFER_ALIGNMENT)
                    .ok_or(RendererError::OutOfDeviceMemory {
                        what: "main buffer",
                    })?
            }
        };

        if let Err(e) = self
            .buffers
            .write(&mut self.device, BufferKind::Main, offset, bytes)
        {
            self.main_arena.free(offset)?;
            return Err(e);
        }
        Ok(offset)
    }

    /// Reserves a zero-filled uniform block, growing the uniform buffer when
    /// no gap fits.
    fn place_uniform(&mut self, size: u64) -> Result<u64> {
        let offset = match self.uniforms.allocate_uniform(size) {
            Some(offset) => offset,
            None => {
                let required = self.uniforms.required_capacity(size);
                self.grow(BufferKind::Uniform, required)?;
                self.refresh_descriptors()?;
                self.uniforms
                    .allocate_uniform(size)
                    .ok_or(RendererError::OutOfDeviceMemory {
                        what: "uniform buffer",
                    })?
            }
        };

        let zeroes = vec![0u8; self.uniforms.block_size(size) as usize];
        if let Err(e) = self
            .buffers
            .write(&mut self.device, BufferKind::Uniform, offset, &zeroes)
        {
            self.uniforms.free_uniform(offset)?;
            return Err(e);
        }
        Ok(offset)
    }

    fn grow(&mut self, kind: BufferKind, required: u64) -> Result<()> {
        if !self.buffers.request_capacity(&mut self.device, kind, required)? {
            return Ok(());
        }
        let capacity = self.buffers.state(kind).capacity;
        match kind {
            BufferKind::Main => self.main_arena.set_capacity(capacity),
            BufferKind::Uniform => self.uniforms.set_capacity(capacity),
            BufferKind::Staging => {}
        }
        // Recorded command buffers bind the old handle.
        self.frames.mark_all_dirty();
        Ok(())
    }

    fn sync_high_water(&mut self) {
        self.buffers
            .set_high_water(BufferKind::Main, self.main_arena.high_water());
        self.buffers
            .set_high_water(BufferKind::Uniform, self.uniforms.arena().high_water());
    }

    // ================= DESCRIPTORS ===============

    fn descriptor_write(
        &mut self,
        category: AssetCategory,
        uniform_offset: u64,
        texture: Option<TextureHandle>,
    ) -> Result<DescriptorWrite<D>> {
        let image = if category.is_mapped() {
            let handle = self
                .textures
                .resolve(&mut self.device, &mut self.buffers, texture)?;
            let texture = self.textures.get(handle).ok_or_else(|| handle.invalid())?;
            Some((texture.image_view, texture.sampler))
        } else {
            None
        };
        Ok(DescriptorWrite {
            uniform_buffer: self.buffers.handle(BufferKind::Uniform),
            uniform_offset,
            uniform_range: category.uniform_block_size(),
            image,
        })
    }

    /// Sizes the category pool for its live assets and gives the newcomers
    /// their sets.
    fn issue_descriptor_sets(&mut self, category: AssetCategory) -> Result<()> {
        let required = self.registry.count_in(category);
        self.descriptors.ensure_capacity(
            &mut self.device,
            category,
            required,
            self.registry.assets_mut(),
        )?;
        self.allocate_pending_sets(category)?;
        self.refresh_descriptors()
    }

    /// Gives every asset of `category` without a set a fresh one, e.g. after
    /// its pool was recreated.
    fn allocate_pending_sets(&mut self, category: AssetCategory) -> Result<()> {
        let pending: Vec<_> = self
            .registry
            .assets()
            .filter(|b| b.category == category && !b.is_descriptor_allocated)
            .map(|b| (b.asset_id, b.uniform_offset, b.texture))
            .collect();

        for (asset_id, uniform_offset, texture) in pending {
            let write = self.descriptor_write(category, uniform_offset, texture)?;
            let binding = self.registry.asset_mut(asset_id)?;
            self.descriptors
                .allocate_set(&mut self.device, binding, &write)?;
        }
        Ok(())
    }

    fn current_epoch(&self) -> DescriptorEpoch {
        (
            self.buffers.generation(BufferKind::Uniform),
            self.textures.generation(),
        )
    }

    /// Rewrites every allocated set once the uniform buffer or the texture
    /// memory block has been replaced.
    fn refresh_descriptors(&mut self) -> Result<()> {
        while self.descriptor_epoch != self.current_epoch() {
            let target = self.current_epoch();
            let allocated: Vec<_> = self
                .registry
                .assets()
                .filter(|b| b.is_descriptor_allocated)
                .map(|b| (b.asset_id, b.category, b.uniform_offset, b.texture))
                .collect();

            let mut writes = Vec::with_capacity(allocated.len());
            for (asset_id, category, uniform_offset, texture) in allocated {
                writes.push((asset_id, self.descriptor_write(category, uniform_offset, texture)?));
            }
            // Creating the missing texture may have moved the block again.
            if self.current_epoch() != target {
                continue;
            }

            for (asset_id, write) in &writes {
                let binding = self.registry.asset(*asset_id)?;
                self.descriptors.refresh_set(&mut self.device, binding, write);
            }
            self.descriptor_epoch = target;
            self.frames.mark_all_dirty();
            log::debug!("{} descriptor sets rewritten", writes.len());
        }
        Ok(())
    }
}

fn check_uniform_bounds(offset: u64, len: usize, block_size: u64) -> Result<()> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= block_size => Ok(()),
        _ => Err(RendererError::UniformOutOfBounds {
            offset,
            len,
            block_size,
        }),
    }
}

impl<D: GpuDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("device did not go idle before teardown: {e}");
        }
        self.descriptors.destroy(&mut self.device);
        self.textures.destroy(&mut self.device);
        self.buffers.destroy(&mut self.device);
        log::debug!("renderer resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::lin_alg::{Vector2, Vector3},
        renderer::{
            headless::{HeadlessDevice, HostDescriptorWrite},
            HandleKind,
        },
    };

    fn renderer_with(config: RendererConfig) -> Renderer<HeadlessDevice> {
        let device = HeadlessDevice::new(DeviceLimits::default(), config.frame_count());
        Renderer::new(device, &config).unwrap()
    }

    fn renderer() -> Renderer<HeadlessDevice> {
        renderer_with(RendererConfig::default())
    }

    fn quad() -> VertexBlob {
        VertexBlob::flat(vec![
            Vector2::new(-0.5, -0.5),
            Vector2::new(0.5, -0.5),
            Vector2::new(0.5, 0.5),
            Vector2::new(-0.5, 0.5),
        ])
        .with_texcoords(vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.0, 1.0),
        ])
    }

    const QUAD: [u32; 6] = [0, 1, 2, 2, 3, 0];

    fn cube_face() -> VertexBlob {
        VertexBlob::spatial(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 0.0),
        ])
        .with_texcoords(vec![Vector2::new(0.0, 0.0); 3])
        .with_normals(vec![Vector3::new(0.0, 0.0, 1.0); 3])
    }

    fn checker(size: u32) -> Vec<u8> {
        (0..size * size * 4).map(|i| (i % 256) as u8).collect()
    }

    fn write_of(renderer: &Renderer<HeadlessDevice>, asset: AssetHandle) -> HostDescriptorWrite {
        let set = renderer.asset(asset).unwrap().descriptor_set_handle.unwrap();
        renderer.device().descriptor_write(set).unwrap()
    }

    #[test]
    fn submitted_asset_is_uploaded_and_bound() {
        let mut renderer = renderer();
        let asset = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();

        let binding = renderer.asset(asset).unwrap().clone();
        assert!(binding.is_descriptor_allocated);
        assert_eq!(binding.index_count, 6);
        assert_eq!(binding.main_buffer_offsets.position, 0);
        assert_eq!(binding.main_buffer_offsets.texcoord, None);
        assert_eq!(binding.main_buffer_offsets.index, 32);
        assert_eq!(binding.uniform_offset % 256, 0);

        let main = renderer.buffer_handle(BufferKind::Main);
        let indices = renderer.device().read_buffer(main, 32, 24).unwrap();
        assert_eq!(indices, bytemuck::cast_slice::<u32, u8>(&QUAD));

        let write = write_of(&renderer, asset);
        assert_eq!(write.uniform_offset, binding.uniform_offset);
        assert_eq!(write.uniform_range, 64);
        assert_eq!(write.image, None);
        assert!(renderer.missing_texture().is_none());
    }

    #[test]
    fn uniform_offsets_follow_device_alignment() {
        let mut renderer = renderer();
        let offsets: Vec<_> = (0..4)
            .map(|_| {
                let asset = renderer
                    .submit_asset(&cube_face(), &[0, 1, 2], AssetCategory::Mapped3D, None)
                    .unwrap();
                renderer.asset(asset).unwrap().uniform_offset
            })
            .collect();
        assert_eq!(offsets, [0, 256, 512, 768]);
    }

    #[test]
    fn pool_overflow_reissues_every_set_of_the_category() {
        let mut renderer = renderer();
        let ui = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Ui, None)
            .unwrap();
        let ui_set = renderer.asset(ui).unwrap().descriptor_set_handle;

        let assets: Vec<_> = (0..33)
            .map(|_| {
                renderer
                    .submit_asset(&cube_face(), &[0, 1, 2], AssetCategory::Mapped3D, None)
                    .unwrap()
            })
            .collect();

        let record = renderer.descriptor_pool(AssetCategory::Mapped3D);
        assert_eq!(record.capacity, 48);
        assert_eq!(record.live_count, 33);
        for &asset in &assets {
            let binding = renderer.asset(asset).unwrap();
            assert!(binding.is_descriptor_allocated);
            assert!(renderer
                .device()
                .is_live_set(binding.descriptor_set_handle.unwrap()));
        }
        assert_eq!(renderer.asset(ui).unwrap().descriptor_set_handle, ui_set);
    }

    #[test]
    fn main_buffer_grows_without_moving_assets() {
        let mut renderer = renderer_with(RendererConfig {
            main_buffer_capacity: 64,
            ..RendererConfig::default()
        });
        let first = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None)
            .unwrap();
        let before = renderer.asset(first).unwrap().main_buffer_offsets;
        let old_main = renderer.buffer_handle(BufferKind::Main);

        renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None)
            .unwrap();

        let main = renderer.buffer_handle(BufferKind::Main);
        assert_ne!(main, old_main);
        assert!(!renderer.device().is_live_buffer(old_main));
        assert_eq!(renderer.asset(first).unwrap().main_buffer_offsets, before);
        let indices = renderer.device().read_buffer(main, before.index, 24).unwrap();
        assert_eq!(indices, bytemuck::cast_slice::<u32, u8>(&QUAD));
    }

    #[test]
    fn uniform_regrow_rewrites_live_sets() {
        let mut renderer = renderer_with(RendererConfig {
            uniform_buffer_capacity: 256,
            ..RendererConfig::default()
        });
        let first = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();
        renderer.update_uniform(first, 0, &[7; 64]).unwrap();
        let old_uniform = renderer.buffer_handle(BufferKind::Uniform);

        let second = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();

        let uniform = renderer.buffer_handle(BufferKind::Uniform);
        assert_ne!(uniform, old_uniform);
        assert_eq!(write_of(&renderer, first).uniform_buffer, uniform);
        assert_eq!(write_of(&renderer, second).uniform_buffer, uniform);
        assert_eq!(
            renderer.device().read_buffer(uniform, 0, 64),
            Some(&[7u8; 64][..])
        );
    }

    #[test]
    fn removed_regions_are_reused() {
        let mut renderer = renderer();
        let a = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();
        renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();
        let a_binding = renderer.asset(a).unwrap().clone();

        renderer.remove_asset(a).unwrap();
        assert_eq!(renderer.descriptor_pool(AssetCategory::Unmapped2D).live_count, 1);
        assert!(matches!(
            renderer.remove_asset(a),
            Err(RendererError::InvalidHandle {
                kind: HandleKind::Asset,
                ..
            })
        ));

        let c = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();
        let c_binding = renderer.asset(c).unwrap();
        assert_eq!(
            c_binding.main_buffer_offsets,
            a_binding.main_buffer_offsets
        );
        assert_eq!(c_binding.uniform_offset, a_binding.uniform_offset);
    }

    #[test]
    fn uniform_writes_stay_inside_the_block() {
        let mut renderer = renderer();
        let asset = renderer
            .submit_asset(&cube_face(), &[0, 1, 2], AssetCategory::Unmapped3D, None)
            .unwrap();
        let offset = renderer.asset(asset).unwrap().uniform_offset;

        renderer.update_uniform(asset, 100, &[3; 12]).unwrap();
        let uniform = renderer.buffer_handle(BufferKind::Uniform);
        assert_eq!(
            renderer.device().read_buffer(uniform, offset + 100, 12),
            Some(&[3u8; 12][..])
        );

        assert!(matches!(
            renderer.update_uniform(asset, 100, &[3; 13]),
            Err(RendererError::UniformOutOfBounds {
                block_size: 112,
                ..
            })
        ));
        assert!(renderer.update_uniform(asset, u64::MAX, &[1]).is_err());
    }

    #[test]
    fn mapped_assets_sample_their_texture_or_the_placeholder() {
        let mut renderer = renderer();
        let texture = renderer.submit_texture(&checker(32), 32, 32).unwrap();
        let textured = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, Some(texture))
            .unwrap();
        let bare = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None)
            .unwrap();

        let view = renderer.texture(texture).unwrap().image_view;
        assert_eq!(write_of(&renderer, textured).image.map(|(v, _)| v), Some(view));

        let missing = renderer.missing_texture().unwrap();
        let missing_view = renderer.texture(missing).unwrap().image_view;
        assert_eq!(write_of(&renderer, bare).image.map(|(v, _)| v), Some(missing_view));

        renderer.remove_texture(texture).unwrap();
        assert_eq!(
            write_of(&renderer, textured).image.map(|(v, _)| v),
            Some(missing_view)
        );
        assert!(renderer.remove_texture(texture).is_err());
        assert!(renderer.remove_texture(missing).is_err());
    }

    #[test]
    fn texture_block_reallocation_refreshes_sets() {
        let mut renderer = renderer_with(RendererConfig {
            texture_memory_capacity: 32 << 10,
            ..RendererConfig::default()
        });
        let small = renderer.submit_texture(&checker(16), 16, 16).unwrap();
        let asset = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Ui, Some(small))
            .unwrap();
        let old_view = renderer.texture(small).unwrap().image_view;

        renderer.submit_texture(&checker(256), 256, 256).unwrap();

        let new_view = renderer.texture(small).unwrap().image_view;
        assert_ne!(new_view, old_view);
        assert_eq!(write_of(&renderer, asset).image.map(|(v, _)| v), Some(new_view));
    }

    #[test]
    fn uniform_blocks_are_independent_of_assets() {
        let mut renderer = renderer();
        let camera = renderer.allocate_uniform_block(128).unwrap();
        let light = renderer.allocate_uniform_block(32).unwrap();
        assert_eq!(renderer.uniform_block(camera).unwrap().offset, 0);
        assert_eq!(renderer.uniform_block(light).unwrap().offset, 256);

        renderer.update_uniform_block(light, 16, &[5; 16]).unwrap();
        assert!(renderer.update_uniform_block(light, 17, &[5; 16]).is_err());

        renderer.free_uniform_block(camera).unwrap();
        assert!(matches!(
            renderer.update_uniform_block(camera, 0, &[0]),
            Err(RendererError::InvalidHandle {
                kind: HandleKind::UniformBlock,
                ..
            })
        ));
        let asset = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Unmapped2D, None)
            .unwrap();
        assert_eq!(renderer.asset(asset).unwrap().uniform_offset, 0);
    }

    #[test]
    fn invalid_meshes_leave_no_trace() {
        let mut renderer = renderer();
        assert!(matches!(
            renderer.submit_asset(&quad(), &QUAD, AssetCategory::Mapped3D, None),
            Err(RendererError::InvalidMesh { .. })
        ));
        let stats = renderer.stats();
        assert_eq!(stats.assets, 0);
        assert_eq!(stats.main_buffer.used_high_water, 0);
    }

    #[test]
    fn failed_set_issue_unregisters_the_asset() {
        let mut renderer = renderer();
        // Room for the buffers but not for the texture block the
        // placeholder needs.
        renderer.device_mut().set_memory_budget(Some(4 << 20));
        assert!(matches!(
            renderer.submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None),
            Err(RendererError::OutOfDeviceMemory { .. })
        ));

        let stats = renderer.stats();
        assert_eq!(stats.assets, 0);
        assert_eq!(stats.main_buffer.used_high_water, 0);
        assert_eq!(stats.uniform_buffer.used_high_water, 0);
        renderer.draw().unwrap();

        renderer.device_mut().set_memory_budget(None);
        let asset = renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None)
            .unwrap();
        assert!(renderer.asset(asset).unwrap().is_descriptor_allocated);
        renderer.draw().unwrap();
    }

    #[test]
    fn stats_report_every_manager() {
        let mut renderer = renderer();
        renderer.submit_texture(&checker(8), 8, 8).unwrap();
        renderer
            .submit_asset(&quad(), &QUAD, AssetCategory::Mapped2D, None)
            .unwrap();
        renderer.allocate_uniform_block(64).unwrap();

        let stats = renderer.stats();
        assert_eq!(stats.assets, 1);
        // The uploaded texture plus the placeholder.
        assert_eq!(stats.textures, 2);
        assert_eq!(stats.uniform_blocks, 1);
        assert_eq!(stats.main_buffer.used_high_water, 88);
        assert_eq!(stats.uniform_buffer.used_high_water, 512);
        assert_eq!(stats.pools.len(), AssetCategory::ALL.len());
        let mapped = stats
            .pools
            .iter()
            .find(|p| p.category == AssetCategory::Mapped2D)
            .unwrap();
        assert_eq!((mapped.capacity, mapped.live_count), (32, 1));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["assets"], 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = HeadlessDevice::new(DeviceLimits::default(), 2);
        let config = RendererConfig {
            main_buffer_capacity: 0,
            ..RendererConfig::default()
        };
        assert!(matches!(
            Renderer::new(device, &config),
            Err(RendererError::Config(_))
        ));
    }
}
