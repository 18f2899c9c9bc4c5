//! One descriptor pool per asset category.
//!
//! Vulkan pools cannot grow. When a category outgrows its pool the pool is
//! destroyed, which frees every set allocated from it, and a larger one is
//! created; every asset of that category then needs a fresh set before the
//! next frame is recorded. Categories never affect each other.

use ash::vk;

use crate::renderer::{
    device::{DescriptorWrite, GpuDevice},
    utilities::AssetCategory,
    RendererError, Result,
};

use super::AssetBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    PoolReady,
    PoolRecreating,
}

/// Pool bookkeeping of one category. `live_count <= capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRecord<P> {
    pub category: AssetCategory,
    pub pool_handle: Option<P>,
    pub capacity: u32,
    pub live_count: u32,
    pub state: PoolState,
    /// Bumped on every recreation.
    pub generation: u32,
}

pub struct DescriptorPoolManager<D: GpuDevice> {
    records: Vec<PoolRecord<D::DescriptorPool>>,
    initial_capacity: u32,
}

impl<D: GpuDevice> DescriptorPoolManager<D> {
    pub fn new(initial_capacity: u32) -> Self {
        Self {
            records: AssetCategory::ALL
                .into_iter()
                .map(|category| PoolRecord {
                    category,
                    pool_handle: None,
                    capacity: 0,
                    live_count: 0,
                    state: PoolState::Uninitialized,
                    generation: 0,
                })
                .collect(),
            initial_capacity: initial_capacity.max(1),
        }
    }

    /// Creates every category pool at the initial capacity.
    pub fn setup(&mut self, device: &mut D) -> Result<()> {
        for category in AssetCategory::ALL {
            self.create_pool(device, category, self.initial_capacity)?;
        }
        Ok(())
    }

    #[inline]
    pub fn record(&self, category: AssetCategory) -> &PoolRecord<D::DescriptorPool> {
        &self.records[category.index()]
    }

    fn create_pool(&mut self, device: &mut D, category: AssetCategory, capacity: u32) -> Result<()> {
        let pool = device.create_descriptor_pool(category, capacity)?;
        let record = &mut self.records[category.index()];
        record.pool_handle = Some(pool);
        record.capacity = capacity;
        record.live_count = 0;
        record.state = PoolState::PoolReady;
        Ok(())
    }

    /// Makes the pool of `category` hold at least `required_live_count`
    /// sets. On recreation every binding of the category passed in is marked
    /// unallocated; returns whether that happened.
    pub fn ensure_capacity<'b>(
        &mut self,
        device: &mut D,
        category: AssetCategory,
        required_live_count: u32,
        bindings: impl IntoIterator<Item = &'b mut AssetBinding<D::DescriptorSet>>,
    ) -> Result<bool>
    where
        D::DescriptorSet: 'b,
    {
        let record = self.records[category.index()];
        match record.state {
            PoolState::Uninitialized => {
                let capacity = self.initial_capacity.max(required_live_count);
                self.create_pool(device, category, capacity)?;
                return Ok(false);
            }
            _ if required_live_count <= record.capacity => return Ok(false),
            _ => {}
        }

        let capacity = (record.capacity * 3 / 2).max(required_live_count);
        self.records[category.index()].state = PoolState::PoolRecreating;

        // In-flight command buffers may still bind sets from the old pool.
        device.wait_idle()?;
        if let Some(old) = record.pool_handle {
            device.destroy_descriptor_pool(old);
        }
        self.records[category.index()].pool_handle = None;

        let mut stale = 0;
        for binding in bindings.into_iter().filter(|b| b.category == category) {
            binding.descriptor_set_handle = None;
            binding.is_descriptor_allocated = false;
            stale += 1;
        }

        self.create_pool(device, category, capacity)?;
        self.records[category.index()].generation += 1;

        log::info!(
            "{category} descriptor pool recreated: {} -> {capacity} sets, {stale} to re-issue",
            record.capacity
        );
        Ok(true)
    }

    /// Allocates a set for `binding` and writes `write` into it.
    pub fn allocate_set(
        &mut self,
        device: &mut D,
        binding: &mut AssetBinding<D::DescriptorSet>,
        write: &DescriptorWrite<D>,
    ) -> Result<()> {
        debug_assert!(!binding.is_descriptor_allocated);
        if binding.is_descriptor_allocated {
            return Ok(());
        }

        let category = binding.category;
        if self.record(category).state == PoolState::Uninitialized {
            self.create_pool(device, category, self.initial_capacity)?;
        }
        let record = &mut self.records[category.index()];
        debug_assert!(record.live_count < record.capacity);

        let Some(pool) = record.pool_handle else {
            return Err(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        };
        let set = device.allocate_descriptor_set(pool, category)?;
        device.write_descriptor_set(set, write);

        record.live_count += 1;
        binding.descriptor_set_handle = Some(set);
        binding.is_descriptor_allocated = true;

        log::debug!(
            "{category} set allocated for asset {} ({}/{})",
            binding.asset_id.id(),
            record.live_count,
            record.capacity
        );
        Ok(())
    }

    /// Rewrites the set of an allocated binding, e.g. after the uniform
    /// buffer or a texture was replaced.
    pub fn refresh_set(
        &self,
        device: &mut D,
        binding: &AssetBinding<D::DescriptorSet>,
        write: &DescriptorWrite<D>,
    ) {
        if let Some(set) = binding.descriptor_set_handle {
            device.write_descriptor_set(set, write);
        }
    }

    /// Returns the set of `binding` to its pool.
    pub fn free_set(
        &mut self,
        device: &mut D,
        binding: &mut AssetBinding<D::DescriptorSet>,
    ) -> Result<()> {
        let record = &mut self.records[binding.category.index()];
        if let (Some(set), Some(pool)) = (binding.descriptor_set_handle.take(), record.pool_handle)
        {
            device.free_descriptor_set(pool, set)?;
            record.live_count = record.live_count.saturating_sub(1);
        }
        binding.is_descriptor_allocated = false;
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut D) {
        for record in &mut self.records {
            if let Some(pool) = record.pool_handle.take() {
                device.destroy_descriptor_pool(pool);
            }
            record.live_count = 0;
            record.state = PoolState::Uninitialized;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{
        headless::{HeadlessDevice, HostHandle},
        runtime::resources::{mesh::MainBufferOffsets, AssetBinding, Registry},
        utilities::{BufferKind, DeviceLimits},
    };

    struct Fixture {
        device: HeadlessDevice,
        pools: DescriptorPoolManager<HeadlessDevice>,
        registry: Registry<HostHandle>,
        uniform: HostHandle,
    }

    impl Fixture {
        fn new(capacity: u32) -> Self {
            let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
            let uniform = device.create_buffer(BufferKind::Uniform, 1 << 16).unwrap();
            let mut pools = DescriptorPoolManager::new(capacity);
            pools.setup(&mut device).unwrap();
            Self {
                device,
                pools,
                registry: Registry::default(),
                uniform,
            }
        }

        fn write(&self, offset: u64) -> DescriptorWrite<HeadlessDevice> {
            DescriptorWrite {
                uniform_buffer: self.uniform,
                uniform_offset: offset,
                uniform_range: 112,
                image: None,
            }
        }

        /// Mirrors what the renderer does on submission.
        fn submit(&mut self, category: AssetCategory) -> bool {
            let asset_id = self.registry.next_asset_handle();
            self.registry.insert_asset(AssetBinding {
                asset_id,
                category,
                main_buffer_offsets: MainBufferOffsets {
                    position: 0,
                    texcoord: None,
                    normal: None,
                    index: 0,
                },
                uniform_offset: asset_id.id() as u64 * 256,
                index_count: 3,
                texture: None,
                descriptor_set_handle: None,
                is_descriptor_allocated: false,
            });

            let required = self.registry.count_in(category);
            let recreated = self
                .pools
                .ensure_capacity(
                    &mut self.device,
                    category,
                    required,
                    self.registry.assets_mut(),
                )
                .unwrap();
            let record = *self.pools.record(category);
            assert!(record.live_count <= record.capacity);

            let pending: Vec<_> = self
                .registry
                .assets()
                .filter(|b| b.category == category && !b.is_descriptor_allocated)
                .map(|b| b.asset_id)
                .collect();
            for id in pending {
                let write = self.write(self.registry.asset(id).unwrap().uniform_offset);
                let binding = self
                    .registry
                    .assets_mut()
                    .find(|b| b.asset_id == id)
                    .unwrap();
                self.pools
                    .allocate_set(&mut self.device, binding, &write)
                    .unwrap();
            }
            recreated
        }
    }

    #[test]
    fn setup_creates_one_pool_per_category() {
        let fixture = Fixture::new(32);
        assert_eq!(fixture.device.live_pool_count(), AssetCategory::ALL.len());
        for category in AssetCategory::ALL {
            let record = fixture.pools.record(category);
            assert_eq!(record.state, PoolState::PoolReady);
            assert_eq!(record.capacity, 32);
            assert_eq!(record.live_count, 0);
        }
    }

    #[test]
    fn overflow_recreates_pool_and_reissues_every_set() {
        let mut fixture = Fixture::new(32);
        for _ in 0..32 {
            assert!(!fixture.submit(AssetCategory::Mapped3D));
        }
        let old_pool = fixture.pools.record(AssetCategory::Mapped3D).pool_handle;
        let old_sets: Vec<_> = fixture
            .registry
            .assets()
            .map(|b| b.descriptor_set_handle.unwrap())
            .collect();

        assert!(fixture.submit(AssetCategory::Mapped3D));

        let record = *fixture.pools.record(AssetCategory::Mapped3D);
        assert_eq!(record.capacity, 48);
        assert_eq!(record.live_count, 33);
        assert_eq!(record.generation, 1);
        assert_ne!(record.pool_handle, old_pool);
        assert_eq!(
            fixture.device.pool_capacity(record.pool_handle.unwrap()),
            Some(48)
        );
        assert!(fixture
            .registry
            .assets()
            .all(|b| b.is_descriptor_allocated && b.descriptor_set_handle.is_some()));
        assert!(old_sets.iter().all(|&set| !fixture.device.is_live_set(set)));
        assert_eq!(fixture.device.stats().pools_destroyed, 1);
    }

    #[test]
    fn recreation_leaves_other_categories_alone() {
        let mut fixture = Fixture::new(2);
        fixture.submit(AssetCategory::Ui);
        let ui_set = fixture
            .registry
            .assets()
            .next()
            .unwrap()
            .descriptor_set_handle;
        let ui_pool = fixture.pools.record(AssetCategory::Ui).pool_handle;

        for _ in 0..3 {
            fixture.submit(AssetCategory::Unmapped2D);
        }

        assert_eq!(fixture.pools.record(AssetCategory::Unmapped2D).capacity, 3);
        assert_eq!(fixture.pools.record(AssetCategory::Ui).pool_handle, ui_pool);
        let ui = fixture
            .registry
            .assets()
            .find(|b| b.category == AssetCategory::Ui)
            .unwrap();
        assert_eq!(ui.descriptor_set_handle, ui_set);
        assert!(fixture.device.is_live_set(ui_set.unwrap()));
    }

    #[test]
    fn sets_point_at_the_asset_uniform_range() {
        let mut fixture = Fixture::new(4);
        fixture.submit(AssetCategory::Unmapped3D);
        let binding = fixture.registry.assets().next().unwrap();
        let write = fixture
            .device
            .descriptor_write(binding.descriptor_set_handle.unwrap())
            .unwrap();
        assert_eq!(write.uniform_buffer, fixture.uniform);
        assert_eq!(write.uniform_offset, binding.uniform_offset);
        assert_eq!(write.uniform_range, 112);
    }

    #[test]
    fn freeing_returns_the_slot() {
        let mut fixture = Fixture::new(4);
        fixture.submit(AssetCategory::Mapped2D);
        let id = fixture.registry.assets().next().unwrap().asset_id;
        let mut binding = fixture.registry.remove_asset(id).unwrap();
        let set = binding.descriptor_set_handle.unwrap();

        fixture
            .pools
            .free_set(&mut fixture.device, &mut binding)
            .unwrap();
        assert_eq!(fixture.pools.record(AssetCategory::Mapped2D).live_count, 0);
        assert!(!binding.is_descriptor_allocated);
        assert!(!fixture.device.is_live_set(set));
    }
}
