//! A `GpuDevice` that keeps every resource in host memory.
//!
//! Submissions complete when their fence is waited on, draws are recorded as
//! plain data and buffer contents can be read back, which is what the unit
//! tests and `--headless` runs rely on. Allocation failure and device loss
//! can be injected.

use std::collections::{HashMap, HashSet};

use ash::vk;

use super::{
    device::{
        AcquireOutcome, DescriptorWrite, FrameRecording, GpuDevice, ImageFootprint,
        PresentOutcome,
    },
    utilities::{AssetCategory, BufferKind, DeviceLimits},
    RendererError, Result,
};

const IMAGE_ALIGNMENT: u64 = 256;

/// Opaque id standing in for every kind of GPU handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(u64);

/// The write last applied to a descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDescriptorWrite {
    pub uniform_buffer: HostHandle,
    pub uniform_offset: u64,
    pub uniform_range: u64,
    pub image: Option<(HostHandle, HostHandle)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostImageLayout {
    Undefined,
    ShaderReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostImage {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub memory: Option<(HostHandle, u64)>,
    pub layout: HostImageLayout,
}

/// Counters of notable device events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub idle_waits: u32,
    pub buffer_copies: u32,
    pub pools_created: u32,
    pub pools_destroyed: u32,
    pub recordings: u32,
    pub submissions: u32,
    pub presents: u32,
    pub swapchain_recreations: u32,
    /// Buffers or pools destroyed while a submitted frame was still pending.
    pub destroyed_while_in_flight: u32,
}

struct HostBuffer {
    kind: BufferKind,
    bytes: Vec<u8>,
}

struct HostPool {
    category: AssetCategory,
    max_sets: u32,
    sets: HashSet<HostHandle>,
}

/// Device calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateImage,
    CreateSampler,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Pending,
}

struct HostSlot {
    fence: FenceState,
    recorded: Option<(u32, FrameRecording<HostHandle, HostHandle>)>,
}

pub struct HeadlessDevice {
    limits: DeviceLimits,
    next_id: u64,

    buffers: HashMap<HostHandle, HostBuffer>,
    pools: HashMap<HostHandle, HostPool>,
    sets: HashMap<HostHandle, Option<HostDescriptorWrite>>,
    memories: HashMap<HostHandle, u64>,
    images: HashMap<HostHandle, HostImage>,
    views: HashSet<HostHandle>,
    samplers: HashSet<HostHandle>,

    slots: Vec<HostSlot>,
    extent: vk::Extent2D,
    next_image: u32,
    out_of_date_once: bool,

    memory_budget: Option<u64>,
    /// Calls left to succeed before each armed fault fires.
    faults: HashMap<Fault, u32>,
    device_lost: bool,
    stats: HeadlessStats,
}

impl HeadlessDevice {
    pub fn new(limits: DeviceLimits, frames_in_flight: usize) -> Self {
        Self {
            limits,
            next_id: 1,
            buffers: HashMap::new(),
            pools: HashMap::new(),
            sets: HashMap::new(),
            memories: HashMap::new(),
            images: HashMap::new(),
            views: HashSet::new(),
            samplers: HashSet::new(),
            slots: (0..frames_in_flight.max(1))
                .map(|_| HostSlot {
                    fence: FenceState::Signaled,
                    recorded: None,
                })
                .collect(),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            next_image: 0,
            out_of_date_once: false,
            memory_budget: None,
            faults: HashMap::new(),
            device_lost: false,
            stats: HeadlessStats::default(),
        }
    }

    /// Caps the total bytes of live buffers and memory blocks; allocations
    /// past the cap fail with `OutOfDeviceMemory`.
    pub fn set_memory_budget(&mut self, budget: Option<u64>) {
        self.memory_budget = budget;
    }

    /// Lets `after` more calls of `fault` succeed, then fails the next one
    /// with `OutOfDeviceMemory`.
    pub fn inject_fault(&mut self, fault: Fault, after: u32) {
        self.faults.insert(fault, after);
    }

    /// Every later call fails with `DeviceLost`.
    pub fn lose_device(&mut self) {
        self.device_lost = true;
    }

    /// The next acquire reports an out-of-date swapchain.
    pub fn invalidate_swapchain(&mut self) {
        self.out_of_date_once = true;
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    pub fn read_buffer(&self, buffer: HostHandle, offset: u64, len: u64) -> Option<&[u8]> {
        let bytes = &self.buffers.get(&buffer)?.bytes;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        bytes.get(start..end)
    }

    pub fn buffer_size(&self, buffer: HostHandle) -> Option<u64> {
        self.buffers.get(&buffer).map(|b| b.bytes.len() as u64)
    }

    pub fn is_live_buffer(&self, buffer: HostHandle) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_capacity(&self, pool: HostHandle) -> Option<u32> {
        self.pools.get(&pool).map(|p| p.max_sets)
    }

    pub fn descriptor_write(&self, set: HostHandle) -> Option<HostDescriptorWrite> {
        self.sets.get(&set).copied().flatten()
    }

    pub fn is_live_set(&self, set: HostHandle) -> bool {
        self.sets.contains_key(&set)
    }

    pub fn image(&self, image: HostHandle) -> Option<HostImage> {
        self.images.get(&image).copied()
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    pub fn live_view_count(&self) -> usize {
        self.views.len()
    }

    pub fn live_sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn live_memory_count(&self) -> usize {
        self.memories.len()
    }

    pub fn recorded_frame(
        &self,
        slot: usize,
    ) -> Option<&(u32, FrameRecording<HostHandle, HostHandle>)> {
        self.slots.get(slot)?.recorded.as_ref()
    }

    fn next_handle(&mut self) -> HostHandle {
        let handle = HostHandle(self.next_id);
        self.next_id += 1;
        handle
    }

    fn trip(&mut self, fault: Fault, what: &'static str) -> Result<()> {
        match self.faults.get_mut(&fault) {
            Some(0) => {
                self.faults.remove(&fault);
                Err(RendererError::OutOfDeviceMemory { what })
            }
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_device(&self) -> Result<()> {
        if self.device_lost {
            Err(RendererError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.buffers
            .values()
            .map(|b| b.bytes.len() as u64)
            .chain(self.memories.values().copied())
            .sum()
    }

    fn reserve(&self, size: u64, what: &'static str) -> Result<()> {
        match self.memory_budget {
            Some(budget) if self.allocated_bytes() + size > budget => {
                Err(RendererError::OutOfDeviceMemory { what })
            }
            _ => Ok(()),
        }
    }

    fn any_in_flight(&self) -> bool {
        self.slots.iter().any(|s| s.fence == FenceState::Pending)
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut HostSlot> {
        self.slots
            .get_mut(slot)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }
}

impl GpuDevice for HeadlessDevice {
    type Buffer = HostHandle;
    type DescriptorPool = HostHandle;
    type DescriptorSet = HostHandle;
    type Memory = HostHandle;
    type Image = HostHandle;
    type ImageView = HostHandle;
    type Sampler = HostHandle;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> Result<HostHandle> {
        self.check_device()?;
        self.reserve(size, "buffer")?;
        let handle = self.next_handle();
        self.buffers.insert(
            handle,
            HostBuffer {
                kind,
                bytes: vec![0; size as usize],
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: HostHandle) {
        if self.any_in_flight() {
            self.stats.destroyed_while_in_flight += 1;
        }
        self.buffers.remove(&buffer);
    }

    fn write_buffer(&mut self, buffer: HostHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_device()?;
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        if !target.kind.is_host_visible() {
            return Err(RendererError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let start = offset as usize;
        let dst = target
            .bytes
            .get_mut(start..start + bytes.len())
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: HostHandle,
        dst: HostHandle,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        self.check_device()?;
        for region in regions {
            let chunk = self
                .read_buffer(src, region.src_offset, region.size)
                .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?
                .to_vec();
            let target = self
                .buffers
                .get_mut(&dst)
                .and_then(|b| {
                    let start = region.dst_offset as usize;
                    b.bytes.get_mut(start..start + chunk.len())
                })
                .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
            target.copy_from_slice(&chunk);
        }
        self.stats.buffer_copies += 1;
        Ok(())
    }

    fn create_descriptor_pool(
        &mut self,
        category: AssetCategory,
        max_sets: u32,
    ) -> Result<HostHandle> {
        self.check_device()?;
        let handle = self.next_handle();
        self.pools.insert(
            handle,
            HostPool {
                category,
                max_sets,
                sets: HashSet::new(),
            },
        );
        self.stats.pools_created += 1;
        Ok(handle)
    }

    fn destroy_descriptor_pool(&mut self, pool: HostHandle) {
        if self.any_in_flight() {
            self.stats.destroyed_while_in_flight += 1;
        }
        if let Some(pool) = self.pools.remove(&pool) {
            for set in pool.sets {
                self.sets.remove(&set);
            }
            self.stats.pools_destroyed += 1;
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: HostHandle,
        category: AssetCategory,
    ) -> Result<HostHandle> {
        self.check_device()?;
        let handle = self.next_handle();
        let host_pool = self
            .pools
            .get_mut(&pool)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        if host_pool.category != category {
            return Err(RendererError::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED));
        }
        if host_pool.sets.len() as u32 >= host_pool.max_sets {
            return Err(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        host_pool.sets.insert(handle);
        self.sets.insert(handle, None);
        Ok(handle)
    }

    fn free_descriptor_set(&mut self, pool: HostHandle, set: HostHandle) -> Result<()> {
        self.check_device()?;
        let host_pool = self
            .pools
            .get_mut(&pool)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        host_pool.sets.remove(&set);
        self.sets.remove(&set);
        Ok(())
    }

    fn write_descriptor_set(&mut self, set: HostHandle, write: &DescriptorWrite<Self>) {
        if let Some(slot) = self.sets.get_mut(&set) {
            *slot = Some(HostDescriptorWrite {
                uniform_buffer: write.uniform_buffer,
                uniform_offset: write.uniform_offset,
                uniform_range: write.uniform_range,
                image: write.image,
            });
        }
    }

    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<(HostHandle, ImageFootprint)> {
        self.check_device()?;
        self.trip(Fault::CreateImage, "image")?;
        let handle = self.next_handle();
        self.images.insert(
            handle,
            HostImage {
                width,
                height,
                mip_levels,
                memory: None,
                layout: HostImageLayout::Undefined,
            },
        );

        // Full mip chain of RGBA8 texels.
        let size: u64 = (0..mip_levels)
            .map(|level| {
                let w = (width >> level).max(1) as u64;
                let h = (height >> level).max(1) as u64;
                w * h * 4
            })
            .sum();
        Ok((
            handle,
            ImageFootprint {
                size,
                alignment: IMAGE_ALIGNMENT,
                memory_type_bits: 1,
            },
        ))
    }

    fn allocate_image_memory(&mut self, size: u64, _memory_type_bits: u32) -> Result<HostHandle> {
        self.check_device()?;
        self.reserve(size, "image memory")?;
        let handle = self.next_handle();
        self.memories.insert(handle, size);
        Ok(handle)
    }

    fn free_image_memory(&mut self, memory: HostHandle) {
        self.memories.remove(&memory);
    }

    fn bind_image_memory(
        &mut self,
        image: HostHandle,
        memory: HostHandle,
        offset: u64,
    ) -> Result<()> {
        self.check_device()?;
        let block = *self
            .memories
            .get(&memory)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        let img = self
            .images
            .get_mut(&image)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        if offset % IMAGE_ALIGNMENT != 0 || offset >= block {
            return Err(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        img.memory = Some((memory, offset));
        Ok(())
    }

    fn upload_image(
        &mut self,
        image: HostHandle,
        staging: HostHandle,
        width: u32,
        height: u32,
        _mip_levels: u32,
    ) -> Result<()> {
        self.check_device()?;
        let needed = width as u64 * height as u64 * 4;
        if self.read_buffer(staging, 0, needed).is_none() {
            return Err(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let img = self
            .images
            .get_mut(&image)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        if img.memory.is_none() {
            return Err(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        img.layout = HostImageLayout::ShaderReadOnly;
        Ok(())
    }

    fn create_image_view(&mut self, image: HostHandle, _mip_levels: u32) -> Result<HostHandle> {
        self.check_device()?;
        if !self.images.contains_key(&image) {
            return Err(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let handle = self.next_handle();
        self.views.insert(handle);
        Ok(handle)
    }

    fn create_sampler(&mut self, _mip_levels: u32, _anisotropy: f32) -> Result<HostHandle> {
        self.check_device()?;
        self.trip(Fault::CreateSampler, "sampler")?;
        let handle = self.next_handle();
        self.samplers.insert(handle);
        Ok(handle)
    }

    fn destroy_image(
        &mut self,
        image: HostHandle,
        view: Option<HostHandle>,
        sampler: Option<HostHandle>,
    ) {
        if let Some(sampler) = sampler {
            self.samplers.remove(&sampler);
        }
        if let Some(view) = view {
            self.views.remove(&view);
        }
        self.images.remove(&image);
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.check_device()?;
        for slot in &mut self.slots {
            slot.fence = FenceState::Signaled;
        }
        self.stats.idle_waits += 1;
        Ok(())
    }

    fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.check_device()?;
        self.slot_mut(slot)?.fence = FenceState::Signaled;
        Ok(())
    }

    fn acquire_next_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        self.check_device()?;
        if std::mem::take(&mut self.out_of_date_once) {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let image_index = self.next_image;
        // One swapchain image per slot, handed out in order.
        self.next_image = (self.next_image + 1) % self.slots.len() as u32;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn record_draws(
        &mut self,
        slot: usize,
        image_index: u32,
        frame: &FrameRecording<HostHandle, HostHandle>,
    ) -> Result<()> {
        self.check_device()?;
        let host_slot = self.slot_mut(slot)?;
        if host_slot.fence == FenceState::Pending {
            // Re-recording a command buffer the GPU may still execute.
            return Err(RendererError::Vulkan(vk::Result::NOT_READY));
        }
        host_slot.recorded = Some((image_index, frame.clone()));
        self.stats.recordings += 1;
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        self.check_device()?;
        let host_slot = self.slot_mut(slot)?;
        if host_slot.recorded.is_none() {
            return Err(RendererError::Vulkan(vk::Result::NOT_READY));
        }
        host_slot.fence = FenceState::Pending;
        self.stats.submissions += 1;
        Ok(())
    }

    fn present(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        self.check_device()?;
        self.stats.presents += 1;
        Ok(PresentOutcome::Presented)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D> {
        self.check_device()?;
        self.extent = extent;
        self.next_image = 0;
        for slot in &mut self.slots {
            slot.recorded = None;
        }
        self.stats.swapchain_recreations += 1;
        Ok(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_buffer_is_not_host_visible() {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        let main = device.create_buffer(BufferKind::Main, 64).unwrap();
        let staging = device.create_buffer(BufferKind::Staging, 64).unwrap();

        assert!(device.write_buffer(main, 0, &[1, 2, 3]).is_err());
        device.write_buffer(staging, 4, &[1, 2, 3]).unwrap();
        device
            .copy_buffer(
                staging,
                main,
                &[vk::BufferCopy {
                    src_offset: 4,
                    dst_offset: 8,
                    size: 3,
                }],
            )
            .unwrap();
        assert_eq!(device.read_buffer(main, 8, 3), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn memory_budget_rejects_allocations() {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        device.set_memory_budget(Some(100));
        device.create_buffer(BufferKind::Uniform, 60).unwrap();
        assert!(matches!(
            device.create_buffer(BufferKind::Uniform, 60),
            Err(RendererError::OutOfDeviceMemory { .. })
        ));
    }

    #[test]
    fn injected_faults_fire_once() {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        device.inject_fault(Fault::CreateSampler, 1);
        device.create_sampler(1, 1.0).unwrap();
        assert!(matches!(
            device.create_sampler(1, 1.0),
            Err(RendererError::OutOfDeviceMemory { what: "sampler" })
        ));
        device.create_sampler(1, 1.0).unwrap();
        assert_eq!(device.live_sampler_count(), 2);
    }

    #[test]
    fn destroying_a_pool_frees_its_sets() {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        let pool = device
            .create_descriptor_pool(AssetCategory::Ui, 1)
            .unwrap();
        let set = device
            .allocate_descriptor_set(pool, AssetCategory::Ui)
            .unwrap();
        assert!(matches!(
            device.allocate_descriptor_set(pool, AssetCategory::Ui),
            Err(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        ));

        device.destroy_descriptor_pool(pool);
        assert!(!device.is_live_set(set));
        assert_eq!(device.live_pool_count(), 0);
    }

    #[test]
    fn lost_device_fails_every_call() {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        device.lose_device();
        assert!(matches!(
            device.create_buffer(BufferKind::Main, 16),
            Err(RendererError::DeviceLost)
        ));
        assert!(matches!(device.wait_idle(), Err(RendererError::DeviceLost)));
    }
}
