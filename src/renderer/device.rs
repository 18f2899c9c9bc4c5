//! The seam between the resource managers and the graphics API.
//!
//! Managers never touch Vulkan directly: they are handed a `GpuDevice` and
//! only ever hold the handles it returns. [`crate::renderer::base::VulkanDevice`]
//! is the real implementation, [`crate::renderer::headless::HeadlessDevice`]
//! keeps everything in host memory.

use std::{fmt, hash::Hash};

use ash::vk;

use super::{
    utilities::{AssetCategory, BufferKind, DeviceLimits},
    Result,
};

/// Size and placement rules of an image inside device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFootprint {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Outcome of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was acquired.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain should be recreated before the next frame.
    Suboptimal,
    OutOfDate,
}

/// Resources written into one descriptor set.
pub struct DescriptorWrite<D: GpuDevice + ?Sized> {
    pub uniform_buffer: D::Buffer,
    pub uniform_offset: u64,
    pub uniform_range: u64,
    /// Present for mapped categories only.
    pub image: Option<(D::ImageView, D::Sampler)>,
}

/// One indexed draw out of the main buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCommand<S> {
    pub category: AssetCategory,
    pub position_offset: u64,
    pub texcoord_offset: Option<u64>,
    pub normal_offset: Option<u64>,
    pub index_offset: u64,
    pub index_count: u32,
    pub descriptor_set: S,
}

/// Everything a slot's command buffer is recorded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecording<B, S> {
    pub main_buffer: B,
    pub draws: Vec<DrawCommand<S>>,
}

pub trait GpuDevice {
    type Buffer: Copy + Eq + Hash + fmt::Debug;
    type DescriptorPool: Copy + Eq + Hash + fmt::Debug;
    type DescriptorSet: Copy + Eq + Hash + fmt::Debug;
    type Memory: Copy + Eq + Hash + fmt::Debug;
    type Image: Copy + Eq + Hash + fmt::Debug;
    type ImageView: Copy + Eq + Hash + fmt::Debug;
    type Sampler: Copy + Eq + Hash + fmt::Debug;

    fn limits(&self) -> DeviceLimits;

    // ================= BUFFERS ===============

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> Result<Self::Buffer>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    /// Writes through the persistent mapping of a host-visible buffer.
    fn write_buffer(&mut self, buffer: Self::Buffer, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Device-to-device copy; returns once the copy has completed.
    fn copy_buffer(
        &mut self,
        src: Self::Buffer,
        dst: Self::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()>;

    // ================= DESCRIPTORS ===============

    fn create_descriptor_pool(
        &mut self,
        category: AssetCategory,
        max_sets: u32,
    ) -> Result<Self::DescriptorPool>;

    /// Destroys the pool and, implicitly, every set allocated from it.
    fn destroy_descriptor_pool(&mut self, pool: Self::DescriptorPool);

    fn allocate_descriptor_set(
        &mut self,
        pool: Self::DescriptorPool,
        category: AssetCategory,
    ) -> Result<Self::DescriptorSet>;

    fn free_descriptor_set(
        &mut self,
        pool: Self::DescriptorPool,
        set: Self::DescriptorSet,
    ) -> Result<()>;

    fn write_descriptor_set(&mut self, set: Self::DescriptorSet, write: &DescriptorWrite<Self>);

    // ================= IMAGES ===============

    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<(Self::Image, ImageFootprint)>;

    fn allocate_image_memory(&mut self, size: u64, memory_type_bits: u32)
        -> Result<Self::Memory>;

    fn free_image_memory(&mut self, memory: Self::Memory);

    fn bind_image_memory(
        &mut self,
        image: Self::Image,
        memory: Self::Memory,
        offset: u64,
    ) -> Result<()>;

    /// Copies mip 0 out of `staging`, blit-downsamples the rest of the chain
    /// and leaves every level in `SHADER_READ_ONLY_OPTIMAL`.
    fn upload_image(
        &mut self,
        image: Self::Image,
        staging: Self::Buffer,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<()>;

    fn create_image_view(&mut self, image: Self::Image, mip_levels: u32)
        -> Result<Self::ImageView>;

    fn create_sampler(&mut self, mip_levels: u32, anisotropy: f32) -> Result<Self::Sampler>;

    fn destroy_image(
        &mut self,
        image: Self::Image,
        view: Option<Self::ImageView>,
        sampler: Option<Self::Sampler>,
    );

    // ================= FRAMES ===============

    /// Blocks until every submitted frame has finished.
    fn wait_idle(&mut self) -> Result<()>;

    fn frames_in_flight(&self) -> usize;

    /// Blocks on the fence of `slot`.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    fn record_draws(
        &mut self,
        slot: usize,
        image_index: u32,
        frame: &FrameRecording<Self::Buffer, Self::DescriptorSet>,
    ) -> Result<()>;

    /// Resets the slot's fence and submits its command buffer.
    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    fn extent(&self) -> vk::Extent2D;

    /// Rebuilds the swapchain and everything sized after it. Returns the
    /// extent actually used.
    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D>;
}
