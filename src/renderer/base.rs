use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::{c_char, CStr},
};

use ash::{
    self,
    extensions::{
        ext::DebugUtils,
        khr::{Surface, Swapchain},
    },
    vk,
};
use log::{debug, error, info, trace, warn};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

use super::{
    device::{
        AcquireOutcome, DescriptorWrite, FrameRecording, GpuDevice, ImageFootprint,
        PresentOutcome,
    },
    setup,
    utilities::{AssetCategory, BufferKind, DeviceLimits, SwapchainImage},
    RendererError, Result,
};
use crate::config::RendererConfig;

/// Format of every sampled texture.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.03, 1.0];

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = *p_callback_data;
    let message_id_number = callback_data.message_id_number;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    let level = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Debug,
        _ => log::Level::Trace,
    };
    log::log!(
        target: "vulkan",
        level,
        "{:?} [{} ({})] : {}",
        message_type,
        message_id_name,
        message_id_number,
        message,
    );

    vk::FALSE
}

struct BufferMemory {
    memory: vk::DeviceMemory,
    size: u64,
    /// Persistent mapping of host-visible buffers.
    mapped: Option<*mut u8>,
}

/// Pipeline state of one asset category.
struct CategoryPipeline {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

/// `GpuDevice` on top of a window surface.
pub struct VulkanDevice {
    // Keeps the loaded library alive for as long as the instance.
    _entry: ash::Entry,
    instance: ash::Instance,

    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    surface_extent: vk::Extent2D,
    surface_format: vk::SurfaceFormatKHR,

    // ================= DEBUG ===============
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    physical_device: vk::PhysicalDevice,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    linear_blit: bool,
    device: ash::Device,
    queue: vk::Queue,

    swapchain: vk::SwapchainKHR,
    swapchain_loader: Swapchain,
    swapchain_imgs: Vec<SwapchainImage>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipelines: Vec<CategoryPipeline>,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    transfer_command_buffer: vk::CommandBuffer,

    img_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    next_frame: Vec<vk::Fence>,

    buffers: HashMap<vk::Buffer, BufferMemory>,
}

impl VulkanDevice {
    pub fn new(window: &Window, config: &RendererConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            error!("Failed to load the Vulkan library: {e}");
            RendererError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        })?;

        let layer_names = [b"VK_LAYER_KHRONOS_validation\0"];
        let layer_names_raw: Vec<*const c_char> = if config.validation {
            layer_names
                .iter()
                .map(|layer_name| layer_name.as_ptr() as *const c_char)
                .collect()
        } else {
            Vec::new()
        };

        let mut extension_names =
            ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
        if config.validation {
            extension_names.push(DebugUtils::name().as_ptr());
        }
        let mut create_flags = vk::InstanceCreateFlags::empty();
        if cfg!(target_os = "macos") {
            extension_names.push(b"VK_KHR_portability_enumeration\0".as_ptr() as *const c_char);
            create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let app_info = vk::ApplicationInfo::builder()
            .application_version(0)
            .engine_version(0)
            .api_version(vk::make_api_version(0, 1, 0, 0));

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names)
            .flags(create_flags);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        // ================== ~~DEBUG~~ ===========================================

        let debug_messenger = if config.validation {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            let debug_utils_loader = DebugUtils::new(&entry, &instance);
            let messenger =
                unsafe { debug_utils_loader.create_debug_utils_messenger(&debug_info, None)? };
            Some((debug_utils_loader, messenger))
        } else {
            None
        };

        // ================== !!DEBUG!! ===========================================

        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };

        let surface_loader = Surface::new(&entry, &instance);

        let (physical_device, queue_family_index) =
            setup::get_physical_device(&instance, &surface_loader, surface)?;

        let (limits, mem_props, linear_blit, anisotropy) = unsafe {
            let props = instance.get_physical_device_properties(physical_device);
            let features = instance.get_physical_device_features(physical_device);
            let format_props =
                instance.get_physical_device_format_properties(physical_device, TEXTURE_FORMAT);
            info!(
                "Using {}",
                CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy()
            );
            (
                DeviceLimits::from_properties(&props, &features),
                instance.get_physical_device_memory_properties(physical_device),
                format_props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR),
                features.sampler_anisotropy == vk::TRUE,
            )
        };

        let (device, queue) = setup::create_logical_device(
            &instance,
            queue_family_index,
            physical_device,
            anisotropy,
        )?;

        let swapchain_loader = Swapchain::new(&instance, &device);
        let size = window.inner_size();
        let (swapchain, surface_format, surface_extent) = setup::create_swapchain(
            &swapchain_loader,
            &surface_loader,
            surface,
            physical_device,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )?;

        let swapchain_imgs = setup::create_swapchain_images(
            &swapchain_loader,
            swapchain,
            &device,
            surface_format.format,
        )?;

        let render_pass = setup::create_render_pass(surface_format.format, &device)?;
        let framebuffers =
            setup::create_frame_buffers(&swapchain_imgs, render_pass, surface_extent, &device)?;

        let pipelines = AssetCategory::ALL
            .into_iter()
            .map(|category| -> Result<CategoryPipeline> {
                let set_layout = setup::create_descriptor_set_layout(&device, category)?;
                let (pipeline, layout) = setup::create_pipeline(
                    &device,
                    category,
                    set_layout,
                    render_pass,
                    &config.shader_dir,
                )?;
                debug!("Created {category} pipeline");
                Ok(CategoryPipeline {
                    set_layout,
                    layout,
                    pipeline,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let command_pool_create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index,
            ..Default::default()
        };
        let command_pool = unsafe { device.create_command_pool(&command_pool_create_info, None)? };

        let frame_count = config.frame_count();
        let mut command_buffers =
            setup::create_command_buffers(&device, command_pool, frame_count + 1)?;
        let transfer_command_buffer = command_buffers.pop().ok_or(RendererError::Vulkan(
            vk::Result::ERROR_INITIALIZATION_FAILED,
        ))?;

        let img_available = setup::create_semaphores(&device, frame_count)?;
        let render_finished = setup::create_semaphores(&device, frame_count)?;
        let next_frame = setup::create_signalled_fences(&device, frame_count)?;

        info!(
            "Vulkan device ready: {}x{}, {} swapchain images, {frame_count} frames in flight",
            surface_extent.width,
            surface_extent.height,
            swapchain_imgs.len()
        );

        Ok(Self {
            _entry: entry,
            instance,
            surface,
            surface_loader,
            surface_extent,
            surface_format,
            debug_messenger,
            physical_device,
            mem_props,
            limits,
            linear_blit,
            device,
            queue,
            swapchain,
            swapchain_loader,
            swapchain_imgs,
            render_pass,
            framebuffers,
            pipelines,
            command_pool,
            command_buffers,
            transfer_command_buffer,
            img_available,
            render_finished,
            next_frame,
            buffers: HashMap::new(),
        })
    }

    /// Records `record` into the transfer command buffer, submits it and
    /// waits for the queue to drain.
    fn one_time_submit(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let command_buffer = self.transfer_command_buffer;
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;

            record(&self.device, command_buffer);

            self.device.end_command_buffer(command_buffer)?;

            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));
            self.device.queue_submit(
                self.queue,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )?;
            self.device.queue_wait_idle(self.queue)?;
        }
        Ok(())
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        props: vk::MemoryPropertyFlags,
        what: &'static str,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index =
            setup::find_memory_type(requirements.memory_type_bits, &self.mem_props, props)
                .ok_or(RendererError::OutOfDeviceMemory { what })?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RendererError::OutOfDeviceMemory { what }
            }
            other => other.into(),
        })
    }

    fn create_buffer_memory(
        &self,
        buffer: vk::Buffer,
        kind: BufferKind,
        size: u64,
    ) -> Result<BufferMemory> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let props = if kind.is_host_visible() {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let memory = self.allocate(requirements, props, "buffer memory")?;

        let mapped = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|_| {
                    if kind.is_host_visible() {
                        self.device
                            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                            .map(|ptr| Some(ptr as *mut u8))
                    } else {
                        Ok(None)
                    }
                })
        };
        match mapped {
            Ok(mapped) => Ok(BufferMemory {
                memory,
                size,
                mapped,
            }),
            Err(e) => {
                unsafe { self.device.free_memory(memory, None) };
                Err(e.into())
            }
        }
    }

    fn cleanup_swapchain(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for img in self.swapchain_imgs.drain(..) {
                self.device.destroy_image_view(img.view, None);
            }
            self.swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
        self.swapchain = vk::SwapchainKHR::null();
    }

    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        frame: &FrameRecording<vk::Buffer, vk::DescriptorSet>,
    ) -> Result<()> {
        let device = &self.device;
        let extent = self.surface_extent;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        }];
        let render_pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())?;
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_set_viewport(command_buffer, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(&scissor));

            let mut bound_category = None;
            for draw in &frame.draws {
                let pipeline = &self.pipelines[draw.category.index()];
                if bound_category != Some(draw.category) {
                    device.cmd_bind_pipeline(
                        command_buffer,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.pipeline,
                    );
                    bound_category = Some(draw.category);
                }

                // Same stream order as the pipeline's vertex bindings.
                let offsets: Vec<u64> = std::iter::once(draw.position_offset)
                    .chain(draw.texcoord_offset)
                    .chain(draw.normal_offset)
                    .collect();
                let buffers = vec![frame.main_buffer; offsets.len()];
                device.cmd_bind_vertex_buffers(command_buffer, 0, &buffers, &offsets);
                device.cmd_bind_index_buffer(
                    command_buffer,
                    frame.main_buffer,
                    draw.index_offset,
                    vk::IndexType::UINT32,
                );
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    std::slice::from_ref(&draw.descriptor_set),
                    &[],
                );
                device.cmd_draw_indexed(command_buffer, draw.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer)?;
        }
        Ok(())
    }
}

fn image_barrier(
    image: vk::Image,
    base_mip_level: u32,
    level_count: u32,
    (old_layout, src_access_mask): (vk::ImageLayout, vk::AccessFlags),
    (new_layout, dst_access_mask): (vk::ImageLayout, vk::AccessFlags),
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .image(image)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(setup::color_range(base_mip_level, level_count))
        .build()
}

fn mip_extent(size: u32, level: u32) -> i32 {
    (size >> level).max(1) as i32
}

impl GpuDevice for VulkanDevice {
    type Buffer = vk::Buffer;
    type DescriptorPool = vk::DescriptorPool;
    type DescriptorSet = vk::DescriptorSet;
    type Memory = vk::DeviceMemory;
    type Image = vk::Image;
    type ImageView = vk::ImageView;
    type Sampler = vk::Sampler;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    // ================= BUFFERS ===============

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(kind.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        match self.create_buffer_memory(buffer, kind, size) {
            Ok(memory) => {
                self.buffers.insert(buffer, memory);
                trace!("Created {kind} ({size} bytes)");
                Ok(buffer)
            }
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        if let Some(memory) = self.buffers.remove(&buffer) {
            unsafe {
                if memory.mapped.is_some() {
                    self.device.unmap_memory(memory.memory);
                }
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory.memory, None);
            }
        }
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let memory = self
            .buffers
            .get(&buffer)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        let ptr = memory
            .mapped
            .filter(|_| offset + bytes.len() as u64 <= memory.size)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        self.one_time_submit(|device, command_buffer| unsafe {
            device.cmd_copy_buffer(command_buffer, src, dst, regions);
        })
    }

    // ================= DESCRIPTORS ===============

    fn create_descriptor_pool(
        &mut self,
        category: AssetCategory,
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        setup::create_descriptor_pool(&self.device, category, max_sets)
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        category: AssetCategory,
    ) -> Result<vk::DescriptorSet> {
        let set_layout = self.pipelines[category.index()].set_layout;
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&set_layout));

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter()
            .next()
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    fn free_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> Result<()> {
        unsafe { self.device.free_descriptor_sets(pool, std::slice::from_ref(&set))? };
        Ok(())
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, write: &DescriptorWrite<Self>) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer: write.uniform_buffer,
            offset: write.uniform_offset,
            range: write.uniform_range,
        };
        let image_info = write.image.map(|(image_view, sampler)| vk::DescriptorImageInfo {
            sampler,
            image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });

        let mut writes = vec![vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info))
            .build()];
        if let Some(image_info) = image_info.as_ref() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(image_info))
                    .build(),
            );
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    // ================= IMAGES ===============

    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<(vk::Image, ImageFootprint)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        Ok((
            image,
            ImageFootprint {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
        ))
    }

    fn allocate_image_memory(&mut self, size: u64, memory_type_bits: u32) -> Result<vk::DeviceMemory> {
        self.allocate(
            vk::MemoryRequirements {
                size,
                alignment: 1,
                memory_type_bits,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            "texture memory",
        )
    }

    fn free_image_memory(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn bind_image_memory(
        &mut self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset)? };
        Ok(())
    }

    fn upload_image(
        &mut self,
        image: vk::Image,
        staging: vk::Buffer,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<()> {
        let filter = if self.linear_blit {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };

        self.one_time_submit(|device, command_buffer| unsafe {
            let to_transfer_dst = image_barrier(
                image,
                0,
                mip_levels,
                (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty()),
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            );
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer_dst],
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            // Each level is blitted from the one above it, which is then
            // handed over to the fragment shader.
            for level in 1..mip_levels {
                let src_ready = image_barrier(
                    image,
                    level - 1,
                    1,
                    (
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                    ),
                    (
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::AccessFlags::TRANSFER_READ,
                    ),
                );
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[src_ready],
                );

                let blit = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level - 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: mip_extent(width, level - 1),
                            y: mip_extent(height, level - 1),
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: level,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: mip_extent(width, level),
                            y: mip_extent(height, level),
                            z: 1,
                        },
                    ],
                };
                device.cmd_blit_image(
                    command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    filter,
                );

                let src_done = image_barrier(
                    image,
                    level - 1,
                    1,
                    (
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::AccessFlags::TRANSFER_READ,
                    ),
                    (
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        vk::AccessFlags::SHADER_READ,
                    ),
                );
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[src_done],
                );
            }

            let last_done = image_barrier(
                image,
                mip_levels - 1,
                1,
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
                (
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::SHADER_READ,
                ),
            );
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[last_done],
            );
        })
    }

    fn create_image_view(&mut self, image: vk::Image, mip_levels: u32) -> Result<vk::ImageView> {
        setup::create_image_view(&self.device, image, TEXTURE_FORMAT, mip_levels)
    }

    fn create_sampler(&mut self, mip_levels: u32, anisotropy: f32) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy > 1.0)
            .max_anisotropy(anisotropy)
            .min_lod(0.0)
            .max_lod(mip_levels as f32)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        Ok(unsafe { self.device.create_sampler(&sampler_info, None)? })
    }

    fn destroy_image(
        &mut self,
        image: vk::Image,
        view: Option<vk::ImageView>,
        sampler: Option<vk::Sampler>,
    ) {
        unsafe {
            if let Some(sampler) = sampler {
                self.device.destroy_sampler(sampler, None);
            }
            if let Some(view) = view {
                self.device.destroy_image_view(view, None);
            }
            self.device.destroy_image(image, None);
        }
    }

    // ================= FRAMES ===============

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn frames_in_flight(&self) -> usize {
        self.next_frame.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.next_frame[slot]], true, u64::MAX)?
        };
        Ok(())
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.img_available[slot],
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn record_draws(
        &mut self,
        slot: usize,
        image_index: u32,
        frame: &FrameRecording<vk::Buffer, vk::DescriptorSet>,
    ) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))?;
        self.record(self.command_buffers[slot], framebuffer, frame)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let wait_semaphores = [self.img_available[slot]];
        let signal_semaphores = [self.render_finished[slot]];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[slot]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.reset_fences(&[self.next_frame[slot]])?;
            self.device.queue_submit(
                self.queue,
                std::slice::from_ref(&submit_info),
                self.next_frame[slot],
            )?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait_semaphores = [self.render_finished[slot]];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn extent(&self) -> vk::Extent2D {
        self.surface_extent
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<vk::Extent2D> {
        unsafe { self.device.device_wait_idle()? };
        self.cleanup_swapchain();

        let (swapchain, surface_format, surface_extent) = setup::create_swapchain(
            &self.swapchain_loader,
            &self.surface_loader,
            self.surface,
            self.physical_device,
            extent,
        )?;
        self.swapchain = swapchain;
        if surface_format.format != self.surface_format.format {
            warn!(
                "Surface format changed from {:?} to {:?}",
                self.surface_format.format, surface_format.format
            );
        }
        self.surface_format = surface_format;
        self.surface_extent = surface_extent;

        self.swapchain_imgs = setup::create_swapchain_images(
            &self.swapchain_loader,
            self.swapchain,
            &self.device,
            self.surface_format.format,
        )?;
        self.framebuffers = setup::create_frame_buffers(
            &self.swapchain_imgs,
            self.render_pass,
            self.surface_extent,
            &self.device,
        )?;

        debug!(
            "Recreated swapchain at {}x{}",
            surface_extent.width, surface_extent.height
        );
        Ok(surface_extent)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for the device before teardown: {e}");
            }
        }

        let buffers: Vec<_> = self.buffers.keys().copied().collect();
        if !buffers.is_empty() {
            warn!("{} buffers still alive at teardown", buffers.len());
        }
        for buffer in buffers {
            self.destroy_buffer(buffer);
        }

        unsafe {
            for &semaphore in self.img_available.iter().chain(&self.render_finished) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for &fence in &self.next_frame {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);

            for pipeline in &self.pipelines {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
                self.device
                    .destroy_descriptor_set_layout(pipeline.set_layout, None);
            }
        }

        self.cleanup_swapchain();

        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
