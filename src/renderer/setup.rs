use ash::{
    extensions::khr::{Surface, Swapchain},
    util::read_spv,
    vk,
};
use std::{ffi::CStr, fs::File, path::Path};

use super::{
    utilities::{AssetCategory, SwapchainImage},
    RendererError, Result,
};

pub fn create_descriptor_pool(
    device: &ash::Device,
    category: AssetCategory,
    max_sets: u32,
) -> Result<vk::DescriptorPool> {
    let pool_sizes = descriptor_pool_sizes(category, max_sets);
    let pool_create_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .pool_sizes(&pool_sizes)
        .max_sets(max_sets);

    Ok(unsafe { device.create_descriptor_pool(&pool_create_info, None)? })
}

/// One uniform block per set, plus one combined image sampler for mapped
/// categories.
pub fn descriptor_pool_sizes(category: AssetCategory, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes = vec![vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: max_sets,
    }];
    if category.is_mapped() {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: max_sets,
        });
    }
    sizes
}

pub fn create_descriptor_set_layout(
    device: &ash::Device,
    category: AssetCategory,
) -> Result<vk::DescriptorSetLayout> {
    let mut layout_bindings = vec![
        // Per-asset uniform block
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    if category.is_mapped() {
        layout_bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        );
    }
    let layout_create_info =
        vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);

    Ok(unsafe { device.create_descriptor_set_layout(&layout_create_info, None)? })
}

pub fn create_command_buffers(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    count: usize,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count as u32);

    Ok(unsafe { device.allocate_command_buffers(&alloc_info)? })
}

pub fn create_frame_buffers(
    swapchain_imgs: &[SwapchainImage],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    device: &ash::Device,
) -> Result<Vec<vk::Framebuffer>> {
    swapchain_imgs
        .iter()
        .map(|img| -> Result<vk::Framebuffer> {
            let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(std::slice::from_ref(&img.view))
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            Ok(unsafe { device.create_framebuffer(&framebuffer_create_info, None)? })
        })
        .collect()
}

/// Vertex streams live in separate regions of the main buffer, so every
/// attribute gets its own binding. Locations are fixed: 0 position,
/// 1 texture coordinates, 2 normal.
pub fn vertex_input(
    category: AssetCategory,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut streams = vec![(
        0,
        if category.is_3d() {
            vk::Format::R32G32B32_SFLOAT
        } else {
            vk::Format::R32G32_SFLOAT
        },
        if category.is_3d() { 12 } else { 8 },
    )];
    if category.is_mapped() {
        streams.push((1, vk::Format::R32G32_SFLOAT, 8));
    }
    if category.is_3d() {
        streams.push((2, vk::Format::R32G32B32_SFLOAT, 12));
    }

    streams
        .into_iter()
        .enumerate()
        .map(|(binding, (location, format, stride))| {
            (
                vk::VertexInputBindingDescription {
                    binding: binding as u32,
                    stride,
                    input_rate: vk::VertexInputRate::VERTEX,
                },
                vk::VertexInputAttributeDescription {
                    binding: binding as u32,
                    location,
                    format,
                    offset: 0,
                },
            )
        })
        .unzip()
}

pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let mut file = File::open(path)
        .map_err(|e| RendererError::Shader(format!("{}: {e}", path.display())))?;
    let code = read_spv(&mut file)
        .map_err(|e| RendererError::Shader(format!("{}: {e}", path.display())))?;
    let shader_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    Ok(unsafe { device.create_shader_module(&shader_info, None)? })
}

pub fn create_pipeline(
    device: &ash::Device,
    category: AssetCategory,
    descriptor_set_layout: vk::DescriptorSetLayout,
    render_pass: vk::RenderPass,
    shader_dir: &Path,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let stem = category.shader_stem();
    let vertex_module = load_shader_module(device, &shader_dir.join(format!("{stem}.vert.spv")))?;
    let frag_module =
        match load_shader_module(device, &shader_dir.join(format!("{stem}.frag.spv"))) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

    let result = create_pipeline_with(
        device,
        category,
        descriptor_set_layout,
        render_pass,
        vertex_module,
        frag_module,
    );

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(frag_module, None);
    }
    result
}

fn create_pipeline_with(
    device: &ash::Device,
    category: AssetCategory,
    descriptor_set_layout: vk::DescriptorSetLayout,
    render_pass: vk::RenderPass,
    vertex_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let layout_create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(std::slice::from_ref(&descriptor_set_layout));
    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_create_info, None)? };

    let shader_entry_name = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };
    let shader_stage_create_infos = [
        vk::PipelineShaderStageCreateInfo {
            module: vertex_module,
            p_name: shader_entry_name.as_ptr(),
            stage: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            module: frag_module,
            p_name: shader_entry_name.as_ptr(),
            stage: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ];

    let (bindings, attributes) = vertex_input(category);
    let vertex_input_create_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Viewport and scissor are set per recording, so the pipelines survive
    // swapchain recreation.
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_create_info =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);
    let viewport_state_create_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let input_assembly_create_info = vk::PipelineInputAssemblyStateCreateInfo {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };

    let rasterization_info = vk::PipelineRasterizationStateCreateInfo {
        front_face: vk::FrontFace::CLOCKWISE,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: if category.is_3d() {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        },
        line_width: 1.0,
        ..Default::default()
    };

    let multisample_state_info = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };

    // UI is alpha blended over the scene.
    let blend = category == AssetCategory::Ui;
    let color_blend_attachment_states = [vk::PipelineColorBlendAttachmentState {
        blend_enable: blend.into(),
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }];

    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op(vk::LogicOp::CLEAR)
        .attachments(&color_blend_attachment_states);

    let pipeline_create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stage_create_infos)
        .viewport_state(&viewport_state_create_info)
        .vertex_input_state(&vertex_input_create_info)
        .input_assembly_state(&input_assembly_create_info)
        .rasterization_state(&rasterization_info)
        .multisample_state(&multisample_state_info)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state_create_info)
        .layout(pipeline_layout)
        .render_pass(render_pass);

    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_create_info),
            None,
        )
    };
    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], pipeline_layout)),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(e.into())
        }
    }
}

pub fn create_render_pass(format: vk::Format, device: &ash::Device) -> Result<vk::RenderPass> {
    let rendepass_attachments = [vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }];

    let color_attachment_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ..Default::default()
    }];

    let subpass = vk::SubpassDescription::builder()
        .color_attachments(&color_attachment_refs)
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS);

    let renderpass_create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&rendepass_attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);

    Ok(unsafe { device.create_render_pass(&renderpass_create_info, None)? })
}

pub fn create_semaphores(device: &ash::Device, count: usize) -> Result<Vec<vk::Semaphore>> {
    (0..count)
        .map(|_| unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) })
        .map(|semaphore| semaphore.map_err(RendererError::from))
        .collect()
}

pub fn create_signalled_fences(device: &ash::Device, count: usize) -> Result<Vec<vk::Fence>> {
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
    (0..count)
        .map(|_| unsafe { device.create_fence(&fence_info, None) })
        .map(|fence| fence.map_err(RendererError::from))
        .collect()
}

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::R,
            g: vk::ComponentSwizzle::G,
            b: vk::ComponentSwizzle::B,
            a: vk::ComponentSwizzle::A,
        })
        .subresource_range(color_range(0, mip_levels))
        .image(image);

    Ok(unsafe { device.create_image_view(&view_info, None)? })
}

pub fn create_swapchain_images(
    swapchain_loader: &Swapchain,
    swapchain: vk::SwapchainKHR,
    device: &ash::Device,
    format: vk::Format,
) -> Result<Vec<SwapchainImage>> {
    let images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };
    images
        .into_iter()
        .map(|img| -> Result<SwapchainImage> {
            let view = create_image_view(device, img, format, 1)?;
            Ok(SwapchainImage::new(img, view))
        })
        .collect()
}

/// The surface's current extent when it dictates one, otherwise `requested`
/// clamped to what the surface supports.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    match caps.current_extent.width {
        u32::MAX => vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        },
        _ => caps.current_extent,
    }
}

pub fn create_swapchain(
    swapchain_loader: &Swapchain,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    requested_extent: vk::Extent2D,
) -> Result<(vk::SwapchainKHR, vk::SurfaceFormatKHR, vk::Extent2D)> {
    let surface_format = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)?
            .into_iter()
            .min_by_key(|f| match (f.format, f.color_space) {
                (vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 0,
                (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 1,
                _ => 2,
            })
            .ok_or(RendererError::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?
    };

    let surface_caps = unsafe {
        surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
    };

    let image_count = {
        let count = surface_caps.min_image_count + 1;

        if surface_caps.max_image_count > 0 && count > surface_caps.max_image_count {
            surface_caps.max_image_count
        } else {
            count
        }
    };

    let extent = choose_extent(&surface_caps, requested_extent);

    let present_mode = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)?
            .into_iter()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO)
    };

    let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_color_space(surface_format.color_space)
        .image_format(surface_format.format)
        .image_extent(extent)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .image_array_layers(1);

    let swapchain = unsafe { swapchain_loader.create_swapchain(&swapchain_create_info, None)? };

    Ok((swapchain, surface_format, extent))
}

pub fn create_logical_device(
    instance: &ash::Instance,
    queue_family_index: u32,
    physical_device: vk::PhysicalDevice,
    sampler_anisotropy: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let device_extensions_raw = [Swapchain::name().as_ptr()];

    let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(sampler_anisotropy);
    let priorities = [1f32];

    let queue_create_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities);

    let device_create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions_raw)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };

    let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

    Ok((device, queue))
}

// ========================= GET FUNCTIONS =================================
//
pub fn get_physical_device(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    physical_devices
        .iter()
        .filter_map(|p| unsafe {
            instance
                .get_physical_device_queue_family_properties(*p)
                .iter()
                .enumerate()
                .find_map(|(i, info)| {
                    let presentable = surface_loader
                        .get_physical_device_surface_support(*p, i as u32, surface)
                        .unwrap_or(false);
                    if info.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presentable {
                        Some((*p, i as u32))
                    } else {
                        None
                    }
                })
        })
        .min_by_key(|(p, _)| {
            match unsafe { instance.get_physical_device_properties(*p).device_type } {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::CPU => 2,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 3,
                vk::PhysicalDeviceType::OTHER => 4,
                _ => 5,
            }
        })
        .ok_or(RendererError::Vulkan(
            vk::Result::ERROR_INCOMPATIBLE_DRIVER,
        ))
}

pub fn find_memory_type(
    type_filter: u32,
    mem_props: &vk::PhysicalDeviceMemoryProperties,
    props: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..mem_props.memory_type_count).find(|&i| {
        type_filter & (1 << i) != 0
            && mem_props.memory_types[i as usize].property_flags & props == props
    })
}

#[inline]
pub fn color_range(base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_bindings_follow_the_category() {
        let (bindings, attributes) = vertex_input(AssetCategory::Unmapped2D);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 8);
        assert_eq!(attributes[0].location, 0);

        let (bindings, attributes) = vertex_input(AssetCategory::Unmapped3D);
        assert_eq!(
            bindings.iter().map(|b| b.stride).collect::<Vec<_>>(),
            [12, 12]
        );
        // Normals keep location 2 even without texture coordinates.
        assert_eq!(
            attributes
                .iter()
                .map(|a| (a.binding, a.location))
                .collect::<Vec<_>>(),
            [(0, 0), (1, 2)]
        );

        let (bindings, attributes) = vertex_input(AssetCategory::Mapped3D);
        assert_eq!(bindings.len(), 3);
        assert_eq!(attributes[1].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[2].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn mapped_pools_reserve_samplers() {
        let sizes = descriptor_pool_sizes(AssetCategory::Mapped2D, 48);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 48));
        assert_eq!(descriptor_pool_sizes(AssetCategory::Unmapped3D, 48).len(), 1);
    }

    #[test]
    fn memory_type_matches_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(0b111, &props, host), Some(1));
        assert_eq!(find_memory_type(0b101, &props, host), Some(2));
        assert_eq!(
            find_memory_type(0b010, &props, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn extent_follows_the_surface_when_it_dictates_one() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let requested = vk::Extent2D {
            width: 10_000,
            height: 300,
        };
        assert_eq!(choose_extent(&caps, requested), caps.current_extent);

        caps.current_extent.width = u32::MAX;
        assert_eq!(
            choose_extent(&caps, requested),
            vk::Extent2D {
                width: 4096,
                height: 300
            }
        );
    }
}
