use std::fmt;

use ash::{self, vk};
use serde::Serialize;

pub const MAX_FRAME_DRAWS: usize = 3;
pub const MIN_FRAME_DRAWS: usize = 2;

/// Default number of descriptor sets a category pool is created with.
pub const DEFAULT_POOL_CAPACITY: u32 = 32;

/// Alignment of every vertex and index stream inside the main buffer.
pub const MAIN_BUFFER_ALIGNMENT: u64 = 4;

#[derive(Clone, Copy)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

impl SwapchainImage {
    pub fn new(image: vk::Image, view: vk::ImageView) -> Self {
        Self { image, view }
    }
}

/// Asset shape. Each category has its own descriptor set layout, pipeline
/// and descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AssetCategory {
    Unmapped2D,
    Mapped2D,
    Unmapped3D,
    Mapped3D,
    Ui,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 5] = [
        AssetCategory::Unmapped2D,
        AssetCategory::Mapped2D,
        AssetCategory::Unmapped3D,
        AssetCategory::Mapped3D,
        AssetCategory::Ui,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Mapped categories sample a texture and carry texture coordinates.
    #[inline]
    pub fn is_mapped(self) -> bool {
        matches!(
            self,
            AssetCategory::Mapped2D | AssetCategory::Mapped3D | AssetCategory::Ui
        )
    }

    #[inline]
    pub fn is_3d(self) -> bool {
        matches!(self, AssetCategory::Unmapped3D | AssetCategory::Mapped3D)
    }

    /// Size of the per-asset uniform block.
    ///
    /// 2D and UI: 3x vec4 transform rows + vec4 color. 3D: mat4 model,
    /// vec4 color, vec4 material params, ivec4 flags.
    pub fn uniform_block_size(self) -> u64 {
        if self.is_3d() {
            112
        } else {
            64
        }
    }

    /// File stem of the category's SPIR-V shaders.
    pub fn shader_stem(self) -> &'static str {
        match self {
            AssetCategory::Unmapped2D => "unmapped_2d",
            AssetCategory::Mapped2D => "mapped_2d",
            AssetCategory::Unmapped3D => "unmapped_3d",
            AssetCategory::Mapped3D => "mapped_3d",
            AssetCategory::Ui => "ui",
        }
    }
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssetCategory::Unmapped2D => "2D-unmapped",
            AssetCategory::Mapped2D => "2D-mapped",
            AssetCategory::Unmapped3D => "3D-unmapped",
            AssetCategory::Mapped3D => "3D-mapped",
            AssetCategory::Ui => "UI",
        })
    }
}

/// The GPU buffers owned by the growth manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Device-local vertex and index data of every asset.
    Main,
    /// Host-visible uniform blocks.
    Uniform,
    /// Host-visible upload buffer; its contents never outlive one transfer.
    Staging,
}

impl BufferKind {
    pub const ALL: [BufferKind; 3] = [BufferKind::Main, BufferKind::Uniform, BufferKind::Staging];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, BufferKind::Main)
    }

    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Main => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferKind::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferKind::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferKind::Main => "main buffer",
            BufferKind::Uniform => "uniform buffer",
            BufferKind::Staging => "staging buffer",
        })
    }
}

/// Device limits read once at setup and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub min_uniform_alignment: u64,
    pub max_anisotropy: f32,
    pub max_texture_dimension: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_alignment: 256,
            max_anisotropy: 16.0,
            max_texture_dimension: 4096,
        }
    }
}

impl DeviceLimits {
    pub fn from_properties(
        props: &vk::PhysicalDeviceProperties,
        features: &vk::PhysicalDeviceFeatures,
    ) -> Self {
        Self {
            min_uniform_alignment: props.limits.min_uniform_buffer_offset_alignment.max(1),
            max_anisotropy: if features.sampler_anisotropy == vk::TRUE {
                props.limits.max_sampler_anisotropy
            } else {
                1.0
            },
            max_texture_dimension: props.limits.max_image_dimension2_d,
        }
    }
}

/// Number of mip levels for a `width` x `height` image: `floor(log2(max)) + 1`.
pub fn mip_levels(width: u32, height: u32, mipmaps: bool) -> u32 {
    let max_dim = width.max(height).max(1);
    if mipmaps {
        u32::BITS - max_dim.leading_zeros()
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_levels(1, 1, true), 1);
        assert_eq!(mip_levels(256, 256, true), 9);
        assert_eq!(mip_levels(300, 17, true), 9);
        assert_eq!(mip_levels(1024, 2048, true), 12);
        assert_eq!(mip_levels(1024, 2048, false), 1);
    }

    #[test]
    fn mapped_categories_sample_textures() {
        let mapped: Vec<_> = AssetCategory::ALL
            .into_iter()
            .filter(|c| c.is_mapped())
            .collect();
        assert_eq!(
            mapped,
            [AssetCategory::Mapped2D, AssetCategory::Mapped3D, AssetCategory::Ui]
        );
        assert_eq!(AssetCategory::Mapped3D.to_string(), "3D-mapped");
    }

    #[test]
    fn limits_without_anisotropy_feature() {
        let mut props = vk::PhysicalDeviceProperties::default();
        props.limits.min_uniform_buffer_offset_alignment = 64;
        props.limits.max_sampler_anisotropy = 16.0;
        props.limits.max_image_dimension2_d = 8192;
        let features = vk::PhysicalDeviceFeatures::default();

        let limits = DeviceLimits::from_properties(&props, &features);
        assert_eq!(limits.min_uniform_alignment, 64);
        assert_eq!(limits.max_anisotropy, 1.0);
        assert_eq!(limits.max_texture_dimension, 8192);
    }
}
