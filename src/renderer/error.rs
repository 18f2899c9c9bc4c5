use std::fmt;

use ash::vk;
use thiserror::Error;

use super::utilities::AssetCategory;

/// Which typed registry a handle was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Asset,
    Texture,
    UniformBlock,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Asset => "asset",
            HandleKind::Texture => "texture",
            HandleKind::UniformBlock => "uniform block",
        })
    }
}

#[derive(Debug, Error)]
pub enum RendererError {
    /// Device-side allocation failed while growing a buffer, image block or pool.
    #[error("out of device memory while allocating {what}")]
    OutOfDeviceMemory { what: &'static str },

    #[error("no live allocation starts at offset {offset}")]
    InvalidOffset { offset: u64 },

    #[error("region [{offset}, {offset} + {size}) is not free")]
    RegionUnavailable { offset: u64, size: u64 },

    #[error("{kind} handle {id} is not live")]
    InvalidHandle { kind: HandleKind, id: u32 },

    #[error("graphics device lost")]
    DeviceLost,

    #[error("texture {width}x{height} exceeds the device limit of {max} texels per side")]
    TextureTooLarge { width: u32, height: u32, max: u32 },

    #[error("texture data holds {actual} bytes, expected {expected}")]
    InvalidTextureData { expected: usize, actual: usize },

    #[error("{len} bytes at offset {offset} overrun a {block_size} byte uniform block")]
    UniformOutOfBounds {
        offset: u64,
        len: u64,
        block_size: u64,
    },

    #[error("invalid {category} mesh: {reason}")]
    InvalidMesh {
        category: AssetCategory,
        reason: &'static str,
    },

    #[error("frame driver called out of order: {0}")]
    FrameOutOfOrder(&'static str),

    #[error("shader error: {0}")]
    Shader(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

pub type Result<T, E = RendererError> = std::result::Result<T, E>;

impl RendererError {
    /// Fatal errors end the render loop; the renderer has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RendererError::OutOfDeviceMemory { .. }
                | RendererError::DeviceLost
                | RendererError::Vulkan(_)
        )
    }
}

impl From<vk::Result> for RendererError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RendererError::OutOfDeviceMemory {
                    what: "device object",
                }
            }
            vk::Result::ERROR_DEVICE_LOST => RendererError::DeviceLost,
            other => RendererError::Vulkan(other),
        }
    }
}
