use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::renderer::{
    utilities::{DEFAULT_POOL_CAPACITY, MAX_FRAME_DRAWS, MIN_FRAME_DRAWS},
    RendererError, Result,
};

/// Renderer setup parameters. Every field has a default, so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Initial size of the shared vertex/index buffer in bytes.
    pub main_buffer_capacity: u64,
    /// Initial size of the uniform buffer in bytes.
    pub uniform_buffer_capacity: u64,
    /// Initial size of the host-visible upload buffer in bytes.
    pub staging_buffer_capacity: u64,
    /// Initial size of the shared image memory block in bytes.
    pub texture_memory_capacity: u64,
    /// Initial descriptor set capacity of every category pool.
    pub descriptor_pool_capacity: u32,
    pub mipmaps: bool,
    /// Enables `VK_LAYER_KHRONOS_validation` and the debug messenger.
    pub validation: bool,
    /// Directory holding the per-category `*.vert.spv` / `*.frag.spv` files.
    pub shader_dir: PathBuf,
    pub log_filter: Option<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            main_buffer_capacity: 1 << 20,
            uniform_buffer_capacity: 64 << 10,
            staging_buffer_capacity: 1 << 20,
            texture_memory_capacity: 16 << 20,
            descriptor_pool_capacity: DEFAULT_POOL_CAPACITY,
            mipmaps: true,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders"),
            log_filter: None,
        }
    }
}

impl RendererConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RendererError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RendererError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("main_buffer_capacity", self.main_buffer_capacity),
            ("uniform_buffer_capacity", self.uniform_buffer_capacity),
            ("staging_buffer_capacity", self.staging_buffer_capacity),
            ("texture_memory_capacity", self.texture_memory_capacity),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(RendererError::Config(format!("{name} must be non-zero")));
        }
        if self.descriptor_pool_capacity == 0 {
            return Err(RendererError::Config(
                "descriptor_pool_capacity must be non-zero".into(),
            ));
        }
        if self.frames_in_flight == 0 {
            return Err(RendererError::Config(
                "frames_in_flight must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Frames in flight, clamped to the range the frame loop supports.
    pub fn frame_count(&self) -> usize {
        let clamped = self.frames_in_flight.clamp(MIN_FRAME_DRAWS, MAX_FRAME_DRAWS);
        if clamped != self.frames_in_flight {
            log::warn!(
                "frames_in_flight = {} is out of range, using {clamped}",
                self.frames_in_flight
            );
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = RendererConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.descriptor_pool_capacity, 32);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config = RendererConfig::from_json_str(
            r#"{ "frames_in_flight": 3, "mipmaps": false, "shader_dir": "assets/spv" }"#,
        )
        .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.mipmaps);
        assert_eq!(config.shader_dir, PathBuf::from("assets/spv"));
        assert_eq!(
            config.main_buffer_capacity,
            RendererConfig::default().main_buffer_capacity
        );
    }

    #[test]
    fn unknown_and_zero_fields_are_rejected() {
        assert!(matches!(
            RendererConfig::from_json_str(r#"{ "frames": 2 }"#),
            Err(RendererError::Config(_))
        ));
        assert!(matches!(
            RendererConfig::from_json_str(r#"{ "uniform_buffer_capacity": 0 }"#),
            Err(RendererError::Config(_))
        ));
    }

    #[test]
    fn frame_count_is_clamped() {
        let config = RendererConfig {
            frames_in_flight: 8,
            ..Default::default()
        };
        assert_eq!(config.frame_count(), MAX_FRAME_DRAWS);

        let config = RendererConfig {
            frames_in_flight: 1,
            ..Default::default()
        };
        assert_eq!(config.frame_count(), MIN_FRAME_DRAWS);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            RendererConfig::load("/nonexistent/renderer.json"),
            Err(RendererError::Config(_))
        ));
    }
}
