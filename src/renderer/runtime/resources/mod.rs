//! GPU resource bookkeeping: where every asset lives in the shared buffers,
//! which descriptor set it draws with, and the typed handles callers hold.

use std::collections::BTreeMap;

use crate::renderer::{utilities::AssetCategory, HandleKind, RendererError, Result};

use self::mesh::MainBufferOffsets;

pub mod arena;
pub mod buffers;
pub mod descriptors;
pub mod mesh;
pub mod textures;
pub mod uniform;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub fn id(self) -> u32 {
                self.0
            }

            pub(crate) fn invalid(self) -> RendererError {
                RendererError::InvalidHandle {
                    kind: $kind,
                    id: self.0,
                }
            }
        }
    };
}

handle_type!(
    /// Stable handle of a submitted asset.
    AssetHandle,
    HandleKind::Asset
);
handle_type!(
    /// Stable handle of an uploaded texture.
    TextureHandle,
    HandleKind::Texture
);
handle_type!(
    /// Stable handle of a free-standing uniform block (camera, light, ...).
    UniformBlockHandle,
    HandleKind::UniformBlock
);

impl TextureHandle {
    pub(crate) fn from_raw(id: u32) -> Self {
        Self(id)
    }
}

/// Where an asset lives on the GPU and which descriptor set it draws with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBinding<S> {
    pub asset_id: AssetHandle,
    pub category: AssetCategory,
    pub main_buffer_offsets: MainBufferOffsets,
    pub uniform_offset: u64,
    pub index_count: u32,
    /// Texture the caller asked for; `None` or a stale handle samples the
    /// missing-texture placeholder.
    pub texture: Option<TextureHandle>,
    pub descriptor_set_handle: Option<S>,
    pub is_descriptor_allocated: bool,
}

/// A uniform block not tied to an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBlock {
    pub offset: u64,
    pub size: u64,
}

/// Typed registries of assets and free-standing uniform blocks. Textures
/// are registered with the texture memory manager.
#[derive(Debug)]
pub struct Registry<S> {
    assets: BTreeMap<AssetHandle, AssetBinding<S>>,
    uniform_blocks: BTreeMap<UniformBlockHandle, UniformBlock>,
    next_asset: u32,
    next_block: u32,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            assets: BTreeMap::new(),
            uniform_blocks: BTreeMap::new(),
            next_asset: 1,
            next_block: 1,
        }
    }
}

impl<S> Registry<S> {
    pub fn next_asset_handle(&mut self) -> AssetHandle {
        let handle = AssetHandle(self.next_asset);
        self.next_asset += 1;
        handle
    }

    pub fn insert_asset(&mut self, binding: AssetBinding<S>) {
        self.assets.insert(binding.asset_id, binding);
    }

    pub fn asset(&self, handle: AssetHandle) -> Result<&AssetBinding<S>> {
        self.assets.get(&handle).ok_or_else(|| handle.invalid())
    }

    pub fn asset_mut(&mut self, handle: AssetHandle) -> Result<&mut AssetBinding<S>> {
        self.assets.get_mut(&handle).ok_or_else(|| handle.invalid())
    }

    pub fn remove_asset(&mut self, handle: AssetHandle) -> Result<AssetBinding<S>> {
        self.assets.remove(&handle).ok_or_else(|| handle.invalid())
    }

    /// Assets in handle order.
    pub fn assets(&self) -> impl Iterator<Item = &AssetBinding<S>> {
        self.assets.values()
    }

    pub fn assets_mut(&mut self) -> impl Iterator<Item = &mut AssetBinding<S>> {
        self.assets.values_mut()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn count_in(&self, category: AssetCategory) -> u32 {
        self.assets
            .values()
            .filter(|b| b.category == category)
            .count() as u32
    }

    pub fn insert_uniform_block(&mut self, block: UniformBlock) -> UniformBlockHandle {
        let handle = UniformBlockHandle(self.next_block);
        self.next_block += 1;
        self.uniform_blocks.insert(handle, block);
        handle
    }

    pub fn uniform_block(&self, handle: UniformBlockHandle) -> Result<UniformBlock> {
        self.uniform_blocks
            .get(&handle)
            .copied()
            .ok_or_else(|| handle.invalid())
    }

    pub fn remove_uniform_block(&mut self, handle: UniformBlockHandle) -> Result<UniformBlock> {
        self.uniform_blocks
            .remove(&handle)
            .ok_or_else(|| handle.invalid())
    }

    pub fn uniform_block_count(&self) -> usize {
        self.uniform_blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(registry: &mut Registry<u64>, category: AssetCategory) -> AssetHandle {
        let asset_id = registry.next_asset_handle();
        registry.insert_asset(AssetBinding {
            asset_id,
            category,
            main_buffer_offsets: MainBufferOffsets {
                position: 0,
                texcoord: None,
                normal: None,
                index: 0,
            },
            uniform_offset: 0,
            index_count: 3,
            texture: None,
            descriptor_set_handle: None,
            is_descriptor_allocated: false,
        });
        asset_id
    }

    #[test]
    fn handles_are_never_reused() {
        let mut registry = Registry::<u64>::default();
        let a = binding(&mut registry, AssetCategory::Ui);
        registry.remove_asset(a).unwrap();
        let b = binding(&mut registry, AssetCategory::Ui);
        assert_ne!(a, b);

        assert!(matches!(
            registry.asset(a),
            Err(RendererError::InvalidHandle {
                kind: HandleKind::Asset,
                ..
            })
        ));
        assert!(registry.remove_asset(a).is_err());
    }

    #[test]
    fn counts_per_category() {
        let mut registry = Registry::<u64>::default();
        binding(&mut registry, AssetCategory::Mapped3D);
        binding(&mut registry, AssetCategory::Mapped3D);
        binding(&mut registry, AssetCategory::Unmapped2D);
        assert_eq!(registry.count_in(AssetCategory::Mapped3D), 2);
        assert_eq!(registry.count_in(AssetCategory::Ui), 0);
        assert_eq!(registry.asset_count(), 3);
    }

    #[test]
    fn uniform_blocks_have_their_own_handles() {
        let mut registry = Registry::<u64>::default();
        let camera = registry.insert_uniform_block(UniformBlock {
            offset: 0,
            size: 64,
        });
        assert_eq!(registry.uniform_block(camera).unwrap().size, 64);
        registry.remove_uniform_block(camera).unwrap();
        assert!(matches!(
            registry.uniform_block(camera),
            Err(RendererError::InvalidHandle {
                kind: HandleKind::UniformBlock,
                ..
            })
        ));
    }
}
