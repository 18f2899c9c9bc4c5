//! Textures share one device memory block. Each texture owns its image and
//! is bound into the block at an arena-assigned offset. When the block runs
//! out it is replaced by a larger one and every image is recreated from the
//! pixels kept on the host, so offsets and image handles may change.

use std::collections::BTreeMap;

use crate::renderer::{
    device::{GpuDevice, ImageFootprint},
    utilities::mip_levels,
    RendererError, Result,
};

use super::{
    arena::ArenaAllocator,
    buffers::{grown_capacity, BufferGrowthManager},
    TextureHandle,
};

const MISSING_TEXTURE_SIZE: u32 = 64;
const MISSING_TEXTURE_CELL: u32 = 8;

/// A 64x64 magenta/black checkerboard.
pub fn missing_texture_pixels() -> Vec<u8> {
    let side = MISSING_TEXTURE_SIZE as usize;
    let mut pixels = Vec::with_capacity(side * side * 4);
    for y in 0..MISSING_TEXTURE_SIZE {
        for x in 0..MISSING_TEXTURE_SIZE {
            let lit = (x / MISSING_TEXTURE_CELL + y / MISSING_TEXTURE_CELL) % 2 == 0;
            pixels.extend_from_slice(if lit {
                &[255, 0, 255, 255]
            } else {
                &[0, 0, 0, 255]
            });
        }
    }
    pixels
}

pub struct TextureBinding<D: GpuDevice> {
    pub texture_id: TextureHandle,
    pub image_handle: D::Image,
    pub image_view: D::ImageView,
    pub sampler: D::Sampler,
    pub mip_levels: u32,
    pub memory_offset: u64,
    pub width: u32,
    pub height: u32,
    /// RGBA8 texels of mip 0, kept for re-uploads after a reallocation.
    pixels: Vec<u8>,
}

struct GpuImage<D: GpuDevice> {
    image: D::Image,
    view: D::ImageView,
    sampler: D::Sampler,
    mip_levels: u32,
    offset: u64,
}

pub struct TextureMemoryManager<D: GpuDevice> {
    memory: Option<D::Memory>,
    memory_type_bits: u32,
    arena: ArenaAllocator,
    textures: BTreeMap<TextureHandle, TextureBinding<D>>,
    missing: Option<TextureHandle>,
    next_id: u32,
    mipmaps: bool,
    generation: u32,
}

impl<D: GpuDevice> TextureMemoryManager<D> {
    /// The block itself is allocated with the first texture, once its
    /// memory requirements are known.
    pub fn new(initial_capacity: u64, mipmaps: bool) -> Self {
        Self {
            memory: None,
            memory_type_bits: 0,
            arena: ArenaAllocator::new(initial_capacity.max(1)),
            textures: BTreeMap::new(),
            missing: None,
            next_id: 1,
            mipmaps,
            generation: 0,
        }
    }

    #[inline]
    pub fn get(&self, handle: TextureHandle) -> Option<&TextureBinding<D>> {
        self.textures.get(&handle)
    }

    #[inline]
    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.textures.contains_key(&handle)
    }

    /// Live textures, the placeholder included once it exists.
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn missing_handle(&self) -> Option<TextureHandle> {
        self.missing
    }

    /// Bumped whenever the memory block is replaced.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn memory_capacity(&self) -> u64 {
        self.arena.capacity()
    }

    pub fn memory_used(&self) -> u64 {
        self.arena.used()
    }

    pub fn upload(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<TextureHandle> {
        let max = device.limits().max_texture_dimension;
        if width > max || height > max {
            return Err(RendererError::TextureTooLarge { width, height, max });
        }
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(RendererError::InvalidTextureData {
                expected,
                actual: pixels.len(),
            });
        }

        let mips = mip_levels(width, height, self.mipmaps);
        let (image, footprint) = device.create_image(width, height, mips)?;
        let offset = match self.place(device, buffers, footprint) {
            Ok(offset) => offset,
            Err(e) => {
                device.destroy_image(image, None, None);
                return Err(e);
            }
        };
        let gpu = match self.fill(device, buffers, image, pixels, width, height, mips, offset) {
            Ok(gpu) => gpu,
            Err(e) => {
                self.arena.free(offset)?;
                return Err(e);
            }
        };

        let texture_id = TextureHandle::from_raw(self.next_id);
        self.next_id += 1;
        self.textures.insert(
            texture_id,
            TextureBinding {
                texture_id,
                image_handle: gpu.image,
                image_view: gpu.view,
                sampler: gpu.sampler,
                mip_levels: gpu.mip_levels,
                memory_offset: gpu.offset,
                width,
                height,
                pixels: pixels.to_vec(),
            },
        );
        log::debug!(
            "texture {} uploaded: {width}x{height}, {mips} mip levels at offset {}",
            texture_id.id(),
            gpu.offset
        );
        Ok(texture_id)
    }

    /// Finds room for an image, growing the memory block if it is full.
    fn place(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        footprint: ImageFootprint,
    ) -> Result<u64> {
        if self.memory.is_none() {
            let initial = self.arena.capacity();
            let capacity = if footprint.size <= initial {
                initial
            } else {
                grown_capacity(initial, footprint.size)
            };
            let memory = device.allocate_image_memory(capacity, footprint.memory_type_bits)?;
            self.memory = Some(memory);
            self.memory_type_bits = footprint.memory_type_bits;
            self.arena.set_capacity(capacity);
        }

        if let Some(offset) = self.arena.allocate(footprint.size, footprint.alignment) {
            return Ok(offset);
        }
        let required = self
            .arena
            .required_capacity(footprint.size, footprint.alignment);
        self.reallocate(device, buffers, required)?;
        self.arena
            .allocate(footprint.size, footprint.alignment)
            .ok_or(RendererError::OutOfDeviceMemory {
                what: "texture memory",
            })
    }

    /// Binds `image` at `offset`, uploads `pixels` and creates the view and
    /// sampler. On failure `image` and whatever was created for it are
    /// destroyed.
    #[allow(clippy::too_many_arguments)]
    fn fill(
        &self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        image: D::Image,
        pixels: &[u8],
        width: u32,
        height: u32,
        mip_levels: u32,
        offset: u64,
    ) -> Result<GpuImage<D>> {
        let viewed = (|| -> Result<D::ImageView> {
            let memory = self.memory.ok_or(RendererError::OutOfDeviceMemory {
                what: "texture memory",
            })?;
            device.bind_image_memory(image, memory, offset)?;
            let staging = buffers.stage(device, pixels)?;
            device.upload_image(image, staging, width, height, mip_levels)?;
            device.create_image_view(image, mip_levels)
        })();
        let view = match viewed {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image, None, None);
                return Err(e);
            }
        };

        let anisotropy = device.limits().max_anisotropy;
        let sampler = match device.create_sampler(mip_levels, anisotropy) {
            Ok(sampler) => sampler,
            Err(e) => {
                device.destroy_image(image, Some(view), None);
                return Err(e);
            }
        };
        Ok(GpuImage {
            image,
            view,
            sampler,
            mip_levels,
            offset,
        })
    }

    /// Replaces the memory block with one of at least `required` bytes and
    /// recreates every texture inside it.
    fn reallocate(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        required: u64,
    ) -> Result<()> {
        let old_capacity = self.arena.capacity();
        let capacity = grown_capacity(old_capacity, required);

        // Images bound to the old block may still be sampled.
        device.wait_idle()?;
        let memory = device.allocate_image_memory(capacity, self.memory_type_bits)?;
        let old_memory = self.memory.replace(memory);
        self.arena = ArenaAllocator::new(capacity);

        let mut textures = std::mem::take(&mut self.textures);
        let rebuilt = self.rebuild(device, buffers, &mut textures);
        self.textures = textures;
        if let Some(old) = old_memory {
            device.free_image_memory(old);
        }
        if self
            .missing
            .is_some_and(|handle| !self.textures.contains_key(&handle))
        {
            self.missing = None;
        }
        // Surviving images moved even when the rebuild stopped early.
        self.generation += 1;
        rebuilt?;

        log::info!(
            "texture memory reallocated: {old_capacity} -> {capacity} bytes, {} images recreated",
            self.textures.len()
        );
        Ok(())
    }

    /// Recreates every texture inside the new block. Once one fails, it and
    /// the textures after it are destroyed, since their images are still
    /// bound to the old block.
    fn rebuild(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        textures: &mut BTreeMap<TextureHandle, TextureBinding<D>>,
    ) -> Result<()> {
        let mut failure = None;
        textures.retain(|handle, texture| {
            if failure.is_none() {
                match self.recreate(device, buffers, texture) {
                    Ok(()) => return true,
                    Err(e) => failure = Some(e),
                }
            }
            device.destroy_image(
                texture.image_handle,
                Some(texture.image_view),
                Some(texture.sampler),
            );
            log::warn!(
                "texture {} dropped, it could not be recreated in the new block",
                handle.id()
            );
            false
        });
        failure.map_or(Ok(()), Err)
    }

    fn recreate(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        texture: &mut TextureBinding<D>,
    ) -> Result<()> {
        let (image, footprint) =
            device.create_image(texture.width, texture.height, texture.mip_levels)?;
        let Some(offset) = self.arena.allocate(footprint.size, footprint.alignment) else {
            device.destroy_image(image, None, None);
            return Err(RendererError::OutOfDeviceMemory {
                what: "texture memory",
            });
        };
        let gpu = self.fill(
            device,
            buffers,
            image,
            &texture.pixels,
            texture.width,
            texture.height,
            texture.mip_levels,
            offset,
        )?;

        device.destroy_image(
            texture.image_handle,
            Some(texture.image_view),
            Some(texture.sampler),
        );
        texture.image_handle = gpu.image;
        texture.image_view = gpu.view;
        texture.sampler = gpu.sampler;
        texture.memory_offset = gpu.offset;
        Ok(())
    }

    /// Destroys a texture and frees its memory region. The caller makes sure
    /// no in-flight frame samples it.
    pub fn remove(&mut self, device: &mut D, handle: TextureHandle) -> Result<()> {
        if self.missing == Some(handle) {
            return Err(handle.invalid());
        }
        let texture = self.textures.remove(&handle).ok_or_else(|| handle.invalid())?;
        self.arena.free(texture.memory_offset)?;
        device.destroy_image(
            texture.image_handle,
            Some(texture.image_view),
            Some(texture.sampler),
        );
        log::debug!("texture {} removed", handle.id());
        Ok(())
    }

    /// The texture an asset samples: `requested` if it is live, otherwise
    /// the missing-texture placeholder, created on first use.
    pub fn resolve(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
        requested: Option<TextureHandle>,
    ) -> Result<TextureHandle> {
        match requested {
            Some(handle) if self.textures.contains_key(&handle) => Ok(handle),
            Some(handle) => {
                log::warn!(
                    "texture {} is not live, sampling the missing texture",
                    handle.id()
                );
                self.missing_texture(device, buffers)
            }
            None => self.missing_texture(device, buffers),
        }
    }

    fn missing_texture(
        &mut self,
        device: &mut D,
        buffers: &mut BufferGrowthManager<D>,
    ) -> Result<TextureHandle> {
        if let Some(handle) = self.missing {
            return Ok(handle);
        }
        let handle = self.upload(
            device,
            buffers,
            &missing_texture_pixels(),
            MISSING_TEXTURE_SIZE,
            MISSING_TEXTURE_SIZE,
        )?;
        self.missing = Some(handle);
        log::debug!("missing texture created as texture {}", handle.id());
        Ok(handle)
    }

    pub fn destroy(&mut self, device: &mut D) {
        for (_, texture) in std::mem::take(&mut self.textures) {
            device.destroy_image(
                texture.image_handle,
                Some(texture.image_view),
                Some(texture.sampler),
            );
        }
        if let Some(memory) = self.memory.take() {
            device.free_image_memory(memory);
        }
        self.missing = None;
    }
}
