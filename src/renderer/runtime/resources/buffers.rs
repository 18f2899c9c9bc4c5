use ash::vk;
use serde::Serialize;

use crate::renderer::{device::GpuDevice, utilities::BufferKind, Result};

/// Capacity bookkeeping of one GPU buffer. `used_high_water <= capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityState {
    pub capacity: u64,
    pub used_high_water: u64,
}

/// Capacity after a grow: `max(capacity * 3/2, required * 3/2)`.
#[inline]
pub fn grown_capacity(capacity: u64, required: u64) -> u64 {
    (capacity * 3 / 2).max(required * 3 / 2)
}

struct ManagedBuffer<B> {
    handle: B,
    state: CapacityState,
    /// Bumped every time the handle is replaced.
    generation: u32,
}

/// Owner of the main, uniform and staging buffers.
///
/// Growing replaces the buffer: a new one is created at the next capacity,
/// the used range `[0, used_high_water)` is copied over at the same offsets
/// and the old buffer is destroyed. Offsets handed out before a grow stay
/// valid; the handle does not.
pub struct BufferGrowthManager<D: GpuDevice> {
    buffers: Vec<ManagedBuffer<D::Buffer>>,
}

impl<D: GpuDevice> BufferGrowthManager<D> {
    pub fn new(
        device: &mut D,
        main_capacity: u64,
        uniform_capacity: u64,
        staging_capacity: u64,
    ) -> Result<Self> {
        let mut buffers = Vec::with_capacity(BufferKind::ALL.len());
        for (kind, capacity) in BufferKind::ALL.into_iter().zip([
            main_capacity,
            uniform_capacity,
            staging_capacity,
        ]) {
            let handle = device.create_buffer(kind, capacity)?;
            buffers.push(ManagedBuffer {
                handle,
                state: CapacityState {
                    capacity,
                    used_high_water: 0,
                },
                generation: 0,
            });
        }
        Ok(Self { buffers })
    }

    #[inline]
    pub fn handle(&self, kind: BufferKind) -> D::Buffer {
        self.buffers[kind.index()].handle
    }

    #[inline]
    pub fn state(&self, kind: BufferKind) -> CapacityState {
        self.buffers[kind.index()].state
    }

    #[inline]
    pub fn generation(&self, kind: BufferKind) -> u32 {
        self.buffers[kind.index()].generation
    }

    /// Records the end of the used range, e.g. after frees moved the arena's
    /// high-water mark down.
    pub fn set_high_water(&mut self, kind: BufferKind, high_water: u64) {
        let state = &mut self.buffers[kind.index()].state;
        debug_assert!(high_water <= state.capacity);
        state.used_high_water = high_water.min(state.capacity);
    }

    fn mark_used(&mut self, kind: BufferKind, end: u64) {
        let state = &mut self.buffers[kind.index()].state;
        debug_assert!(end <= state.capacity);
        state.used_high_water = state.used_high_water.max(end);
    }

    /// Makes `kind` at least `required` bytes large. Returns whether the
    /// buffer was replaced.
    pub fn request_capacity(
        &mut self,
        device: &mut D,
        kind: BufferKind,
        required: u64,
    ) -> Result<bool> {
        let current = self.buffers[kind.index()].state;
        if required <= current.capacity {
            return Ok(false);
        }

        let capacity = grown_capacity(current.capacity, required);

        // In-flight frames may still read the old buffer.
        device.wait_idle()?;

        let old = self.buffers[kind.index()].handle;
        let new = device.create_buffer(kind, capacity)?;

        if current.used_high_water > 0 {
            let copy = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: current.used_high_water,
            };
            if let Err(e) = device.copy_buffer(old, new, std::slice::from_ref(&copy)) {
                device.destroy_buffer(new);
                return Err(e);
            }
        }
        device.destroy_buffer(old);

        let managed = &mut self.buffers[kind.index()];
        managed.handle = new;
        managed.state.capacity = capacity;
        managed.generation += 1;

        log::info!(
            "{kind} grown {} -> {capacity} bytes ({} bytes carried over)",
            current.capacity,
            current.used_high_water
        );
        Ok(true)
    }

    /// Copies `bytes` into the start of the staging buffer and returns it.
    /// The contents are only valid until the next staging call.
    pub fn stage(&mut self, device: &mut D, bytes: &[u8]) -> Result<D::Buffer> {
        let len = bytes.len() as u64;
        self.request_capacity(device, BufferKind::Staging, len)?;
        let staging = self.handle(BufferKind::Staging);
        device.write_buffer(staging, 0, bytes)?;
        Ok(staging)
    }

    /// Writes `bytes` at `offset` of `kind`. Host-visible buffers are written
    /// through their mapping; the main buffer goes through the staging buffer.
    pub fn write(
        &mut self,
        device: &mut D,
        kind: BufferKind,
        offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len() as u64;
        debug_assert!(offset + len <= self.state(kind).capacity);

        if kind.is_host_visible() {
            device.write_buffer(self.handle(kind), offset, bytes)?;
        } else {
            let staging = self.stage(device, bytes)?;
            let copy = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: len,
            };
            device.copy_buffer(staging, self.handle(kind), std::slice::from_ref(&copy))?;
        }

        if kind != BufferKind::Staging {
            self.mark_used(kind, offset + len);
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut D) {
        for managed in self.buffers.drain(..) {
            device.destroy_buffer(managed.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{
        headless::HeadlessDevice, utilities::DeviceLimits, RendererError,
    };

    fn setup(main: u64) -> (HeadlessDevice, BufferGrowthManager<HeadlessDevice>) {
        let mut device = HeadlessDevice::new(DeviceLimits::default(), 2);
        let buffers = BufferGrowthManager::new(&mut device, main, 1024, 256).unwrap();
        (device, buffers)
    }

    #[test]
    fn growth_formula() {
        assert_eq!(grown_capacity(1000, 1900), 2850);
        assert_eq!(grown_capacity(1000, 1001), 1501);
        assert_eq!(grown_capacity(4096, 4100), 6150);
    }

    #[test]
    fn request_within_capacity_changes_nothing() {
        let (mut device, mut buffers) = setup(1000);
        let before = buffers.handle(BufferKind::Main);
        buffers
            .write(&mut device, BufferKind::Main, 16, &[9; 32])
            .unwrap();

        for required in [0, 500, 1000] {
            assert!(!buffers
                .request_capacity(&mut device, BufferKind::Main, required)
                .unwrap());
        }
        assert_eq!(buffers.handle(BufferKind::Main), before);
        assert_eq!(buffers.generation(BufferKind::Main), 0);
        assert_eq!(device.stats().idle_waits, 0);
        assert_eq!(device.read_buffer(before, 16, 32), Some(&[9u8; 32][..]));
    }

    #[test]
    fn grow_preserves_used_range_at_same_offsets() {
        let (mut device, mut buffers) = setup(1000);
        let pattern: Vec<u8> = (0..900u32).map(|i| (i % 251) as u8).collect();
        buffers
            .write(&mut device, BufferKind::Main, 0, &pattern)
            .unwrap();
        assert_eq!(buffers.state(BufferKind::Main).used_high_water, 900);

        let old = buffers.handle(BufferKind::Main);
        assert!(buffers
            .request_capacity(&mut device, BufferKind::Main, 1900)
            .unwrap());

        let new = buffers.handle(BufferKind::Main);
        assert_ne!(old, new);
        assert!(!device.is_live_buffer(old));
        assert_eq!(buffers.state(BufferKind::Main).capacity, 2850);
        assert_eq!(device.buffer_size(new), Some(2850));
        assert_eq!(device.read_buffer(new, 0, 900), Some(&pattern[..]));
        assert_eq!(device.stats().destroyed_while_in_flight, 0);
    }

    #[test]
    fn staging_grows_for_large_uploads() {
        let (mut device, mut buffers) = setup(8192);
        let blob = vec![7u8; 1000];
        buffers
            .write(&mut device, BufferKind::Main, 2048, &blob)
            .unwrap();

        assert!(buffers.state(BufferKind::Staging).capacity >= 1000);
        assert_eq!(buffers.state(BufferKind::Staging).used_high_water, 0);
        let main = buffers.handle(BufferKind::Main);
        assert_eq!(device.read_buffer(main, 2048, 1000), Some(&blob[..]));
        assert_eq!(buffers.state(BufferKind::Main).used_high_water, 3048);
    }

    #[test]
    fn failed_allocation_keeps_the_old_buffer() {
        let (mut device, mut buffers) = setup(1000);
        device.set_memory_budget(Some(4000));
        let old = buffers.handle(BufferKind::Main);

        let err = buffers
            .request_capacity(&mut device, BufferKind::Main, 10_000)
            .unwrap_err();
        assert!(matches!(err, RendererError::OutOfDeviceMemory { .. }));
        assert!(err.is_fatal());
        assert_eq!(buffers.handle(BufferKind::Main), old);
        assert_eq!(buffers.state(BufferKind::Main).capacity, 1000);
    }
}
