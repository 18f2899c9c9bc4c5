use ash::vk;

use crate::renderer::{
    device::{AcquireOutcome, DrawCommand, FrameRecording, GpuDevice, PresentOutcome},
    utilities::BufferKind,
    RendererError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ready { image_index: u32 },
    /// Nothing was acquired, e.g. the swapchain had to be rebuilt or the
    /// window is minimized. Try again next iteration.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    /// Structural change since the command buffer was recorded.
    dirty: bool,
    recorded_image: Option<u32>,
    acquired_image: Option<u32>,
}

/// Per-slot bookkeeping of the frame loop. Slots advance round-robin.
#[derive(Debug)]
pub struct FrameSync {
    slots: Vec<Slot>,
    current: usize,
    resize_pending: Option<vk::Extent2D>,
}

impl FrameSync {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    state: SlotState::Idle,
                    dirty: true,
                    recorded_image: None,
                    acquired_image: None,
                };
                frames_in_flight.max(1)
            ],
            current: 0,
            resize_pending: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    pub fn is_dirty(&self, slot: usize) -> bool {
        self.slots[slot].dirty
    }

    pub fn mark_all_dirty(&mut self) {
        for slot in &mut self.slots {
            slot.dirty = true;
        }
    }

    pub fn any_submitted(&self) -> bool {
        self.slots.iter().any(|s| s.state == SlotState::Submitted)
    }

    /// Called once the device is idle.
    fn all_idle(&mut self) {
        for slot in &mut self.slots {
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Idle;
            }
        }
    }

    pub fn request_resize(&mut self, extent: vk::Extent2D) {
        self.resize_pending = Some(extent);
    }

    pub fn resize_pending(&self) -> Option<vk::Extent2D> {
        self.resize_pending
    }

    fn needs_recording(&self, slot: usize, image_index: u32) -> bool {
        let slot = &self.slots[slot];
        slot.dirty || slot.recorded_image != Some(image_index)
    }

    fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot {
                state: SlotState::Idle,
                dirty: true,
                recorded_image: None,
                acquired_image: None,
            };
        }
        self.current = 0;
    }
}

impl<D: GpuDevice> super::Renderer<D> {
    pub fn frame_sync(&self) -> &FrameSync {
        &self.frames
    }

    /// Waits for the current slot's previous submission and acquires the
    /// next swapchain image.
    pub fn begin_frame(&mut self) -> Result<FrameStatus> {
        if self.frames.slots[self.frames.current].state == SlotState::Recording {
            return Err(RendererError::FrameOutOfOrder(
                "begin_frame called twice without submit_and_present",
            ));
        }

        if let Some(extent) = self.frames.resize_pending {
            if extent.width == 0 || extent.height == 0 {
                return Ok(FrameStatus::Skipped);
            }
            self.recreate_swapchain(extent)?;
        }

        let slot = self.frames.current;
        self.device.wait_for_slot(slot)?;
        self.frames.slots[slot].state = SlotState::Idle;

        match self.device.acquire_next_image(slot)? {
            AcquireOutcome::OutOfDate => {
                log::debug!("swapchain out of date on acquire");
                let extent = self.device.extent();
                self.recreate_swapchain(extent)?;
                Ok(FrameStatus::Skipped)
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.frames.request_resize(self.device.extent());
                }
                let state = &mut self.frames.slots[slot];
                state.state = SlotState::Recording;
                state.acquired_image = Some(image_index);
                Ok(FrameStatus::Ready { image_index })
            }
        }
    }

    /// Re-records the current slot's command buffer if anything structural
    /// changed since it was last recorded. Returns whether it recorded.
    pub fn record_if_dirty(&mut self) -> Result<bool> {
        let slot = self.frames.current;
        let image_index = self.acquired_image(slot, "record_if_dirty before begin_frame")?;
        if !self.frames.needs_recording(slot, image_index) {
            return Ok(false);
        }

        let recording = self.build_recording();
        self.device.record_draws(slot, image_index, &recording)?;

        let state = &mut self.frames.slots[slot];
        state.dirty = false;
        state.recorded_image = Some(image_index);
        log::debug!(
            "slot {slot} recorded for image {image_index}: {} draws",
            recording.draws.len()
        );
        Ok(true)
    }

    /// Submits the current slot, presents its image and advances to the
    /// next slot.
    pub fn submit_and_present(&mut self) -> Result<()> {
        let slot = self.frames.current;
        let image_index = self.acquired_image(slot, "submit_and_present before begin_frame")?;
        if self.frames.needs_recording(slot, image_index) {
            return Err(RendererError::FrameOutOfOrder(
                "submit_and_present with a stale command buffer",
            ));
        }

        self.device.submit(slot)?;
        let state = &mut self.frames.slots[slot];
        state.state = SlotState::Submitted;
        state.acquired_image = None;

        match self.device.present(slot, image_index)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::debug!("swapchain needs recreation after present");
                self.frames.request_resize(self.device.extent());
            }
        }

        self.frames.current = (slot + 1) % self.frames.slots.len();
        Ok(())
    }

    /// Schedules a swapchain rebuild for the next `begin_frame`.
    pub fn on_window_resized(&mut self, extent: vk::Extent2D) {
        self.frames.request_resize(extent);
    }

    /// Rebuilds the swapchain after the device goes idle. Every slot is
    /// re-recorded afterwards.
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.device.wait_idle()?;
        let actual = self.device.recreate_swapchain(extent)?;
        self.frames.reset();
        self.frames.resize_pending = None;
        log::info!("swapchain recreated at {}x{}", actual.width, actual.height);
        Ok(())
    }

    /// One full frame.
    pub fn draw(&mut self) -> Result<FrameStatus> {
        self.draw_with(|_| Ok(()))
    }

    /// One full frame, with `update` run after the slot's fence wait and
    /// before recording. The acquired image is presented even if `update`
    /// fails; its error is returned afterwards.
    pub fn draw_with<F>(&mut self, update: F) -> Result<FrameStatus>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let status = self.begin_frame()?;
        if let FrameStatus::Ready { .. } = status {
            let updated = update(self);
            self.record_if_dirty()?;
            self.submit_and_present()?;
            updated?;
        }
        Ok(status)
    }

    /// Waits for the device if any submitted frame may still read what the
    /// caller is about to release.
    pub(super) fn wait_for_submitted_frames(&mut self) -> Result<()> {
        if self.frames.any_submitted() {
            self.device.wait_idle()?;
            self.frames.all_idle();
        }
        Ok(())
    }

    fn acquired_image(&self, slot: usize, context: &'static str) -> Result<u32> {
        match self.frames.slots[slot] {
            Slot {
                state: SlotState::Recording,
                acquired_image: Some(image_index),
                ..
            } => Ok(image_index),
            _ => Err(RendererError::FrameOutOfOrder(context)),
        }
    }

    /// Draws of every live asset, grouped by category.
    fn build_recording(&self) -> FrameRecording<D::Buffer, D::DescriptorSet> {
        let mut draws: Vec<_> = self
            .registry
            .assets()
            .filter_map(|binding| {
                // Sets lost to a failed pool recreation come back with the
                // next submit of that category.
                let descriptor_set = binding.descriptor_set_handle?;
                let offsets = binding.main_buffer_offsets;
                Some(DrawCommand {
                    category: binding.category,
                    position_offset: offsets.position,
                    texcoord_offset: offsets.texcoord,
                    normal_offset: offsets.normal,
                    index_offset: offsets.index,
                    index_count: binding.index_count,
                    descriptor_set,
                })
            })
            .collect();
        draws.sort_by_key(|draw| draw.category);

        FrameRecording {
            main_buffer: self.buffers.handle(BufferKind::Main),
            draws,
        }
    }
}
