//! Per-pcon display state: framebuffer, cursor, frame rate, DPMS and consumer queries.
//!
//! Setters run under the pcon's buffer mutex, forward to the consumer first and only then touch
//! the push buffers. A rejected request changes nothing; a failed resize hands the previous
//! descriptor back to the consumer. `get_fb_status` and `page_flip` never take the buffer mutex.

use std::sync::Arc;

use crate::error::{Result, VcrtcmError};
use crate::hal::{GpuFuncs, PconFuncs};
use crate::manager::Vcrtcm;
use crate::registry::{lock, Pcon, PconState};
use crate::types::{
    BufferKind, CursorDescriptor, DpmsState, FbDescriptor, FbStatus, Mode, PconId,
};
use crate::vblank::period_ns_from_fps;

/// Ask the next vblank to transmit regardless of the hard deadline.
pub(crate) fn request_xmit(pcon: &Pcon, state: &mut PconState) {
    state.fb_force_xmit = true;
    pcon.status.set(FbStatus::XMIT_PENDING);
}

/// Transmission is allowed while a non-empty framebuffer is set and the display is powered. In
/// push mode the framebuffer push buffers must exist as well.
pub(crate) fn refresh_xmit_gate(state: &mut PconState) {
    let buffers_ready = push_gpu(state).is_none() || state.buffers.has_fb();
    state.fb_xmit_allowed = state.fb.is_some_and(|fb| !fb.is_empty())
        && state.dpms == DpmsState::On
        && buffers_ready;
}

/// GPU that owns the push buffers, when the attachment uses them.
pub(crate) fn push_gpu(state: &PconState) -> Option<Arc<dyn GpuFuncs>> {
    state
        .attach
        .hal()
        .filter(|hal| hal.xfer_mode.uses_push_buffers())
        .map(|hal| Arc::clone(&hal.gpu))
}

impl Vcrtcm {
    fn with_state<R>(
        &self,
        pconid: PconId,
        f: impl FnOnce(&Pcon, &mut PconState) -> Result<R>,
    ) -> Result<R> {
        let pcon = self.pcons.lookup(pconid)?;
        let mut state = lock(&pcon.state);
        f(&pcon, &mut *state)
    }

    fn consumer(&self, pconid: PconId) -> Result<Arc<dyn PconFuncs>> {
        self.with_state(pconid, |_, state| Ok(Arc::clone(&state.consumer)))
    }

    /// Size both slots of `kind` for the descriptor currently stored in `state`.
    pub(crate) fn resize_buffers(
        &self,
        pconid: PconId,
        state: &mut PconState,
        gpu: &dyn GpuFuncs,
        kind: BufferKind,
    ) -> Result<()> {
        let bytes = match kind {
            BufferKind::Framebuffer => state.fb.map_or(Some(0), |fb| fb.size_bytes()),
            BufferKind::Cursor => state.cursor.map_or(Some(0), |c| c.size_bytes()),
        }
        .ok_or_else(|| VcrtcmError::invalid("buffer size overflows"))?;
        state
            .buffers
            .ensure_size(gpu, pconid, kind, bytes, self.config.page_size, &self.metrics)
    }

    pub fn set_fb(&self, pconid: PconId, fb: &FbDescriptor) -> Result<()> {
        fb.validate(self.config.max_fb_width, self.config.max_fb_height)?;
        self.with_state(pconid, |pcon, state| {
            state.consumer.set_fb(pconid, fb)?;
            let previous = state.fb.replace(*fb);
            if let Some(gpu) = push_gpu(state) {
                if let Err(err) =
                    self.resize_buffers(pconid, state, &*gpu, BufferKind::Framebuffer)
                {
                    // The push buffers still match `previous`; put the consumer back on it too.
                    state.fb = previous;
                    let restore = previous.unwrap_or_default();
                    if let Err(restore_err) = state.consumer.set_fb(pconid, &restore) {
                        tracing::warn!(pconid, err = %restore_err, "consumer kept the rejected framebuffer");
                    }
                    return Err(err);
                }
            }
            refresh_xmit_gate(state);
            request_xmit(pcon, state);
            tracing::debug!(
                pconid,
                width = fb.width,
                height = fb.height,
                bpp = fb.bpp,
                "framebuffer set"
            );
            Ok(())
        })
    }

    pub fn get_fb(&self, pconid: PconId) -> Result<Option<FbDescriptor>> {
        self.with_state(pconid, |_, state| Ok(state.fb))
    }

    pub fn set_cursor(&self, pconid: PconId, cursor: &CursorDescriptor) -> Result<()> {
        cursor.validate(self.config.max_cursor_width, self.config.max_cursor_height)?;
        self.with_state(pconid, |pcon, state| {
            state.consumer.set_cursor(pconid, cursor)?;
            let previous = state.cursor.replace(*cursor);
            if let Some(gpu) = push_gpu(state) {
                if let Err(err) = self.resize_buffers(pconid, state, &*gpu, BufferKind::Cursor) {
                    state.cursor = previous;
                    let restore = previous.unwrap_or_default();
                    if let Err(restore_err) = state.consumer.set_cursor(pconid, &restore) {
                        tracing::warn!(pconid, err = %restore_err, "consumer kept the rejected cursor");
                    }
                    return Err(err);
                }
            }
            request_xmit(pcon, state);
            Ok(())
        })
    }

    pub fn get_cursor(&self, pconid: PconId) -> Result<Option<CursorDescriptor>> {
        self.with_state(pconid, |_, state| Ok(state.cursor))
    }

    /// The producer changed pixels inside the current framebuffer.
    pub fn dirty_fb(&self, pconid: PconId) -> Result<()> {
        self.with_state(pconid, |pcon, state| {
            state.consumer.dirty_fb(pconid)?;
            request_xmit(pcon, state);
            Ok(())
        })
    }

    /// Block until the consumer finished reading the current frame.
    pub fn wait_fb(&self, pconid: PconId) -> Result<()> {
        self.consumer(pconid)?.wait_fb(pconid)
    }

    /// Manager status bits merged with the consumer's own. Never blocks.
    pub fn get_fb_status(&self, pconid: PconId) -> Result<FbStatus> {
        let pcon = self.pcons.lookup(pconid)?;
        let mut status = pcon.status.flags();
        if let Some(links) = pcon.gate.enter() {
            status |= links.consumer.get_fb_status(pconid);
        }
        Ok(status)
    }

    /// Set the target frame rate; 0 stops vblank emulation.
    pub fn set_fps(&self, pconid: PconId, fps: u32) -> Result<()> {
        if fps > self.config.max_fps {
            return Err(VcrtcmError::invalid(format!(
                "fps {fps} exceeds {}",
                self.config.max_fps
            )));
        }
        self.with_state(pconid, |pcon, state| {
            state.consumer.set_fps(pconid, fps)?;
            state.fps = fps;
            if state.attach.hal().is_some() {
                lock(&pcon.schedule).arm(period_ns_from_fps(fps));
            }
            if fps > 0 {
                request_xmit(pcon, state);
            }
            tracing::debug!(pconid, fps, "fps set");
            Ok(())
        })
    }

    pub fn get_fps(&self, pconid: PconId) -> Result<u32> {
        self.with_state(pconid, |_, state| Ok(state.fps))
    }

    /// Transmit on the next vblank even if nothing was marked dirty.
    pub fn force_transmit(&self, pconid: PconId) -> Result<()> {
        self.with_state(pconid, |pcon, state| {
            request_xmit(pcon, state);
            Ok(())
        })
    }

    pub fn set_dpms(&self, pconid: PconId, dpms: DpmsState) -> Result<()> {
        self.with_state(pconid, |pcon, state| {
            state.consumer.set_dpms(pconid, dpms)?;
            state.dpms = dpms;
            if let Some(hal) = state.attach.hal_mut() {
                hal.dpms = dpms;
            }
            refresh_xmit_gate(state);
            if dpms == DpmsState::On {
                request_xmit(pcon, state);
            }
            tracing::debug!(pconid, ?dpms, "dpms set");
            Ok(())
        })
    }

    pub fn get_dpms(&self, pconid: PconId) -> Result<DpmsState> {
        self.with_state(pconid, |_, state| Ok(state.dpms))
    }

    pub fn connected(&self, pconid: PconId) -> Result<bool> {
        Ok(self.consumer(pconid)?.connected(pconid))
    }

    pub fn get_modes(&self, pconid: PconId) -> Result<Vec<Mode>> {
        Ok(self.consumer(pconid)?.get_modes(pconid))
    }

    pub fn check_mode(&self, pconid: PconId, mode: &Mode) -> Result<bool> {
        Ok(self.consumer(pconid)?.check_mode(pconid, mode))
    }

    /// Turn the output off. Transmission stays closed until the next `set_fb` or DPMS on.
    pub fn disable(&self, pconid: PconId) -> Result<()> {
        self.with_state(pconid, |pcon, state| {
            state.consumer.disable(pconid)?;
            state.fb_xmit_allowed = false;
            state.fb_force_xmit = false;
            pcon.status.clear(FbStatus::XMIT_PENDING);
            tracing::debug!(pconid, "pcon disabled");
            Ok(())
        })
    }

    /// Publish a new scanout offset. Never blocks; the flip completes on the next vblank.
    pub fn page_flip(&self, pconid: PconId, fb_offset: u64) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        let links = pcon.gate.enter().ok_or(VcrtcmError::NotAttached(pconid))?;
        links.consumer.page_flip(pconid, fb_offset)?;
        pcon.status.publish_flip(fb_offset);
        Ok(())
    }

    /// Scanout offset published by the most recent `page_flip`.
    pub fn flip_offset(&self, pconid: PconId) -> Result<u64> {
        Ok(self.pcons.lookup(pconid)?.status.flip_offset())
    }

    /// The consumer's connection state changed: tell the GPU and resend the frame.
    pub fn hotplug(&self, pconid: PconId) -> Result<()> {
        let gpu = self.with_state(pconid, |pcon, state| {
            let gpu = state.attach.hal().map(|hal| Arc::clone(&hal.gpu));
            if gpu.is_some() {
                request_xmit(pcon, state);
            }
            Ok(gpu)
        })?;
        if let Some(gpu) = gpu {
            gpu.hotplug(pconid);
        }
        tracing::debug!(pconid, "hotplug");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::{MemoryPim, SoftwareGpu};
    use crate::config::VcrtcmConfig;
    use crate::ErrorKind;

    fn attached() -> (Vcrtcm, Arc<MemoryPim>, Arc<SoftwareGpu>, PconId) {
        let vcrtcm = Vcrtcm::new(VcrtcmConfig::default()).unwrap();
        let pim = Arc::new(MemoryPim::new());
        vcrtcm.register_pim("mem", pim.clone()).unwrap();
        let pconid = vcrtcm.instantiate("mem", 0).unwrap();
        let gpu = Arc::new(SoftwareGpu::new());
        vcrtcm.attach(pconid, gpu.clone()).unwrap();
        (vcrtcm, pim, gpu, pconid)
    }

    #[test]
    fn set_fb_round_trips_and_reaches_consumer() {
        let (vcrtcm, pim, _gpu, pconid) = attached();
        let fb = FbDescriptor {
            width: 800,
            height: 600,
            pitch: 800 * 4 + 64,
            bpp: 32,
            viewport_x: 16,
            viewport_y: 8,
            hdisplay: 640,
            vdisplay: 480,
        };
        vcrtcm.set_fb(pconid, &fb).unwrap();
        assert_eq!(vcrtcm.get_fb(pconid).unwrap(), Some(fb));
        assert_eq!(pim.pcon(pconid).unwrap().get_fb(pconid), Some(fb));
    }

    #[test]
    fn invalid_framebuffer_changes_nothing() {
        let (vcrtcm, _pim, gpu, pconid) = attached();
        let too_big = FbDescriptor::packed(8192, 16, 32);
        assert_eq!(
            vcrtcm.set_fb(pconid, &too_big).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(vcrtcm.get_fb(pconid).unwrap(), None);
        assert_eq!(gpu.live_allocations(), 0);
    }

    #[test]
    fn failed_resize_keeps_previous_framebuffer_live() {
        let (vcrtcm, pim, gpu, pconid) = attached();
        let consumer = pim.pcon(pconid).unwrap();
        let small = FbDescriptor::packed(32, 32, 32);
        vcrtcm.set_fb(pconid, &small).unwrap();
        let before = vcrtcm
            .push_buffer_info(pconid, BufferKind::Framebuffer)
            .unwrap();

        gpu.fail_alloc_after(1);
        let err = vcrtcm
            .set_fb(pconid, &FbDescriptor::packed(64, 64, 32))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(vcrtcm.get_fb(pconid).unwrap(), Some(small));
        assert_eq!(consumer.get_fb(pconid), Some(small));
        assert_eq!(
            vcrtcm
                .push_buffer_info(pconid, BufferKind::Framebuffer)
                .unwrap(),
            before
        );
        assert_eq!(gpu.live_allocations(), 2);
        assert!(vcrtcm.pcon_info(pconid).unwrap().fb_xmit_allowed);

        // Frames keep flowing at the old size.
        gpu.render(&[0x5a; 32 * 32 * 4]);
        vcrtcm.set_fps(pconid, 60).unwrap();
        vcrtcm.tick(0);
        assert_eq!(consumer.frames(), 1);
        assert_eq!(consumer.screen(), vec![0x5a; 32 * 32 * 4]);
    }

    #[test]
    fn failed_cursor_resize_restores_previous_cursor() {
        let (vcrtcm, pim, gpu, pconid) = attached();
        let consumer = pim.pcon(pconid).unwrap();
        let cursor = CursorDescriptor {
            width: 16,
            height: 16,
            bpp: 32,
            location_x: 0,
            location_y: 0,
            visible: true,
        };
        vcrtcm.set_cursor(pconid, &cursor).unwrap();

        gpu.fail_alloc_after(0);
        let bigger = CursorDescriptor {
            width: 64,
            height: 64,
            ..cursor
        };
        assert!(vcrtcm.set_cursor(pconid, &bigger).is_err());
        assert_eq!(vcrtcm.get_cursor(pconid).unwrap(), Some(cursor));
        assert_eq!(consumer.get_cursor(pconid), Some(cursor));
        let slots = vcrtcm
            .push_buffer_info(pconid, BufferKind::Cursor)
            .unwrap()
            .unwrap();
        assert_eq!(slots[0].pages, 1);
    }

    #[test]
    fn cursor_buffers_follow_cursor_size() {
        let (vcrtcm, _pim, _gpu, pconid) = attached();
        let cursor = CursorDescriptor {
            width: 64,
            height: 64,
            bpp: 32,
            location_x: -3,
            location_y: 10,
            visible: true,
        };
        vcrtcm.set_cursor(pconid, &cursor).unwrap();
        assert_eq!(vcrtcm.get_cursor(pconid).unwrap(), Some(cursor));
        let slots = vcrtcm
            .push_buffer_info(pconid, BufferKind::Cursor)
            .unwrap()
            .unwrap();
        assert_eq!(slots[0].pages, 4);
        assert_eq!(slots[1].pages, 4);

        let too_big = CursorDescriptor {
            width: 65,
            ..cursor
        };
        assert!(vcrtcm.set_cursor(pconid, &too_big).is_err());
    }

    #[test]
    fn fps_bounds_and_force_flag() {
        let (vcrtcm, pim, _gpu, pconid) = attached();
        assert_eq!(
            vcrtcm.set_fps(pconid, 10_000).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        vcrtcm.set_fps(pconid, 30).unwrap();
        assert_eq!(vcrtcm.get_fps(pconid).unwrap(), 30);
        assert_eq!(pim.pcon(pconid).unwrap().fps(), 30);
        assert!(vcrtcm.pcon_info(pconid).unwrap().fb_force_xmit);
    }

    #[test]
    fn dpms_gates_transmission() {
        let (vcrtcm, _pim, _gpu, pconid) = attached();
        vcrtcm
            .set_fb(pconid, &FbDescriptor::packed(16, 16, 32))
            .unwrap();
        assert!(vcrtcm.pcon_info(pconid).unwrap().fb_xmit_allowed);

        vcrtcm.set_dpms(pconid, DpmsState::Standby).unwrap();
        assert!(!vcrtcm.pcon_info(pconid).unwrap().fb_xmit_allowed);
        assert_eq!(vcrtcm.get_dpms(pconid).unwrap(), DpmsState::Standby);

        vcrtcm.set_dpms(pconid, DpmsState::On).unwrap();
        let info = vcrtcm.pcon_info(pconid).unwrap();
        assert!(info.fb_xmit_allowed);
        assert!(info.fb_force_xmit);
    }

    #[test]
    fn disable_closes_gate_until_next_set_fb() {
        let (vcrtcm, _pim, _gpu, pconid) = attached();
        let fb = FbDescriptor::packed(16, 16, 32);
        vcrtcm.set_fb(pconid, &fb).unwrap();
        vcrtcm.disable(pconid).unwrap();
        let info = vcrtcm.pcon_info(pconid).unwrap();
        assert!(!info.fb_xmit_allowed && !info.fb_force_xmit);

        vcrtcm.set_fb(pconid, &fb).unwrap();
        assert!(vcrtcm.pcon_info(pconid).unwrap().fb_xmit_allowed);
    }

    #[test]
    fn status_merges_consumer_bits_and_flip() {
        let (vcrtcm, pim, _gpu, pconid) = attached();
        let consumer = pim.pcon(pconid).unwrap();
        consumer.set_busy(true);

        vcrtcm.page_flip(pconid, 0x4000).unwrap();
        let status = vcrtcm.get_fb_status(pconid).unwrap();
        assert!(status.contains(FbStatus::CONSUMER_BUSY | FbStatus::FLIP_PENDING));
        assert_eq!(vcrtcm.flip_offset(pconid).unwrap(), 0x4000);
        assert_eq!(consumer.page_flips(), 1);
        assert_eq!(consumer.last_flip_offset(), 0x4000);

        // The flip completes on the next vblank.
        vcrtcm.emulate_vblank(pconid, 10).unwrap();
        assert!(!vcrtcm
            .get_fb_status(pconid)
            .unwrap()
            .contains(FbStatus::FLIP_PENDING));
    }

    #[test]
    fn page_flip_requires_attachment() {
        let vcrtcm = Vcrtcm::new(VcrtcmConfig::default()).unwrap();
        vcrtcm.register_pim("mem", Arc::new(MemoryPim::new())).unwrap();
        let pconid = vcrtcm.instantiate("mem", 0).unwrap();
        assert!(matches!(
            vcrtcm.page_flip(pconid, 0),
            Err(VcrtcmError::NotAttached(_))
        ));
    }

    #[test]
    fn consumer_queries() {
        let (vcrtcm, pim, gpu, pconid) = attached();
        let consumer = pim.pcon(pconid).unwrap();
        let mode = Mode {
            width: 1024,
            height: 768,
            refresh_hz: 60,
        };
        consumer.set_modes(vec![mode]);
        assert_eq!(vcrtcm.get_modes(pconid).unwrap(), vec![mode]);
        assert!(vcrtcm.check_mode(pconid, &mode).unwrap());
        assert!(!vcrtcm
            .check_mode(pconid, &Mode { refresh_hz: 75, ..mode })
            .unwrap());

        assert!(vcrtcm.connected(pconid).unwrap());
        consumer.set_connected(false);
        assert!(!vcrtcm.connected(pconid).unwrap());

        vcrtcm.wait_fb(pconid).unwrap();
        vcrtcm.hotplug(pconid).unwrap();
        assert_eq!(gpu.hotplugs(), 1);
    }
}
