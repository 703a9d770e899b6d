//! Binding a GPU producer to a pcon, and tearing the binding down again.
//!
//! `Detached -> Attaching -> Attached -> Detaching -> Detached`. The transitional states are held
//! while collaborator callbacks run without the buffer mutex. A concurrent explicit attach or
//! detach fails fast with `Busy`; teardown paths (`force_detach`, `destroy`) wait for the
//! transition to finish instead.

use std::sync::Arc;

use crate::error::{Result, VcrtcmError};
use crate::fb::{refresh_xmit_gate, request_xmit};
use crate::hal::{GpuFuncs, HalDescriptor, PconFuncs};
use crate::manager::Vcrtcm;
use crate::registry::{lock, AttachState, Pcon, PconState, VblankLinks};
use crate::types::{BufferKind, FbStatus, PconId, XferMode};
use crate::vblank::period_ns_from_fps;

impl Vcrtcm {
    /// Attach `gpu` to `pconid` and return the negotiated transfer mode.
    ///
    /// Whatever the consumer is already showing (framebuffer, cursor, fps, DPMS) is adopted and
    /// the push buffers are sized for it, so the first tick after attach can transmit.
    pub fn attach(&self, pconid: PconId, gpu: Arc<dyn GpuFuncs>) -> Result<XferMode> {
        let pcon = self.pcons.lookup(pconid)?;
        let consumer = {
            let mut state = lock(&pcon.state);
            if state.retired {
                return Err(VcrtcmError::PconNotFound(pconid));
            }
            if !matches!(state.attach, AttachState::Detached) {
                return Err(VcrtcmError::Busy(pconid));
            }
            state.attach = AttachState::Attaching;
            Arc::clone(&state.consumer)
        };

        let negotiated = XferMode::negotiate(gpu.xfer_caps(), consumer.xfer_caps())
            .and_then(|mode| consumer.attach(pconid).map(|()| mode));

        let mut state = lock(&pcon.state);
        let mode = match negotiated {
            Ok(mode) => mode,
            Err(err) => {
                pcon.settle(&mut state, AttachState::Detached);
                return Err(err);
            }
        };
        if state.retired {
            // Destroyed while the consumer callback ran; the destroyer waits for this rollback.
            pcon.settle(&mut state, AttachState::Detached);
            drop(state);
            rollback_consumer(pconid, &*consumer);
            tracing::debug!(pconid, "attach abandoned; pcon destroyed meanwhile");
            return Err(VcrtcmError::PconNotFound(pconid));
        }
        if let Err(err) = self.adopt_consumer_state(pconid, &mut state, &*consumer, &*gpu, mode) {
            state.buffers.release_all(&*gpu, &self.metrics);
            pcon.settle(&mut state, AttachState::Detached);
            drop(state);
            rollback_consumer(pconid, &*consumer);
            return Err(err);
        }

        let mut hal = HalDescriptor::new(pconid, Arc::clone(&gpu), mode);
        hal.dpms = state.dpms;
        pcon.settle(&mut state, AttachState::Attached(hal));
        state.last_xmit_ns = 0;
        refresh_xmit_gate(&mut state);
        request_xmit(&pcon, &mut state);
        lock(&pcon.schedule).arm(period_ns_from_fps(state.fps));
        pcon.gate.open(VblankLinks { gpu, consumer });
        drop(state);

        self.metrics.attached();
        tracing::info!(pconid, ?mode, "pcon attached");
        Ok(mode)
    }

    fn adopt_consumer_state(
        &self,
        pconid: PconId,
        state: &mut PconState,
        consumer: &dyn PconFuncs,
        gpu: &dyn GpuFuncs,
        mode: XferMode,
    ) -> Result<()> {
        if let Some(fps) = consumer.get_fps(pconid) {
            if fps <= self.config.max_fps {
                state.fps = fps;
            } else {
                tracing::warn!(pconid, fps, "ignoring out-of-range consumer fps");
            }
        }
        if let Some(dpms) = consumer.get_dpms(pconid) {
            state.dpms = dpms;
        }
        if let Some(fb) = consumer.get_fb(pconid) {
            match fb.validate(self.config.max_fb_width, self.config.max_fb_height) {
                Ok(()) => state.fb = Some(fb),
                Err(err) => tracing::warn!(pconid, %err, "ignoring consumer framebuffer"),
            }
        }
        if let Some(cursor) = consumer.get_cursor(pconid) {
            match cursor.validate(self.config.max_cursor_width, self.config.max_cursor_height) {
                Ok(()) => state.cursor = Some(cursor),
                Err(err) => tracing::warn!(pconid, %err, "ignoring consumer cursor"),
            }
        }
        if mode.uses_push_buffers() {
            self.resize_buffers(pconid, state, gpu, BufferKind::Framebuffer)?;
            self.resize_buffers(pconid, state, gpu, BufferKind::Cursor)?;
        }
        Ok(())
    }

    /// Detach on explicit request. An unattached pcon is an error.
    pub fn detach(&self, pconid: PconId) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        self.detach_pcon(&pcon, false)
    }

    /// Detach on a teardown path. An unattached pcon is a successful no-op.
    pub fn force_detach(&self, pconid: PconId) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        self.detach_pcon(&pcon, true)
    }

    pub(crate) fn detach_pcon(&self, pcon: &Pcon, forced: bool) -> Result<()> {
        let pconid = pcon.id;
        let (hal, consumer) = {
            let mut state = lock(&pcon.state);
            if forced {
                state = pcon.wait_settled(state);
            }
            let hal = match std::mem::replace(&mut state.attach, AttachState::Detaching) {
                AttachState::Attached(hal) => hal,
                AttachState::Detached => {
                    state.attach = AttachState::Detached;
                    return if forced {
                        Ok(())
                    } else {
                        Err(VcrtcmError::NotAttached(pconid))
                    };
                }
                other => {
                    state.attach = other;
                    return Err(VcrtcmError::Busy(pconid));
                }
            };
            // No vblank is delivered once the gate is closed: callbacks still running have
            // returned, and `tick` finds the schedule disarmed.
            pcon.gate.close();
            lock(&pcon.schedule).disarm();
            (hal, Arc::clone(&state.consumer))
        };

        tracing::debug!(
            pconid = hal.pconid,
            mode = ?hal.xfer_mode,
            dpms = ?hal.dpms,
            "releasing attachment"
        );
        hal.gpu.sync(pconid);

        {
            let mut state = lock(&pcon.state);
            state.buffers.release_all(&*hal.gpu, &self.metrics);
            state.fb_force_xmit = false;
            pcon.settle(&mut state, AttachState::Detached);
        }
        pcon.status.clear(FbStatus::all());

        if let Err(err) = consumer.detach(pconid) {
            tracing::warn!(pconid, %err, "consumer detach callback failed");
        }
        hal.gpu.detach(pconid);

        self.metrics.detached();
        tracing::info!(pconid, forced, "pcon detached");
        Ok(())
    }

    /// Force-detach every pcon attached to `gpu`. Returns how many were detached.
    ///
    /// Call this before dropping a GPU implementation so no pcon keeps calling into it.
    pub fn unregister_gpu(&self, gpu: &Arc<dyn GpuFuncs>) -> usize {
        let mut detached = 0;
        for pcon in self.pcons.live() {
            let attached_here = lock(&pcon.state)
                .attach
                .hal()
                .is_some_and(|hal| hal.is_gpu(gpu));
            if !attached_here {
                continue;
            }
            match self.detach_pcon(&pcon, true) {
                Ok(()) => detached += 1,
                Err(err) => tracing::warn!(pconid = pcon.id, %err, "forced detach failed"),
            }
        }
        tracing::info!(detached, "GPU unregistered");
        detached
    }

    /// Swap the GPU implementation of an attached pcon without a detach/attach cycle.
    ///
    /// Push buffers belong to the GPU that allocated them: the old GPU frees its pair and the
    /// new one allocates a fresh pair for the current descriptors. If that allocation fails the
    /// swap still stands, transmission stays closed and the error is returned; the next
    /// successful `set_fb` reopens it.
    pub fn replace_gpu_funcs(&self, pconid: PconId, gpu: Arc<dyn GpuFuncs>) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        let mut guard = lock(&pcon.state);
        let state = &mut *guard;
        let consumer = Arc::clone(&state.consumer);
        let hal = state
            .attach
            .hal_mut()
            .ok_or(VcrtcmError::NotAttached(pconid))?;
        if hal.is_gpu(&gpu) {
            return Ok(());
        }
        let old = std::mem::replace(&mut hal.gpu, Arc::clone(&gpu));
        let uses_push_buffers = hal.xfer_mode.uses_push_buffers();
        pcon.gate.open(VblankLinks {
            gpu: Arc::clone(&gpu),
            consumer,
        });

        state.buffers.release_all(&*old, &self.metrics);
        let realloc = if uses_push_buffers {
            self.resize_buffers(pconid, state, &*gpu, BufferKind::Framebuffer)
                .and_then(|()| self.resize_buffers(pconid, state, &*gpu, BufferKind::Cursor))
        } else {
            Ok(())
        };
        if realloc.is_err() {
            state.buffers.release_all(&*gpu, &self.metrics);
        }
        refresh_xmit_gate(state);
        request_xmit(&pcon, state);
        match realloc {
            Ok(()) => {
                tracing::debug!(pconid, "GPU function table replaced");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(pconid, %err, "GPU replaced but push buffers could not be reallocated");
                Err(err)
            }
        }
    }

    /// Swap the consumer implementation of a pcon in place.
    pub fn replace_pcon_funcs(&self, pconid: PconId, funcs: Arc<dyn PconFuncs>) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        let mut state = lock(&pcon.state);
        match &state.attach {
            AttachState::Attaching | AttachState::Detaching => {
                return Err(VcrtcmError::Busy(pconid))
            }
            AttachState::Attached(hal) => pcon.gate.open(VblankLinks {
                gpu: Arc::clone(&hal.gpu),
                consumer: Arc::clone(&funcs),
            }),
            AttachState::Detached => {}
        }
        state.consumer = funcs;
        tracing::debug!(pconid, "consumer function table replaced");
        Ok(())
    }
}

fn rollback_consumer(pconid: PconId, consumer: &dyn PconFuncs) {
    if let Err(err) = consumer.detach(pconid) {
        tracing::warn!(pconid, %err, "consumer detach failed during attach rollback");
    }
}
