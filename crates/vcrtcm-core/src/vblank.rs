//! Vblank emulation and frame transmission.
//!
//! [`Vcrtcm::tick`] is driven by an external monotonic clock (the tokio driver, or a test stepping
//! time by hand). Each due vblank runs one emulation step: transmit a fresh frame when one is
//! wanted and possible, then deliver the vblank. A failed push still delivers the vblank, so
//! downstream waiters keep advancing while the screen repeats the last frame.
//!
//! A tick never waits for a pcon's buffer mutex. While a blocking operation holds it, due
//! vblanks are delivered without a push and the transmit request stays pending for a later tick.

use std::sync::{Arc, TryLockError};

use serde::Serialize;

use crate::cursor::{CursorImage, Frame};
use crate::error::{Result, VcrtcmError};
use crate::hal::{GpuFuncs, VblankTiming};
use crate::manager::Vcrtcm;
use crate::registry::{Pcon, PconState};
use crate::types::{BufferKind, FbStatus, PconId};

/// Convert a frame rate into a vblank period in nanoseconds.
///
/// Returns `None` when emulation is disabled (`fps == 0`).
pub fn period_ns_from_fps(fps: u32) -> Option<u64> {
    if fps == 0 {
        return None;
    }
    // Use ceil division to keep 60 fps at 16_666_667 ns (rather than truncating to 16_666_666).
    Some(1_000_000_000u64.div_ceil(u64::from(fps)))
}

/// Last emulated vblank of a pcon, as read from the lock-free status block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VblankStamp {
    pub count: u64,
    pub last_ns: u64,
}

impl Vcrtcm {
    /// Emulate every vblank due at `now_ns` on every attached pcon.
    ///
    /// Returns the earliest upcoming vblank deadline, or `None` when no pcon has emulation
    /// scheduled.
    pub fn tick(&self, now_ns: u64) -> Option<u64> {
        self.pcons
            .live()
            .iter()
            .filter_map(|pcon| self.tick_pcon(pcon, now_ns))
            .min()
    }

    fn tick_pcon(&self, pcon: &Pcon, now_ns: u64) -> Option<u64> {
        let mut state = match pcon.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        let mut schedule = match pcon.schedule.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // Another tick is servicing this pcon.
            Err(TryLockError::WouldBlock) => return None,
        };
        let period = schedule.period_ns?;
        if !schedule.timing.valid {
            // A freshly scheduled pcon gets its first vblank right away.
            schedule.timing = VblankTiming {
                last_ns: now_ns,
                next_ns: now_ns,
                valid: true,
            };
        }
        if state.is_none() {
            tracing::trace!(pconid = pcon.id, "buffer mutex busy; vblanks without push");
        }

        let mut timing = schedule.timing;
        let due_by = now_ns.saturating_add(self.config.vblank_slack_ns());
        let mut emulated = 0;
        while timing.next_ns <= due_by {
            if emulated == self.config.max_catchup_vblanks {
                tracing::debug!(
                    pconid = pcon.id,
                    behind_ns = now_ns.saturating_sub(timing.next_ns),
                    "vblank schedule fell behind; resyncing"
                );
                timing.next_ns = now_ns.saturating_add(period).max(timing.last_ns);
                break;
            }
            match state.as_deref_mut() {
                Some(state) => self.emulation_step(pcon, state, now_ns),
                // The flip stays pending so the next unblocked step transmits it.
                None => {
                    self.deliver_vblank(pcon, now_ns, false);
                }
            }
            timing.last_ns = timing.next_ns;
            timing.next_ns = timing.next_ns.saturating_add(period);
            emulated += 1;
        }

        schedule.timing = timing;
        Some(timing.next_ns)
    }

    fn emulation_step(&self, pcon: &Pcon, state: &mut PconState, now_ns: u64) {
        let gpu = state.attach.hal().map(|hal| Arc::clone(&hal.gpu));
        let forced =
            state.fb_force_xmit || pcon.status.flags().contains(FbStatus::FLIP_PENDING);
        let overdue =
            now_ns.saturating_sub(state.last_xmit_ns) > self.config.xmit_hard_deadline_ns();
        let transmit = (forced || overdue)
            && state.fb_xmit_allowed
            && state.buffers.has_fb()
            && state.consumer.connected(pcon.id);

        if let Some(gpu) = gpu.filter(|_| transmit) {
            state.fb_force_xmit = false;
            pcon.status.clear(FbStatus::XMIT_PENDING);
            state.last_xmit_ns = now_ns;
            self.push_and_transmit(pcon, state, &*gpu);
        }
        tracing::trace!(pconid = pcon.id, transmit, "vblank step");
        self.deliver_vblank(pcon, now_ns, true);
    }

    fn push_and_transmit(&self, pcon: &Pcon, state: &mut PconState, gpu: &dyn GpuFuncs) {
        let pconid = pcon.id;
        self.metrics.push_attempted();
        pcon.status.set(FbStatus::PUSH_IN_PROGRESS);
        let pushed = state.buffers.push(gpu, pconid);
        pcon.status.clear(FbStatus::PUSH_IN_PROGRESS);

        let slot = match pushed {
            Ok(slot) => slot,
            Err(err) => {
                self.metrics.push_failed();
                tracing::warn!(pconid, %err, "push failed; repeating last frame");
                return;
            }
        };
        state.frame_seq += 1;

        let (Some(fb), Some(fb_pair)) = (state.fb, state.buffers.pair(BufferKind::Framebuffer))
        else {
            return;
        };
        let cursor = match (state.cursor, state.buffers.pair(BufferKind::Cursor)) {
            (Some(desc), Some(pair)) => Some(CursorImage {
                desc,
                pixels: pair.get(slot).as_bytes(),
            }),
            _ => None,
        };
        let frame = Frame {
            seq: state.frame_seq,
            slot,
            fb,
            pixels: fb_pair.get(slot).as_bytes(),
            cursor,
        };

        match state.consumer.transmit(pconid, &frame) {
            Ok(()) => {
                state.buffers.mark_transmitted(slot);
                self.metrics.frame_transmitted();
            }
            Err(err) => {
                self.metrics.transmit_failed();
                tracing::warn!(pconid, %err, seq = state.frame_seq, "consumer rejected frame");
            }
        }
    }

    /// Run the vblank callbacks of an attached pcon. Returns the new vblank count.
    ///
    /// No lock is held while the callbacks run; the in-flight guard keeps detach waiting until
    /// the vblank is fully recorded.
    fn deliver_vblank(&self, pcon: &Pcon, now_ns: u64, complete_flip: bool) -> Option<u64> {
        let links = pcon.gate.enter()?;
        links.gpu.vblank(pcon.id);
        links.consumer.vblank(pcon.id);
        let count = pcon.status.record_vblank(now_ns);
        if complete_flip {
            pcon.status.clear(FbStatus::FLIP_PENDING);
        }
        self.metrics.vblank_emulated();
        Some(count)
    }

    /// Deliver one vblank right now, outside the regular schedule. Never blocks.
    pub fn emulate_vblank(&self, pconid: PconId, now_ns: u64) -> Result<u64> {
        let pcon = self.pcons.lookup(pconid)?;
        self.deliver_vblank(&pcon, now_ns, true)
            .ok_or(VcrtcmError::NotAttached(pconid))
    }

    pub fn get_vblank_time(&self, pconid: PconId) -> Result<VblankStamp> {
        let pcon = self.pcons.lookup(pconid)?;
        let (count, last_ns) = pcon.status.vblank();
        Ok(VblankStamp { count, last_ns })
    }
}
