//! The manager object: owns the pcon table, the PIM registry and the metrics.
//!
//! Operations are spread over several modules as `impl Vcrtcm` blocks: attachment in
//! [`crate::attach`], framebuffer/cursor/fps control in [`crate::fb`] and vblank emulation in
//! [`crate::vblank`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{ConfigError, VcrtcmConfig};
use crate::error::{Result, VcrtcmError};
use crate::metrics::Metrics;
use crate::pim::{PimFuncs, PimRegistration, PimRegistry, PimSummary};
use crate::push_buffer::PushBufferInfo;
use crate::registry::{lock, AttachPhase, Pcon, PconRegistry};
use crate::types::{
    BufferKind, CursorDescriptor, DpmsState, FbDescriptor, PconId, PimId, PushSlot, XferMode,
};

/// Serializable snapshot of one pcon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PconDescriptor {
    pub pconid: PconId,
    pub pim: String,
    pub description: String,
    pub minor: Option<u32>,
    pub attached: bool,
    pub attach_phase: AttachPhase,
    pub xfer_mode: Option<XferMode>,
    pub fps: u32,
    pub dpms_state: DpmsState,
    pub fb: Option<FbDescriptor>,
    pub cursor: Option<CursorDescriptor>,
    pub push_buffer_index: PushSlot,
    pub last_xmit_ns: u64,
    pub fb_xmit_allowed: bool,
    pub fb_force_xmit: bool,
    /// A pushed frame is still waiting for the consumer to accept it.
    pub frame_pending: bool,
    pub frames_pushed: u64,
    pub vblank_count: u64,
    pub last_vblank_ns: u64,
    pub next_vblank_ns: Option<u64>,
}

/// Virtual CRTC manager.
pub struct Vcrtcm {
    pub(crate) config: VcrtcmConfig,
    pub(crate) pcons: PconRegistry,
    pub(crate) pims: PimRegistry,
    pub(crate) metrics: Metrics,
    shut_down: AtomicBool,
}

impl Vcrtcm {
    pub fn new(config: VcrtcmConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        tracing::debug!(
            max_pcons = config.max_pcons,
            page_size = config.page_size,
            "vcrtcm initialized"
        );
        Ok(Self {
            pcons: PconRegistry::new(config.max_pcons, config.max_minors),
            pims: PimRegistry::new(),
            metrics: Metrics::new(),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &VcrtcmConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn pconid_valid(&self, pconid: PconId) -> bool {
        self.pcons.pconid_valid(pconid)
    }

    /// Ids of every live pcon, ascending.
    pub fn pcons(&self) -> Vec<PconId> {
        self.pcons.live().iter().map(|p| p.id).collect()
    }

    pub fn pims(&self) -> Vec<PimSummary> {
        self.pims.summaries()
    }

    /// Unregister every PIM, destroying every pcon. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for name in self.pims.names() {
            if let Err(err) = self.unregister_pim(&name) {
                tracing::warn!(pim = %name, %err, "failed to unregister PIM during shutdown");
            }
        }
        tracing::info!("vcrtcm shut down");
    }

    pub fn register_pim(&self, name: &str, funcs: Arc<dyn PimFuncs>) -> Result<PimRegistration> {
        let registration = self.pims.register(name, funcs)?;
        match registration {
            PimRegistration::Registered(id) => tracing::info!(pim = name, id, "PIM registered"),
            PimRegistration::Replaced(id) => {
                tracing::info!(pim = name, id, "PIM re-registered; function table replaced")
            }
        }
        Ok(registration)
    }

    /// Destroy every pcon owned by `name`, then forget the PIM.
    ///
    /// Pcons in the middle of an attach or detach are waited for, so every pcon of the PIM is
    /// gone (and its `destroy` hook has run) when this returns.
    pub fn unregister_pim(&self, name: &str) -> Result<()> {
        let (_, funcs) = self
            .pims
            .find_by_name(name)
            .ok_or_else(|| VcrtcmError::PimNotFound(name.to_owned()))?;
        for pconid in self.pims.pcons_of(name).unwrap_or_default() {
            self.destroy_for_unregister(name, pconid, &funcs);
        }
        // Pcons instantiated while the loop above ran are still recorded; clean them up too.
        if let Some((id, leftover)) = self.pims.remove(name) {
            for pconid in leftover {
                self.destroy_for_unregister(name, pconid, &funcs);
            }
            tracing::info!(pim = name, id, "PIM unregistered");
        }
        Ok(())
    }

    fn destroy_for_unregister(&self, name: &str, pconid: PconId, funcs: &Arc<dyn PimFuncs>) {
        match self.destroy_pcon(pconid, Some(Arc::clone(funcs))) {
            Ok(()) | Err(VcrtcmError::PconNotFound(_)) => {}
            Err(err) => {
                tracing::warn!(pim = name, pconid, %err, "failed to destroy pcon of departing PIM")
            }
        }
    }

    pub fn find_pim_by_name(&self, name: &str) -> Option<PimId> {
        self.pims.find_by_name(name).map(|(id, _)| id)
    }

    pub fn find_pim_by_id(&self, id: PimId) -> Option<String> {
        self.pims.find_by_id(id).map(|(name, _)| name)
    }

    /// Run the self-test hook of the PIM registered as `name`.
    pub fn test_pim(&self, name: &str, hints: u32) -> Result<()> {
        let (_, funcs) = self
            .pims
            .find_by_name(name)
            .ok_or_else(|| VcrtcmError::PimNotFound(name.to_owned()))?;
        funcs.test(hints)
    }

    /// Create a pcon through the PIM registered as `pim_name`.
    pub fn instantiate(&self, pim_name: &str, hints: u32) -> Result<PconId> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VcrtcmError::Unsupported("manager is shut down"));
        }
        let (pim_id, funcs) = self
            .pims
            .find_by_name(pim_name)
            .ok_or_else(|| VcrtcmError::PimNotFound(pim_name.to_owned()))?;

        let pconid = self.pcons.alloc_pcon()?;
        let instance = match funcs.instantiate(pconid, hints) {
            Ok(instance) => instance,
            Err(err) => {
                self.pcons.dealloc_pcon(pconid);
                return Err(err);
            }
        };

        let minor = if instance.wants_minor {
            match self.pcons.alloc_minor() {
                Some(minor) => Some(minor),
                None => {
                    funcs.destroy(pconid);
                    self.pcons.dealloc_pcon(pconid);
                    return Err(VcrtcmError::TableFull {
                        capacity: self.config.max_minors as usize,
                    });
                }
            }
        } else {
            None
        };

        let pcon = Arc::new(Pcon::new(
            pconid,
            pim_name.to_owned(),
            pim_id,
            instance.description,
            minor,
            instance.funcs,
        ));
        let published = self
            .pcons
            .install(pcon)
            .and_then(|()| self.pims.add_pcon(pim_id, pconid));
        if let Err(err) = published {
            funcs.destroy(pconid);
            self.pcons.dealloc_pcon(pconid);
            if let Some(minor) = minor {
                self.pcons.free_minor(minor);
            }
            return Err(err);
        }

        self.metrics.pcon_created();
        tracing::info!(pim = pim_name, pconid, ?minor, "pcon instantiated");
        Ok(pconid)
    }

    /// Detach (forced) and destroy a pcon, then release its id.
    ///
    /// An attach or detach in flight on the pcon is waited for; an attach still running is
    /// rolled back and fails with `PconNotFound`.
    pub fn destroy(&self, pconid: PconId) -> Result<()> {
        self.destroy_pcon(pconid, None)
    }

    /// `fallback` is the owner's function table for callers that hold it while the PIM is being
    /// unregistered.
    fn destroy_pcon(&self, pconid: PconId, fallback: Option<Arc<dyn PimFuncs>>) -> Result<()> {
        let pcon = self.pcons.lookup(pconid)?;
        let pim = self
            .pims
            .find_by_id(pcon.pim_id)
            .map(|(_, funcs)| funcs)
            .or(fallback);
        {
            let mut state = lock(&pcon.state);
            if state.retired {
                return Err(VcrtcmError::PconNotFound(pconid));
            }
            state.retired = true;
        }

        // Gone from the table first, so no new operation can find it.
        self.pcons.dealloc_pcon(pconid);
        self.detach_pcon(&pcon, true)?;

        self.pims.remove_pcon(pcon.pim_id, pconid);
        match pim {
            Some(funcs) => funcs.destroy(pconid),
            None => tracing::warn!(pconid, pim = %pcon.pim, "owning PIM already gone"),
        }
        if let Some(minor) = pcon.minor {
            self.pcons.free_minor(minor);
        }

        self.metrics.pcon_destroyed();
        tracing::info!(pconid, pim = %pcon.pim, "pcon destroyed");
        Ok(())
    }

    pub fn pcon_info(&self, pconid: PconId) -> Result<PconDescriptor> {
        let pcon = self.pcons.lookup(pconid)?;
        let (vblank_count, last_vblank_ns) = pcon.status.vblank();
        let state = lock(&pcon.state);
        let next_vblank_ns = lock(&pcon.schedule).next_ns();
        let hal = state.attach.hal();
        Ok(PconDescriptor {
            pconid,
            pim: pcon.pim.clone(),
            description: pcon.description.clone(),
            minor: pcon.minor,
            attached: hal.is_some(),
            attach_phase: state.attach.phase(),
            xfer_mode: hal.map(|h| h.xfer_mode),
            fps: state.fps,
            dpms_state: state.dpms,
            fb: state.fb,
            cursor: state.cursor,
            push_buffer_index: state.buffers.active(),
            last_xmit_ns: state.last_xmit_ns,
            fb_xmit_allowed: state.fb_xmit_allowed,
            fb_force_xmit: state.fb_force_xmit,
            frame_pending: state.buffers.xmit_pending(),
            frames_pushed: state.frame_seq,
            vblank_count,
            last_vblank_ns,
            next_vblank_ns,
        })
    }

    /// Both slots of `kind`, or `None` while nothing is allocated.
    pub fn push_buffer_info(
        &self,
        pconid: PconId,
        kind: BufferKind,
    ) -> Result<Option<[PushBufferInfo; 2]>> {
        let pcon = self.pcons.lookup(pconid)?;
        let state = lock(&pcon.state);
        Ok(state.buffers.pair(kind).map(|pair| pair.info()))
    }
}
