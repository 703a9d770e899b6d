//! Callback boundaries between the manager and its two kinds of collaborators.
//!
//! The GPU side (frame producer) implements [`GpuFuncs`]; the pixel consumer implements
//! [`PconFuncs`]. Each set is split in two: the `*IrqFuncs` supertraits hold the callbacks that
//! run on the vblank/page-flip path and therefore must never block, while the main traits may
//! block (wait for in-flight rendering, allocate, talk to a device).
//!
//! Non-blocking callbacks never run under a lock that the non-blocking entry points take, so they
//! may re-enter `get_fb_status`, `get_vblank_time`, `page_flip` and `emulate_vblank` for any
//! pcon.
//! They must not call blocking [`crate::Vcrtcm`] operations for their own pcon: detach waits for
//! running callbacks to return.

use std::num::NonZeroU64;
use std::sync::Arc;

use crate::cursor::Frame;
use crate::error::Result;
use crate::push_buffer::PushBuffer;
use crate::types::{
    CursorDescriptor, DpmsState, FbDescriptor, FbStatus, Mode, PconId, XferCaps, XferMode,
};

/// Opaque GPU-private handle for one push-buffer allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GpuBufferHandle(NonZeroU64);

impl GpuBufferHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// GPU callbacks that run on the vblank path.
pub trait GpuIrqFuncs: Send + Sync {
    /// An emulated vblank happened on `pconid`. Must not block.
    fn vblank(&self, pconid: PconId);
}

/// Frame producer side of an attachment.
pub trait GpuFuncs: GpuIrqFuncs {
    fn xfer_caps(&self) -> XferCaps {
        XferCaps::PUSH | XferCaps::PULL
    }

    /// The pcon was detached from this GPU (explicitly or by forced teardown).
    fn detach(&self, pconid: PconId);

    /// Wait for in-flight rendering that targets `pconid` to finish. May block.
    fn sync(&self, _pconid: PconId) {}

    /// Allocate `pages` GPU-visible pages for one push-buffer slot.
    fn push_buffer_alloc(&self, pconid: PconId, pages: usize) -> Result<GpuBufferHandle>;

    fn push_buffer_free(&self, pconid: PconId, handle: GpuBufferHandle, pages: usize);

    /// Copy the current rendering into `fb` (and the cursor image into `cursor`, when present).
    fn push(
        &self,
        pconid: PconId,
        fb: &mut PushBuffer,
        cursor: Option<&mut PushBuffer>,
    ) -> Result<()>;

    /// The consumer's connection state changed.
    fn hotplug(&self, pconid: PconId);
}

/// Consumer callbacks that run on the vblank/page-flip path. None of them may block.
pub trait PconIrqFuncs: Send + Sync {
    fn vblank(&self, _pconid: PconId) {}

    fn page_flip(&self, _pconid: PconId, _fb_offset: u64) -> Result<()> {
        Ok(())
    }

    /// Consumer-side status bits; merged with the manager's own bits.
    fn get_fb_status(&self, _pconid: PconId) -> FbStatus {
        FbStatus::empty()
    }
}

/// Pixel consumer side of an attachment.
///
/// Every method has a default so thin consumers only implement what they care about. `wait_fb`
/// and `get_fb_status` are always callable; their defaults return immediately.
pub trait PconFuncs: PconIrqFuncs {
    fn xfer_caps(&self) -> XferCaps {
        XferCaps::PUSH
    }

    fn attach(&self, _pconid: PconId) -> Result<()> {
        Ok(())
    }

    fn detach(&self, _pconid: PconId) -> Result<()> {
        Ok(())
    }

    fn set_fb(&self, _pconid: PconId, _fb: &FbDescriptor) -> Result<()> {
        Ok(())
    }

    /// Framebuffer the consumer is already showing, if any. Queried on attach.
    fn get_fb(&self, _pconid: PconId) -> Option<FbDescriptor> {
        None
    }

    fn dirty_fb(&self, _pconid: PconId) -> Result<()> {
        Ok(())
    }

    /// Block until the consumer is done reading the current framebuffer.
    fn wait_fb(&self, _pconid: PconId) -> Result<()> {
        Ok(())
    }

    fn set_fps(&self, _pconid: PconId, _fps: u32) -> Result<()> {
        Ok(())
    }

    fn get_fps(&self, _pconid: PconId) -> Option<u32> {
        None
    }

    fn set_cursor(&self, _pconid: PconId, _cursor: &CursorDescriptor) -> Result<()> {
        Ok(())
    }

    /// Cursor the consumer is already showing, if any. Queried on attach.
    fn get_cursor(&self, _pconid: PconId) -> Option<CursorDescriptor> {
        None
    }

    fn set_dpms(&self, _pconid: PconId, _state: DpmsState) -> Result<()> {
        Ok(())
    }

    fn get_dpms(&self, _pconid: PconId) -> Option<DpmsState> {
        None
    }

    fn connected(&self, _pconid: PconId) -> bool {
        true
    }

    fn get_modes(&self, _pconid: PconId) -> Vec<Mode> {
        Vec::new()
    }

    fn check_mode(&self, pconid: PconId, mode: &Mode) -> bool {
        let modes = self.get_modes(pconid);
        modes.is_empty() || modes.contains(mode)
    }

    fn disable(&self, _pconid: PconId) -> Result<()> {
        Ok(())
    }

    /// A freshly pushed frame is ready for output.
    fn transmit(&self, _pconid: PconId, _frame: &Frame<'_>) -> Result<()> {
        Ok(())
    }
}

/// Emulated-vblank bookkeeping of one pcon.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VblankTiming {
    pub last_ns: u64,
    pub next_ns: u64,
    /// `next_ns` is scheduled; `next_ns >= last_ns` whenever this is set.
    pub valid: bool,
}

impl VblankTiming {
    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }
}

/// Per-attachment state. Exists only while the pcon is attached.
pub(crate) struct HalDescriptor {
    pub(crate) pconid: PconId,
    pub(crate) gpu: Arc<dyn GpuFuncs>,
    pub(crate) xfer_mode: XferMode,
    pub(crate) dpms: DpmsState,
}

impl HalDescriptor {
    pub(crate) fn new(pconid: PconId, gpu: Arc<dyn GpuFuncs>, xfer_mode: XferMode) -> Self {
        Self {
            pconid,
            gpu,
            xfer_mode,
            dpms: DpmsState::On,
        }
    }

    pub(crate) fn is_gpu(&self, gpu: &Arc<dyn GpuFuncs>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.gpu), Arc::as_ptr(gpu))
    }
}
