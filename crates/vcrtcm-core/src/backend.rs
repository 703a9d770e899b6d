//! In-process collaborators: a software frame producer and a memory-backed pixel consumer.
//!
//! These are what the CLI wires up and what the tests drive. They implement the same traits a
//! real GPU driver or output device would, so nothing in the manager special-cases them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cursor::Frame;
use crate::error::{Result, VcrtcmError};
use crate::hal::{GpuBufferHandle, GpuFuncs, GpuIrqFuncs, PconFuncs, PconIrqFuncs};
use crate::pim::{PconInstance, PimFuncs};
use crate::push_buffer::PushBuffer;
use crate::registry::lock;
use crate::types::{
    CursorDescriptor, DpmsState, FbDescriptor, FbStatus, Mode, PconId, XferCaps,
};

const SOFTWARE_PAGE_SIZE: usize = 4096;

/// Handle allocator shared by both GPU backends.
#[derive(Debug)]
struct Handles {
    next: AtomicU64,
    live: Mutex<HashMap<u64, (PconId, usize)>>,
}

impl Default for Handles {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }
}

impl Handles {
    fn alloc(&self, pconid: PconId, pages: usize) -> Result<GpuBufferHandle> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        let handle = GpuBufferHandle::new(raw)
            .ok_or_else(|| VcrtcmError::Fatal("push buffer handle space exhausted".into()))?;
        lock(&self.live).insert(raw, (pconid, pages));
        Ok(handle)
    }

    fn free(&self, pconid: PconId, handle: GpuBufferHandle, pages: usize) {
        match lock(&self.live).remove(&handle.get()) {
            Some(entry) if entry == (pconid, pages) => {}
            Some((owner, size)) => tracing::warn!(
                pconid,
                owner,
                pages,
                size,
                "push buffer freed with mismatched owner or size"
            ),
            None => tracing::warn!(pconid, handle = handle.get(), "double free of push buffer"),
        }
    }

    fn live(&self) -> usize {
        lock(&self.live).len()
    }
}

/// What the software GPU "rendered" most recently.
#[derive(Debug, Default)]
struct RenderTarget {
    fb: Vec<u8>,
    cursor: Vec<u8>,
}

/// Frame producer that renders from an in-memory image.
///
/// `push` copies the current render target into the push buffers. Fault injection knobs let
/// tests exercise the allocation-rollback and push-failure paths.
#[derive(Debug, Default)]
pub struct SoftwareGpu {
    handles: Handles,
    target: Mutex<RenderTarget>,
    push_fails: AtomicBool,
    /// Successful allocations left before the injected failure; only read while armed.
    alloc_budget: AtomicU64,
    alloc_armed: AtomicBool,
    caps: Option<XferCaps>,
    vblanks: AtomicU64,
    pushes: AtomicU64,
    syncs: AtomicU64,
    detaches: AtomicU64,
    hotplugs: AtomicU64,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise only `caps` during transfer-mode negotiation.
    pub fn with_caps(caps: XferCaps) -> Self {
        Self {
            caps: Some(caps),
            ..Self::default()
        }
    }

    /// Replace the rendered framebuffer image.
    pub fn render(&self, pixels: &[u8]) {
        let mut target = lock(&self.target);
        target.fb.clear();
        target.fb.extend_from_slice(pixels);
    }

    /// Replace the rendered cursor image.
    pub fn render_cursor(&self, pixels: &[u8]) {
        let mut target = lock(&self.target);
        target.cursor.clear();
        target.cursor.extend_from_slice(pixels);
    }

    pub fn set_push_fails(&self, fails: bool) {
        self.push_fails.store(fails, Ordering::Relaxed);
    }

    /// Let `n` more allocations succeed, then fail exactly one.
    pub fn fail_alloc_after(&self, n: u64) {
        self.alloc_budget.store(n, Ordering::Relaxed);
        self.alloc_armed.store(true, Ordering::Release);
    }

    pub fn live_allocations(&self) -> usize {
        self.handles.live()
    }

    pub fn vblanks(&self) -> u64 {
        self.vblanks.load(Ordering::Relaxed)
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn detaches(&self) -> u64 {
        self.detaches.load(Ordering::Relaxed)
    }

    pub fn hotplugs(&self) -> u64 {
        self.hotplugs.load(Ordering::Relaxed)
    }

    fn take_injected_alloc_failure(&self) -> bool {
        if !self.alloc_armed.load(Ordering::Acquire) {
            return false;
        }
        let remaining = self.alloc_budget.load(Ordering::Relaxed);
        if remaining == 0 {
            self.alloc_armed.store(false, Ordering::Release);
            return true;
        }
        self.alloc_budget.store(remaining - 1, Ordering::Relaxed);
        false
    }
}

impl GpuIrqFuncs for SoftwareGpu {
    fn vblank(&self, _pconid: PconId) {
        self.vblanks.fetch_add(1, Ordering::Relaxed);
    }
}

impl GpuFuncs for SoftwareGpu {
    fn xfer_caps(&self) -> XferCaps {
        self.caps.unwrap_or(XferCaps::PUSH | XferCaps::PULL)
    }

    fn detach(&self, pconid: PconId) {
        tracing::debug!(pconid, "software gpu detached");
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    fn sync(&self, _pconid: PconId) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn push_buffer_alloc(&self, pconid: PconId, pages: usize) -> Result<GpuBufferHandle> {
        if self.take_injected_alloc_failure() {
            return Err(VcrtcmError::OutOfMemory {
                bytes: pages.saturating_mul(SOFTWARE_PAGE_SIZE),
            });
        }
        self.handles.alloc(pconid, pages)
    }

    fn push_buffer_free(&self, pconid: PconId, handle: GpuBufferHandle, pages: usize) {
        self.handles.free(pconid, handle, pages);
    }

    fn push(
        &self,
        _pconid: PconId,
        fb: &mut PushBuffer,
        cursor: Option<&mut PushBuffer>,
    ) -> Result<()> {
        if self.push_fails.load(Ordering::Relaxed) {
            return Err(VcrtcmError::Backend("injected push failure".into()));
        }
        let target = lock(&self.target);
        copy_prefix(fb.as_mut_bytes(), &target.fb);
        if let Some(cursor) = cursor {
            copy_prefix(cursor.as_mut_bytes(), &target.cursor);
        }
        self.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn hotplug(&self, pconid: PconId) {
        tracing::debug!(pconid, "software gpu saw hotplug");
        self.hotplugs.fetch_add(1, Ordering::Relaxed);
    }
}

fn copy_prefix(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/// Producer that accepts allocations but never delivers a frame.
#[derive(Debug, Default)]
pub struct NullGpu {
    handles: Handles,
}

impl NullGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_allocations(&self) -> usize {
        self.handles.live()
    }
}

impl GpuIrqFuncs for NullGpu {
    fn vblank(&self, _pconid: PconId) {}
}

impl GpuFuncs for NullGpu {
    fn detach(&self, _pconid: PconId) {}

    fn push_buffer_alloc(&self, pconid: PconId, pages: usize) -> Result<GpuBufferHandle> {
        self.handles.alloc(pconid, pages)
    }

    fn push_buffer_free(&self, pconid: PconId, handle: GpuBufferHandle, pages: usize) {
        self.handles.free(pconid, handle, pages);
    }

    fn push(
        &self,
        _pconid: PconId,
        _fb: &mut PushBuffer,
        _cursor: Option<&mut PushBuffer>,
    ) -> Result<()> {
        Err(VcrtcmError::Unsupported("null gpu does not render"))
    }

    fn hotplug(&self, _pconid: PconId) {}
}

#[derive(Debug, Default)]
struct Screen {
    fb: Option<FbDescriptor>,
    cursor: Option<CursorDescriptor>,
    fps: u32,
    dpms: DpmsState,
    modes: Vec<Mode>,
    pixels: Vec<u8>,
    last_seq: u64,
}

/// Pixel consumer that composites every transmitted frame into memory.
#[derive(Debug)]
pub struct MemoryPcon {
    caps: XferCaps,
    connected: AtomicBool,
    transmit_fails: AtomicBool,
    consumer_status: AtomicU32,
    vblanks: AtomicU64,
    page_flips: AtomicU64,
    last_flip: AtomicU64,
    frames: AtomicU64,
    attaches: AtomicU64,
    detaches: AtomicU64,
    screen: Mutex<Screen>,
}

impl Default for MemoryPcon {
    fn default() -> Self {
        Self::with_caps(XferCaps::PUSH)
    }
}

impl MemoryPcon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_caps(caps: XferCaps) -> Self {
        Self {
            caps,
            connected: AtomicBool::new(true),
            transmit_fails: AtomicBool::new(false),
            consumer_status: AtomicU32::new(0),
            vblanks: AtomicU64::new(0),
            page_flips: AtomicU64::new(0),
            last_flip: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            attaches: AtomicU64::new(0),
            detaches: AtomicU64::new(0),
            screen: Mutex::new(Screen::default()),
        }
    }

    /// Pretend the device was already showing `fb` before anyone attached.
    pub fn preset_fb(&self, fb: FbDescriptor) {
        lock(&self.screen).fb = Some(fb);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_modes(&self, modes: Vec<Mode>) {
        lock(&self.screen).modes = modes;
    }

    pub fn set_transmit_fails(&self, fails: bool) {
        self.transmit_fails.store(fails, Ordering::Relaxed);
    }

    /// Report the device as still scanning out the previous frame.
    pub fn set_busy(&self, busy: bool) {
        let bits = FbStatus::CONSUMER_BUSY.bits();
        if busy {
            self.consumer_status.fetch_or(bits, Ordering::Relaxed);
        } else {
            self.consumer_status.fetch_and(!bits, Ordering::Relaxed);
        }
    }

    pub fn vblanks(&self) -> u64 {
        self.vblanks.load(Ordering::Relaxed)
    }

    pub fn page_flips(&self) -> u64 {
        self.page_flips.load(Ordering::Relaxed)
    }

    pub fn last_flip_offset(&self) -> u64 {
        self.last_flip.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn attaches(&self) -> u64 {
        self.attaches.load(Ordering::Relaxed)
    }

    pub fn detaches(&self) -> u64 {
        self.detaches.load(Ordering::Relaxed)
    }

    /// Copy of the most recently composited frame.
    pub fn screen(&self) -> Vec<u8> {
        lock(&self.screen).pixels.clone()
    }

    /// Sequence number of the most recently received frame.
    pub fn last_seq(&self) -> u64 {
        lock(&self.screen).last_seq
    }

    pub fn fps(&self) -> u32 {
        lock(&self.screen).fps
    }

    pub fn dpms(&self) -> DpmsState {
        lock(&self.screen).dpms
    }
}

impl PconIrqFuncs for MemoryPcon {
    fn vblank(&self, _pconid: PconId) {
        self.vblanks.fetch_add(1, Ordering::Relaxed);
    }

    fn page_flip(&self, _pconid: PconId, fb_offset: u64) -> Result<()> {
        self.last_flip.store(fb_offset, Ordering::Relaxed);
        self.page_flips.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_fb_status(&self, _pconid: PconId) -> FbStatus {
        FbStatus::from_bits_truncate(self.consumer_status.load(Ordering::Relaxed))
    }
}

impl PconFuncs for MemoryPcon {
    fn xfer_caps(&self) -> XferCaps {
        self.caps
    }

    fn attach(&self, _pconid: PconId) -> Result<()> {
        self.attaches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn detach(&self, _pconid: PconId) -> Result<()> {
        self.detaches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_fb(&self, _pconid: PconId, fb: &FbDescriptor) -> Result<()> {
        lock(&self.screen).fb = Some(*fb);
        Ok(())
    }

    fn get_fb(&self, _pconid: PconId) -> Option<FbDescriptor> {
        lock(&self.screen).fb
    }

    fn set_fps(&self, _pconid: PconId, fps: u32) -> Result<()> {
        lock(&self.screen).fps = fps;
        Ok(())
    }

    fn get_fps(&self, _pconid: PconId) -> Option<u32> {
        Some(lock(&self.screen).fps)
    }

    fn set_cursor(&self, _pconid: PconId, cursor: &CursorDescriptor) -> Result<()> {
        lock(&self.screen).cursor = Some(*cursor);
        Ok(())
    }

    fn get_cursor(&self, _pconid: PconId) -> Option<CursorDescriptor> {
        lock(&self.screen).cursor
    }

    fn set_dpms(&self, _pconid: PconId, state: DpmsState) -> Result<()> {
        lock(&self.screen).dpms = state;
        Ok(())
    }

    fn get_dpms(&self, _pconid: PconId) -> Option<DpmsState> {
        Some(lock(&self.screen).dpms)
    }

    fn connected(&self, _pconid: PconId) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn get_modes(&self, _pconid: PconId) -> Vec<Mode> {
        lock(&self.screen).modes.clone()
    }

    fn transmit(&self, pconid: PconId, frame: &Frame<'_>) -> Result<()> {
        if self.transmit_fails.load(Ordering::Relaxed) {
            return Err(VcrtcmError::Backend(format!(
                "pcon {pconid}: injected transmit failure"
            )));
        }
        let mut screen = lock(&self.screen);
        frame.composite(&mut screen.pixels)?;
        screen.last_seq = frame.seq;
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// `instantiate` hint bit: the new pcon wants a device-node minor number.
pub const HINT_WANTS_MINOR: u32 = 1 << 0;
/// `instantiate` hint bit: the new pcon can only read frames out of GPU memory.
pub const HINT_PULL_ONLY: u32 = 1 << 1;

const KNOWN_HINTS: u32 = HINT_WANTS_MINOR | HINT_PULL_ONLY;

/// PIM that creates [`MemoryPcon`]s.
#[derive(Debug, Default)]
pub struct MemoryPim {
    pcons: Mutex<HashMap<PconId, Arc<MemoryPcon>>>,
    destroyed: Mutex<Vec<PconId>>,
}

impl MemoryPim {
    pub fn new() -> Self {
        Self::default()
    }

    /// The consumer created for `pconid`, while it exists.
    pub fn pcon(&self, pconid: PconId) -> Option<Arc<MemoryPcon>> {
        lock(&self.pcons).get(&pconid).cloned()
    }

    /// Every pcon destroyed so far, in destruction order.
    pub fn destroyed(&self) -> Vec<PconId> {
        lock(&self.destroyed).clone()
    }

    pub fn live(&self) -> usize {
        lock(&self.pcons).len()
    }
}

impl PimFuncs for MemoryPim {
    fn instantiate(&self, pconid: PconId, hints: u32) -> Result<PconInstance> {
        self.test(hints)?;
        let caps = if hints & HINT_PULL_ONLY != 0 {
            XferCaps::PULL
        } else {
            XferCaps::PUSH
        };
        let pcon = Arc::new(MemoryPcon::with_caps(caps));
        lock(&self.pcons).insert(pconid, Arc::clone(&pcon));
        Ok(PconInstance {
            funcs: pcon,
            description: format!("memory pcon {pconid}"),
            wants_minor: hints & HINT_WANTS_MINOR != 0,
        })
    }

    fn destroy(&self, pconid: PconId) {
        if lock(&self.pcons).remove(&pconid).is_none() {
            tracing::warn!(pconid, "memory pim asked to destroy unknown pcon");
        }
        lock(&self.destroyed).push(pconid);
    }

    fn test(&self, hints: u32) -> Result<()> {
        if hints & !KNOWN_HINTS != 0 {
            return Err(VcrtcmError::invalid(format!(
                "unknown hint bits {:#x}",
                hints & !KNOWN_HINTS
            )));
        }
        Ok(())
    }
}
