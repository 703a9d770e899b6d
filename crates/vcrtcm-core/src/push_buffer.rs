//! Double-buffered push buffers.
//!
//! Each buffer kind (framebuffer, cursor) owns either nothing or exactly two equally sized slots.
//! The GPU fills the active slot on every push; a successful push hands the filled slot to the
//! consumer and makes the other slot active.

use serde::Serialize;

use crate::error::{Result, VcrtcmError};
use crate::hal::{GpuBufferHandle, GpuFuncs};
use crate::metrics::Metrics;
use crate::types::{BufferKind, PconId, PushSlot};

/// Number of `page_size` pages needed to hold `byte_size` bytes.
pub fn pages_for(byte_size: usize, page_size: usize) -> usize {
    byte_size.div_ceil(page_size)
}

/// One slot of GPU-visible, CPU-mapped pixel memory.
#[derive(Debug)]
pub struct PushBuffer {
    owner: PconId,
    pages: usize,
    handle: GpuBufferHandle,
    data: Vec<u8>,
    virgin: bool,
    needs_xmit: bool,
}

impl PushBuffer {
    pub fn owner(&self) -> PconId {
        self.owner
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn handle(&self) -> GpuBufferHandle {
        self.handle
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// True until the first successful push into this slot.
    pub fn is_virgin(&self) -> bool {
        self.virgin
    }

    pub fn needs_xmit(&self) -> bool {
        self.needs_xmit
    }

    pub(crate) fn mark_filled(&mut self) {
        self.virgin = false;
        self.needs_xmit = true;
    }

    pub(crate) fn mark_transmitted(&mut self) {
        self.needs_xmit = false;
    }

    fn info(&self) -> PushBufferInfo {
        PushBufferInfo {
            pages: self.pages,
            handle: self.handle.get(),
            virgin: self.virgin,
            needs_xmit: self.needs_xmit,
        }
    }
}

/// Inspection view of one push-buffer slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PushBufferInfo {
    pub pages: usize,
    pub handle: u64,
    pub virgin: bool,
    pub needs_xmit: bool,
}

/// Both slots of one buffer kind. Constructed only with two live allocations of equal size.
#[derive(Debug)]
pub(crate) struct PushBufferPair {
    slots: [PushBuffer; 2],
}

impl PushBufferPair {
    pub(crate) fn pages(&self) -> usize {
        self.slots[0].pages
    }

    pub(crate) fn get(&self, slot: PushSlot) -> &PushBuffer {
        &self.slots[slot.index()]
    }

    pub(crate) fn get_mut(&mut self, slot: PushSlot) -> &mut PushBuffer {
        &mut self.slots[slot.index()]
    }

    pub(crate) fn info(&self) -> [PushBufferInfo; 2] {
        [self.slots[0].info(), self.slots[1].info()]
    }

    fn free(self, gpu: &dyn GpuFuncs, metrics: &Metrics) {
        for buf in self.slots {
            free_one(gpu, buf, metrics);
        }
    }
}

fn alloc_one(
    gpu: &dyn GpuFuncs,
    pconid: PconId,
    pages: usize,
    page_size: usize,
    metrics: &Metrics,
) -> Result<PushBuffer> {
    let bytes = pages
        .checked_mul(page_size)
        .ok_or_else(|| VcrtcmError::invalid("push buffer size overflows"))?;
    let handle = gpu.push_buffer_alloc(pconid, pages)?;

    let mut data = Vec::new();
    if data.try_reserve_exact(bytes).is_err() {
        gpu.push_buffer_free(pconid, handle, pages);
        return Err(VcrtcmError::OutOfMemory { bytes });
    }
    data.resize(bytes, 0);
    metrics.push_buffer_allocated();

    Ok(PushBuffer {
        owner: pconid,
        pages,
        handle,
        data,
        virgin: true,
        needs_xmit: false,
    })
}

fn free_one(gpu: &dyn GpuFuncs, buf: PushBuffer, metrics: &Metrics) {
    gpu.push_buffer_free(buf.owner, buf.handle, buf.pages);
    metrics.push_buffer_freed();
}

fn alloc_pair(
    gpu: &dyn GpuFuncs,
    pconid: PconId,
    pages: usize,
    page_size: usize,
    metrics: &Metrics,
) -> Result<PushBufferPair> {
    let first = alloc_one(gpu, pconid, pages, page_size, metrics)?;
    match alloc_one(gpu, pconid, pages, page_size, metrics) {
        Ok(second) => Ok(PushBufferPair {
            slots: [first, second],
        }),
        Err(err) => {
            // Roll back so no half-allocated pair escapes.
            free_one(gpu, first, metrics);
            Err(err)
        }
    }
}

/// Push-buffer state of one pcon. Guarded by the pcon's buffer mutex.
#[derive(Debug, Default)]
pub(crate) struct PushBuffers {
    fb: Option<PushBufferPair>,
    cursor: Option<PushBufferPair>,
    active: PushSlot,
}

impl PushBuffers {
    pub(crate) fn pair(&self, kind: BufferKind) -> Option<&PushBufferPair> {
        match kind {
            BufferKind::Framebuffer => self.fb.as_ref(),
            BufferKind::Cursor => self.cursor.as_ref(),
        }
    }

    fn pair_slot(&mut self, kind: BufferKind) -> &mut Option<PushBufferPair> {
        match kind {
            BufferKind::Framebuffer => &mut self.fb,
            BufferKind::Cursor => &mut self.cursor,
        }
    }

    /// Slot that receives the next push.
    pub(crate) fn active(&self) -> PushSlot {
        self.active
    }

    pub(crate) fn has_fb(&self) -> bool {
        self.fb.is_some()
    }

    /// Resize both slots of `kind` to hold `byte_size` bytes.
    ///
    /// Zero frees both slots; an unchanged page count keeps the existing allocation. Otherwise
    /// the new pair is allocated first and the old one released afterwards, so on failure the
    /// previous pair of `kind` is left exactly as it was.
    pub(crate) fn ensure_size(
        &mut self,
        gpu: &dyn GpuFuncs,
        pconid: PconId,
        kind: BufferKind,
        byte_size: usize,
        page_size: usize,
        metrics: &Metrics,
    ) -> Result<()> {
        let pages = pages_for(byte_size, page_size);
        let slot = self.pair_slot(kind);

        if slot.as_ref().map(PushBufferPair::pages) == Some(pages) {
            return Ok(());
        }
        if pages == 0 {
            if let Some(old) = slot.take() {
                old.free(gpu, metrics);
            }
            tracing::debug!(pconid, ?kind, "push buffers released");
            return Ok(());
        }

        let pair = alloc_pair(gpu, pconid, pages, page_size, metrics)?;
        if let Some(old) = slot.replace(pair) {
            old.free(gpu, metrics);
        }
        tracing::debug!(pconid, ?kind, pages, "push buffers allocated");
        Ok(())
    }

    pub(crate) fn release_all(&mut self, gpu: &dyn GpuFuncs, metrics: &Metrics) {
        if let Some(pair) = self.fb.take() {
            pair.free(gpu, metrics);
        }
        if let Some(pair) = self.cursor.take() {
            pair.free(gpu, metrics);
        }
        self.active = PushSlot::Zero;
    }

    /// Ask the GPU to fill the active slot. On success the filled slot is returned (marked as
    /// needing transmission) and the other slot becomes active; on failure nothing flips.
    pub(crate) fn push(&mut self, gpu: &dyn GpuFuncs, pconid: PconId) -> Result<PushSlot> {
        let slot = self.active;
        let fb = self
            .fb
            .as_mut()
            .ok_or(VcrtcmError::Unsupported("no framebuffer push buffer"))?
            .get_mut(slot);
        let cursor = self.cursor.as_mut().map(|pair| pair.get_mut(slot));

        match cursor {
            Some(cursor) => {
                gpu.push(pconid, &mut *fb, Some(&mut *cursor))?;
                cursor.mark_filled();
            }
            None => gpu.push(pconid, &mut *fb, None)?,
        }
        fb.mark_filled();

        self.active = slot.other();
        Ok(slot)
    }

    pub(crate) fn mark_transmitted(&mut self, slot: PushSlot) {
        if let Some(pair) = self.fb.as_mut() {
            pair.get_mut(slot).mark_transmitted();
        }
        if let Some(pair) = self.cursor.as_mut() {
            pair.get_mut(slot).mark_transmitted();
        }
    }

    pub(crate) fn xmit_pending(&self) -> bool {
        self.fb
            .as_ref()
            .is_some_and(|pair| pair.slots.iter().any(PushBuffer::needs_xmit))
    }
}
