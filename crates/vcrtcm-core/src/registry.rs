//! Fixed-size pcon table.
//!
//! The table lock only covers shape changes (reserve, install, remove) and the O(1) lookup.
//! Per-pcon content lives behind several locks on [`Pcon`]:
//!
//! - the buffer mutex (`state`), which may be held across blocking collaborator calls;
//! - the vblank schedule, a short lock taken after `state` when both are needed;
//! - the callback gate, which hands the non-blocking path its callback targets without holding
//!   any lock while they run, and lets detach wait for callbacks still in flight.
//!
//! Status bits and vblank stamps are plain atomics.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use serde::Serialize;

use crate::error::{Result, VcrtcmError};
use crate::hal::{GpuFuncs, HalDescriptor, PconFuncs, VblankTiming};
use crate::push_buffer::PushBuffers;
use crate::types::{CursorDescriptor, DpmsState, FbDescriptor, FbStatus, PconId, PimId};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Attach/detach state machine of one pcon.
pub(crate) enum AttachState {
    Detached,
    Attaching,
    Attached(HalDescriptor),
    Detaching,
}

impl AttachState {
    pub(crate) fn phase(&self) -> AttachPhase {
        match self {
            Self::Detached => AttachPhase::Detached,
            Self::Attaching => AttachPhase::Attaching,
            Self::Attached(_) => AttachPhase::Attached,
            Self::Detaching => AttachPhase::Detaching,
        }
    }

    pub(crate) fn hal(&self) -> Option<&HalDescriptor> {
        match self {
            Self::Attached(hal) => Some(hal),
            _ => None,
        }
    }

    pub(crate) fn hal_mut(&mut self) -> Option<&mut HalDescriptor> {
        match self {
            Self::Attached(hal) => Some(hal),
            _ => None,
        }
    }

    fn in_transition(&self) -> bool {
        matches!(self, Self::Attaching | Self::Detaching)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPhase {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

/// Everything the buffer mutex protects.
pub(crate) struct PconState {
    pub(crate) consumer: Arc<dyn PconFuncs>,
    pub(crate) attach: AttachState,
    pub(crate) fps: u32,
    pub(crate) dpms: DpmsState,
    pub(crate) fb: Option<FbDescriptor>,
    pub(crate) cursor: Option<CursorDescriptor>,
    pub(crate) buffers: PushBuffers,
    pub(crate) last_xmit_ns: u64,
    pub(crate) fb_xmit_allowed: bool,
    pub(crate) fb_force_xmit: bool,
    pub(crate) frame_seq: u64,
    /// Set once `destroy` claims the pcon. No new attachment may start afterwards, and an attach
    /// already in flight rolls itself back.
    pub(crate) retired: bool,
}

impl PconState {
    fn new(consumer: Arc<dyn PconFuncs>) -> Self {
        Self {
            consumer,
            attach: AttachState::Detached,
            fps: 0,
            dpms: DpmsState::On,
            fb: None,
            cursor: None,
            buffers: PushBuffers::default(),
            last_xmit_ns: 0,
            fb_xmit_allowed: false,
            fb_force_xmit: false,
            frame_seq: 0,
            retired: false,
        }
    }
}

/// Callback targets used by the non-blocking vblank path. Present only while attached.
#[derive(Clone)]
pub(crate) struct VblankLinks {
    pub(crate) gpu: Arc<dyn GpuFuncs>,
    pub(crate) consumer: Arc<dyn PconFuncs>,
}

#[derive(Default)]
struct GateState {
    links: Option<VblankLinks>,
    in_flight: usize,
}

/// Hands out [`VblankLinks`] to the non-blocking path and counts the callbacks still running.
///
/// The gate lock is only held to copy the links and adjust the count, never across a callback,
/// so callbacks may re-enter `get_fb_status`, `get_vblank_time` or `emulate_vblank`.
#[derive(Default)]
pub(crate) struct CallbackGate {
    inner: Mutex<GateState>,
    idle: Condvar,
}

impl CallbackGate {
    pub(crate) fn open(&self, links: VblankLinks) {
        lock(&self.inner).links = Some(links);
    }

    /// Stop handing out links, then wait for every callback already running to return.
    ///
    /// Must not be called from inside a callback of the same pcon.
    pub(crate) fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.links = None;
        while inner.in_flight > 0 {
            inner = self.idle.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `None` while detached.
    pub(crate) fn enter(&self) -> Option<InFlight<'_>> {
        let mut inner = lock(&self.inner);
        let links = inner.links.clone()?;
        inner.in_flight += 1;
        Some(InFlight { gate: self, links })
    }
}

/// Links borrowed from a [`CallbackGate`]; `close` waits until every one is dropped.
pub(crate) struct InFlight<'a> {
    gate: &'a CallbackGate,
    links: VblankLinks,
}

impl Deref for InFlight<'_> {
    type Target = VblankLinks;

    fn deref(&self) -> &VblankLinks {
        &self.links
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.gate.inner);
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// Vblank schedule of one pcon.
///
/// Lives outside the buffer mutex so `tick` can keep delivering vblanks while a blocking
/// operation holds that mutex.
#[derive(Debug, Default)]
pub(crate) struct VblankSchedule {
    /// Vblank period while attached with a non-zero frame rate.
    pub(crate) period_ns: Option<u64>,
    pub(crate) timing: VblankTiming,
}

impl VblankSchedule {
    /// Restart the schedule; the next tick delivers a vblank right away.
    pub(crate) fn arm(&mut self, period_ns: Option<u64>) {
        self.period_ns = period_ns;
        self.timing.invalidate();
    }

    pub(crate) fn disarm(&mut self) {
        self.arm(None);
    }

    pub(crate) fn next_ns(&self) -> Option<u64> {
        (self.period_ns.is_some() && self.timing.valid).then_some(self.timing.next_ns)
    }
}

/// Lock-free status block read by `get_fb_status` / `get_vblank_time`.
#[derive(Debug, Default)]
pub(crate) struct PconStatus {
    vblank_count: AtomicU64,
    last_vblank_ns: AtomicU64,
    flags: AtomicU32,
    flip_offset: AtomicU64,
}

impl PconStatus {
    pub(crate) fn record_vblank(&self, now_ns: u64) -> u64 {
        self.last_vblank_ns.store(now_ns, Ordering::Release);
        self.vblank_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn vblank(&self) -> (u64, u64) {
        (
            self.vblank_count.load(Ordering::Acquire),
            self.last_vblank_ns.load(Ordering::Acquire),
        )
    }

    pub(crate) fn set(&self, bits: FbStatus) {
        self.flags.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, bits: FbStatus) {
        self.flags.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn flags(&self) -> FbStatus {
        FbStatus::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn publish_flip(&self, fb_offset: u64) {
        self.flip_offset.store(fb_offset, Ordering::Release);
        self.set(FbStatus::FLIP_PENDING);
    }

    pub(crate) fn flip_offset(&self) -> u64 {
        self.flip_offset.load(Ordering::Acquire)
    }
}

/// One live pcon.
pub(crate) struct Pcon {
    pub(crate) id: PconId,
    pub(crate) pim: String,
    pub(crate) pim_id: PimId,
    pub(crate) description: String,
    pub(crate) minor: Option<u32>,
    pub(crate) status: PconStatus,
    pub(crate) gate: CallbackGate,
    pub(crate) schedule: Mutex<VblankSchedule>,
    pub(crate) state: Mutex<PconState>,
    /// Signalled whenever `state.attach` leaves `Attaching` or `Detaching`.
    settled: Condvar,
}

impl Pcon {
    pub(crate) fn new(
        id: PconId,
        pim: String,
        pim_id: PimId,
        description: String,
        minor: Option<u32>,
        consumer: Arc<dyn PconFuncs>,
    ) -> Self {
        Self {
            id,
            pim,
            pim_id,
            description,
            minor,
            status: PconStatus::default(),
            gate: CallbackGate::default(),
            schedule: Mutex::new(VblankSchedule::default()),
            state: Mutex::new(PconState::new(consumer)),
            settled: Condvar::new(),
        }
    }

    /// Leave a transitional attach state and wake teardown paths waiting for that.
    pub(crate) fn settle(&self, state: &mut PconState, attach: AttachState) {
        state.attach = attach;
        self.settled.notify_all();
    }

    /// Block until no attach or detach is in flight on this pcon.
    pub(crate) fn wait_settled<'a>(
        &self,
        mut state: MutexGuard<'a, PconState>,
    ) -> MutexGuard<'a, PconState> {
        while state.attach.in_transition() {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }
}

enum Slot {
    Free,
    /// Id handed out, pcon not installed yet.
    Reserved,
    Live(Arc<Pcon>),
}

/// Table mapping pcon ids to descriptors, plus the minor-number pool.
pub struct PconRegistry {
    slots: RwLock<Vec<Slot>>,
    minors: Mutex<Vec<bool>>,
}

impl PconRegistry {
    pub fn new(capacity: usize, max_minors: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Free);
        Self {
            slots: RwLock::new(slots),
            minors: Mutex::new(vec![false; max_minors as usize]),
        }
    }

    pub fn capacity(&self) -> usize {
        read(&self.slots).len()
    }

    /// Reserve the lowest free id.
    pub fn alloc_pcon(&self) -> Result<PconId> {
        let mut slots = write(&self.slots);
        let capacity = slots.len();
        let idx = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .ok_or(VcrtcmError::TableFull { capacity })?;
        slots[idx] = Slot::Reserved;
        // `capacity` is bounded by the config validation, so the index fits.
        PconId::try_from(idx).map_err(|_| VcrtcmError::TableFull { capacity })
    }

    /// Publish a descriptor under an id previously returned by [`Self::alloc_pcon`].
    pub(crate) fn install(&self, pcon: Arc<Pcon>) -> Result<()> {
        let id = pcon.id;
        let mut slots = write(&self.slots);
        match slots.get_mut(id as usize) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Live(pcon);
                Ok(())
            }
            _ => Err(VcrtcmError::Fatal(format!(
                "install of pcon {id} into a slot that was not reserved"
            ))),
        }
    }

    /// Look up a live pcon. Out-of-range, reserved and free ids yield `None`.
    pub(crate) fn get_pcon(&self, id: PconId) -> Option<Arc<Pcon>> {
        match read(&self.slots).get(id as usize) {
            Some(Slot::Live(pcon)) => Some(Arc::clone(pcon)),
            _ => None,
        }
    }

    pub(crate) fn lookup(&self, id: PconId) -> Result<Arc<Pcon>> {
        let pcon = self.get_pcon(id).ok_or(VcrtcmError::PconNotFound(id))?;
        if pcon.id != id {
            return Err(VcrtcmError::Fatal(format!(
                "slot {id} holds pcon {}",
                pcon.id
            )));
        }
        Ok(pcon)
    }

    /// Release an id. The caller guarantees no collaborator still uses the pcon.
    pub(crate) fn dealloc_pcon(&self, id: PconId) -> Option<Arc<Pcon>> {
        let mut slots = write(&self.slots);
        let slot = slots.get_mut(id as usize)?;
        match std::mem::replace(slot, Slot::Free) {
            Slot::Live(pcon) => Some(pcon),
            Slot::Reserved | Slot::Free => None,
        }
    }

    pub fn pconid_valid(&self, id: PconId) -> bool {
        matches!(read(&self.slots).get(id as usize), Some(Slot::Live(_)))
    }

    pub(crate) fn live(&self) -> Vec<Arc<Pcon>> {
        read(&self.slots)
            .iter()
            .filter_map(|slot| match slot {
                Slot::Live(pcon) => Some(Arc::clone(pcon)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn alloc_minor(&self) -> Option<u32> {
        let mut minors = lock(&self.minors);
        let idx = minors.iter().position(|used| !used)?;
        minors[idx] = true;
        u32::try_from(idx).ok()
    }

    pub(crate) fn free_minor(&self, minor: u32) {
        if let Some(used) = lock(&self.minors).get_mut(minor as usize) {
            *used = false;
        }
    }
}
