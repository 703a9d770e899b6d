use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use vcrtcm_core::backend::{MemoryPim, SoftwareGpu};
use vcrtcm_core::{
    ErrorKind, FbDescriptor, FbStatus, Frame, GpuBufferHandle, GpuFuncs, GpuIrqFuncs, PconFuncs,
    PconId, PconInstance, PconIrqFuncs, PimFuncs, PushBuffer, Vcrtcm, VcrtcmConfig,
};

const MS: u64 = 1_000_000;

/// Run `f` on its own thread and fail the test if it does not return in time.
fn within<T: Send + 'static>(what: &str, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .unwrap_or_else(|_| panic!("{what} did not return"))
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// One-shot rendezvous: the first armed callback reports in and waits for the test.
struct Park {
    armed: AtomicBool,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Park {
    fn armed() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let park = Self {
            armed: AtomicBool::new(true),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (park, entered_rx, release_tx)
    }

    fn hold(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Parks {
    Attach,
    SetFb,
}

/// Consumer that parks inside one of its blocking callbacks.
struct GatedPcon {
    park: Park,
    parks: Parks,
    vblanks: AtomicU64,
    frames: AtomicU64,
    detaches: AtomicU64,
}

impl GatedPcon {
    fn new(parks: Parks) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (park, entered, release) = Park::armed();
        let pcon = Arc::new(Self {
            park,
            parks,
            vblanks: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            detaches: AtomicU64::new(0),
        });
        (pcon, entered, release)
    }
}

impl PconIrqFuncs for GatedPcon {
    fn vblank(&self, _pconid: PconId) {
        self.vblanks.fetch_add(1, Ordering::SeqCst);
    }
}

impl PconFuncs for GatedPcon {
    fn attach(&self, _pconid: PconId) -> vcrtcm_core::Result<()> {
        if self.parks == Parks::Attach {
            self.park.hold();
        }
        Ok(())
    }

    fn detach(&self, _pconid: PconId) -> vcrtcm_core::Result<()> {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_fb(&self, _pconid: PconId, _fb: &FbDescriptor) -> vcrtcm_core::Result<()> {
        if self.parks == Parks::SetFb {
            self.park.hold();
        }
        Ok(())
    }

    fn transmit(&self, _pconid: PconId, _frame: &Frame<'_>) -> vcrtcm_core::Result<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct GatedPim {
    pcon: Arc<GatedPcon>,
    destroyed: Mutex<Vec<PconId>>,
}

impl GatedPim {
    fn new(pcon: Arc<GatedPcon>) -> Arc<Self> {
        Arc::new(Self {
            pcon,
            destroyed: Mutex::new(Vec::new()),
        })
    }
}

impl PimFuncs for GatedPim {
    fn instantiate(&self, _pconid: PconId, _hints: u32) -> vcrtcm_core::Result<PconInstance> {
        Ok(PconInstance {
            funcs: self.pcon.clone(),
            description: "gated".into(),
            wants_minor: false,
        })
    }

    fn destroy(&self, pconid: PconId) {
        self.destroyed.lock().unwrap().push(pconid);
    }
}

type Hook = Box<dyn Fn(PconId) + Send + Sync>;

/// Software GPU that runs a test hook from `vblank` or `sync`.
#[derive(Default)]
struct HookedGpu {
    inner: SoftwareGpu,
    on_vblank: Option<Hook>,
    on_sync: Option<Hook>,
}

impl GpuIrqFuncs for HookedGpu {
    fn vblank(&self, pconid: PconId) {
        self.inner.vblank(pconid);
        if let Some(hook) = &self.on_vblank {
            hook(pconid);
        }
    }
}

impl GpuFuncs for HookedGpu {
    fn detach(&self, pconid: PconId) {
        GpuFuncs::detach(&self.inner, pconid);
    }

    fn sync(&self, pconid: PconId) {
        self.inner.sync(pconid);
        if let Some(hook) = &self.on_sync {
            hook(pconid);
        }
    }

    fn push_buffer_alloc(&self, pconid: PconId, pages: usize) -> vcrtcm_core::Result<GpuBufferHandle> {
        self.inner.push_buffer_alloc(pconid, pages)
    }

    fn push_buffer_free(&self, pconid: PconId, handle: GpuBufferHandle, pages: usize) {
        self.inner.push_buffer_free(pconid, handle, pages);
    }

    fn push(
        &self,
        pconid: PconId,
        fb: &mut PushBuffer,
        cursor: Option<&mut PushBuffer>,
    ) -> vcrtcm_core::Result<()> {
        self.inner.push(pconid, fb, cursor)
    }

    fn hotplug(&self, pconid: PconId) {
        self.inner.hotplug(pconid);
    }
}

#[test]
fn attach_while_attaching_is_busy() {
    let (pcon, entered, release) = GatedPcon::new(Parks::Attach);
    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    vcrtcm.register_pim("gated", GatedPim::new(pcon)).unwrap();
    let pconid = vcrtcm.instantiate("gated", 0).unwrap();
    let gpu = Arc::new(SoftwareGpu::new());

    let first = {
        let vcrtcm = vcrtcm.clone();
        let gpu = gpu.clone();
        thread::spawn(move || vcrtcm.attach(pconid, gpu))
    };
    entered.recv().unwrap();

    // The first attach is parked inside the consumer callback.
    let err = vcrtcm.attach(pconid, gpu.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = vcrtcm.detach(pconid).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    release.send(()).unwrap();
    first.join().unwrap().unwrap();
    assert!(vcrtcm.pcon_info(pconid).unwrap().attached);

    // Already attached: still Busy, never a second binding.
    let err = vcrtcm.attach(pconid, gpu).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(vcrtcm.metrics().snapshot().attaches_total, 1);
}

#[test]
fn racing_attaches_bind_exactly_once() {
    const THREADS: usize = 8;

    for _ in 0..20 {
        let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
        vcrtcm
            .register_pim("mem", Arc::new(MemoryPim::new()))
            .unwrap();
        let pconid = vcrtcm.instantiate("mem", 0).unwrap();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let vcrtcm = vcrtcm.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let gpu = Arc::new(SoftwareGpu::new());
                    barrier.wait();
                    vcrtcm.attach(pconid, gpu).map_err(|e| e.kind())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "{results:?}");
        assert!(results
            .iter()
            .all(|r| r.is_ok() || *r == Err(ErrorKind::Busy)));
    }
}

#[test]
fn concurrent_ticks_and_detach_leave_no_buffers_behind() {
    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    let pim = Arc::new(MemoryPim::new());
    vcrtcm.register_pim("mem", pim.clone()).unwrap();
    let pconid = vcrtcm.instantiate("mem", 0).unwrap();
    let gpu = Arc::new(SoftwareGpu::new());
    vcrtcm.attach(pconid, gpu.clone()).unwrap();
    vcrtcm
        .set_fb(pconid, &FbDescriptor::packed(64, 64, 32))
        .unwrap();
    vcrtcm.set_fps(pconid, 240).unwrap();

    let ticker = {
        let vcrtcm = vcrtcm.clone();
        thread::spawn(move || {
            for step in 0..2_000u64 {
                vcrtcm.tick(step * MS);
                let _ = vcrtcm.emulate_vblank(pconid, step * MS);
            }
        })
    };
    thread::yield_now();
    vcrtcm.detach(pconid).unwrap();
    ticker.join().unwrap();

    assert_eq!(gpu.live_allocations(), 0);
    let consumer = pim.pcon(pconid).unwrap();
    let delivered = consumer.vblanks();
    // Nothing reaches the consumer once it is detached.
    vcrtcm.tick(u64::MAX / 2);
    assert_eq!(consumer.vblanks(), delivered);
}

#[test]
fn vblank_callbacks_may_reenter_the_manager() {
    let manager: Arc<OnceLock<Weak<Vcrtcm>>> = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(Vec::<FbStatus>::new()));
    let gpu = Arc::new(HookedGpu {
        on_vblank: Some(Box::new({
            let manager = manager.clone();
            let seen = seen.clone();
            move |pconid| {
                let Some(vcrtcm) = manager.get().and_then(Weak::upgrade) else {
                    return;
                };
                seen.lock().unwrap().push(vcrtcm.get_fb_status(pconid).unwrap());
                vcrtcm.get_vblank_time(pconid).unwrap();
                vcrtcm.page_flip(pconid, 0x1000).unwrap();
            }
        })),
        ..HookedGpu::default()
    });

    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    manager.set(Arc::downgrade(&vcrtcm)).unwrap();
    let pim = Arc::new(MemoryPim::new());
    vcrtcm.register_pim("mem", pim.clone()).unwrap();
    let pconid = vcrtcm.instantiate("mem", 0).unwrap();
    vcrtcm.attach(pconid, gpu.clone()).unwrap();
    vcrtcm
        .set_fb(pconid, &FbDescriptor::packed(8, 8, 32))
        .unwrap();
    vcrtcm.set_fps(pconid, 60).unwrap();

    let next = within("tick with re-entrant callbacks", {
        let vcrtcm = vcrtcm.clone();
        move || vcrtcm.tick(0)
    });
    assert_eq!(next, Some(16_666_667));
    within("emulate_vblank with re-entrant callbacks", {
        let vcrtcm = vcrtcm.clone();
        move || vcrtcm.emulate_vblank(pconid, 5 * MS).unwrap()
    });

    assert_eq!(seen.lock().unwrap().len(), 2);
    let consumer = pim.pcon(pconid).unwrap();
    assert_eq!(consumer.vblanks(), 2);
    assert_eq!(consumer.page_flips(), 2);
    assert_eq!(vcrtcm.flip_offset(pconid).unwrap(), 0x1000);

    within("detach after re-entrant callbacks", {
        let vcrtcm = vcrtcm.clone();
        move || vcrtcm.detach(pconid).unwrap()
    });
    assert_eq!(gpu.inner.live_allocations(), 0);
}

#[test]
fn tick_keeps_other_pcons_running_while_a_setter_blocks() {
    let (gated, entered, release) = GatedPcon::new(Parks::SetFb);
    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    let mem = Arc::new(MemoryPim::new());
    vcrtcm.register_pim("gated", GatedPim::new(gated.clone())).unwrap();
    vcrtcm.register_pim("mem", mem.clone()).unwrap();
    let gpu = Arc::new(SoftwareGpu::new());
    let fb = FbDescriptor::packed(16, 16, 32);

    let slow = vcrtcm.instantiate("gated", 0).unwrap();
    vcrtcm.attach(slow, gpu.clone()).unwrap();
    vcrtcm.set_fps(slow, 60).unwrap();
    let fast = vcrtcm.instantiate("mem", 0).unwrap();
    vcrtcm.attach(fast, gpu.clone()).unwrap();
    vcrtcm.set_fb(fast, &fb).unwrap();
    vcrtcm.set_fps(fast, 60).unwrap();

    // The consumer parks inside set_fb while the buffer mutex of `slow` is held.
    let setter = {
        let vcrtcm = vcrtcm.clone();
        thread::spawn(move || vcrtcm.set_fb(slow, &fb))
    };
    entered.recv().unwrap();

    let next = within("tick while a setter holds the buffer mutex", {
        let vcrtcm = vcrtcm.clone();
        move || vcrtcm.tick(0)
    });
    assert_eq!(next, Some(16_666_667));
    let fast_consumer = mem.pcon(fast).unwrap();
    assert_eq!(fast_consumer.vblanks(), 1);
    assert_eq!(fast_consumer.frames(), 1);
    // The blocked pcon still gets its vblank, just no frame.
    assert_eq!(gated.vblanks.load(Ordering::SeqCst), 1);
    assert_eq!(vcrtcm.get_vblank_time(slow).unwrap().count, 1);
    assert_eq!(gated.frames.load(Ordering::SeqCst), 0);

    release.send(()).unwrap();
    setter.join().unwrap().unwrap();

    // The pending transmission goes out on the next vblank.
    vcrtcm.tick(17 * MS);
    assert_eq!(gated.frames.load(Ordering::SeqCst), 1);
    assert_eq!(gated.vblanks.load(Ordering::SeqCst), 2);
}

#[test]
fn unregister_pim_waits_out_a_parked_attach() {
    let (pcon, entered, release) = GatedPcon::new(Parks::Attach);
    let pim = GatedPim::new(pcon.clone());
    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    vcrtcm.register_pim("gated", pim.clone()).unwrap();
    let pconid = vcrtcm.instantiate("gated", 0).unwrap();
    let gpu = Arc::new(SoftwareGpu::new());

    let attacher = {
        let vcrtcm = vcrtcm.clone();
        let gpu = gpu.clone();
        thread::spawn(move || vcrtcm.attach(pconid, gpu))
    };
    entered.recv().unwrap();

    let unregister = {
        let vcrtcm = vcrtcm.clone();
        thread::spawn(move || vcrtcm.unregister_pim("gated"))
    };
    // The pcon leaves the table before teardown waits for the attach.
    wait_until("pcon removal", || !vcrtcm.pconid_valid(pconid));
    assert!(!unregister.is_finished());

    release.send(()).unwrap();
    let err = attacher.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    unregister.join().unwrap().unwrap();

    assert_eq!(*pim.destroyed.lock().unwrap(), vec![pconid]);
    assert!(vcrtcm.pims().is_empty());
    assert!(vcrtcm.pcons().is_empty());
    // The abandoned attach told the consumer to let go again.
    assert_eq!(pcon.detaches.load(Ordering::SeqCst), 1);
    assert_eq!(gpu.live_allocations(), 0);
    assert_eq!(vcrtcm.metrics().snapshot().attaches_total, 0);
}

#[test]
fn destroy_waits_for_a_detach_in_progress() {
    let (park, entered, release) = Park::armed();
    let park = Arc::new(park);
    let gpu = Arc::new(HookedGpu {
        on_sync: Some(Box::new({
            let park = park.clone();
            move |_| park.hold()
        })),
        ..HookedGpu::default()
    });

    let vcrtcm = Arc::new(Vcrtcm::new(VcrtcmConfig::default()).unwrap());
    let pim = Arc::new(MemoryPim::new());
    vcrtcm.register_pim("mem", pim.clone()).unwrap();
    let pconid = vcrtcm.instantiate("mem", 0).unwrap();
    vcrtcm.attach(pconid, gpu.clone()).unwrap();
    vcrtcm
        .set_fb(pconid, &FbDescriptor::packed(16, 16, 32))
        .unwrap();

    // The explicit detach parks in gpu.sync while the pcon is Detaching.
    let detacher = {
        let vcrtcm = vcrtcm.clone();
        thread::spawn(move || vcrtcm.detach(pconid))
    };
    entered.recv().unwrap();

    let destroyer = {
        let vcrtcm = vcrtcm.clone();
        thread::spawn(move || vcrtcm.destroy(pconid))
    };
    wait_until("pcon removal", || !vcrtcm.pconid_valid(pconid));
    assert!(!destroyer.is_finished());

    release.send(()).unwrap();
    detacher.join().unwrap().unwrap();
    destroyer.join().unwrap().unwrap();

    assert_eq!(pim.destroyed(), vec![pconid]);
    assert_eq!(gpu.inner.live_allocations(), 0);
    assert_eq!(gpu.inner.detaches(), 1);
    assert_eq!(pim.live(), 0);

    // A later teardown of the same GPU finds nothing left to do.
    let gpu: Arc<dyn GpuFuncs> = gpu;
    assert_eq!(vcrtcm.unregister_gpu(&gpu), 0);
}
