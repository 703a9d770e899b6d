use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    // Pcons
    pcons_live: AtomicU64,
    pcons_created_total: AtomicU64,

    // Attachments
    attaches_total: AtomicU64,
    detaches_total: AtomicU64,

    // Vblank / transmission
    vblanks_emulated_total: AtomicU64,
    pushes_total: AtomicU64,
    push_failures_total: AtomicU64,
    frames_transmitted_total: AtomicU64,
    transmit_failures_total: AtomicU64,

    // Push buffers
    push_buffer_allocs_total: AtomicU64,
    push_buffer_frees_total: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pcons_live: u64,
    pub pcons_created_total: u64,
    pub attaches_total: u64,
    pub detaches_total: u64,
    pub vblanks_emulated_total: u64,
    pub pushes_total: u64,
    pub push_failures_total: u64,
    pub frames_transmitted_total: u64,
    pub transmit_failures_total: u64,
    pub push_buffer_allocs_total: u64,
    pub push_buffer_frees_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pcon_created(&self) {
        self.inner.pcons_created_total.fetch_add(1, Ordering::Relaxed);
        self.inner.pcons_live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pcon_destroyed(&self) {
        self.inner.pcons_live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn attached(&self) {
        self.inner.attaches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detached(&self) {
        self.inner.detaches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vblank_emulated(&self) {
        self.inner
            .vblanks_emulated_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_attempted(&self) {
        self.inner.pushes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_failed(&self) {
        self.inner
            .push_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_transmitted(&self) {
        self.inner
            .frames_transmitted_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn transmit_failed(&self) {
        self.inner
            .transmit_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_buffer_allocated(&self) {
        self.inner
            .push_buffer_allocs_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_buffer_freed(&self) {
        self.inner
            .push_buffer_frees_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            pcons_live: i.pcons_live.load(Ordering::Relaxed),
            pcons_created_total: i.pcons_created_total.load(Ordering::Relaxed),
            attaches_total: i.attaches_total.load(Ordering::Relaxed),
            detaches_total: i.detaches_total.load(Ordering::Relaxed),
            vblanks_emulated_total: i.vblanks_emulated_total.load(Ordering::Relaxed),
            pushes_total: i.pushes_total.load(Ordering::Relaxed),
            push_failures_total: i.push_failures_total.load(Ordering::Relaxed),
            frames_transmitted_total: i.frames_transmitted_total.load(Ordering::Relaxed),
            transmit_failures_total: i.transmit_failures_total.load(Ordering::Relaxed),
            push_buffer_allocs_total: i.push_buffer_allocs_total.load(Ordering::Relaxed),
            push_buffer_frees_total: i.push_buffer_frees_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        push_gauge(&mut out, "vcrtcm_pcons_live", s.pcons_live);
        push_counter(&mut out, "vcrtcm_pcons_created_total", s.pcons_created_total);

        push_counter(&mut out, "vcrtcm_attaches_total", s.attaches_total);
        push_counter(&mut out, "vcrtcm_detaches_total", s.detaches_total);

        push_counter(
            &mut out,
            "vcrtcm_vblanks_emulated_total",
            s.vblanks_emulated_total,
        );
        push_counter(&mut out, "vcrtcm_pushes_total", s.pushes_total);
        push_counter(&mut out, "vcrtcm_push_failures_total", s.push_failures_total);
        push_counter(
            &mut out,
            "vcrtcm_frames_transmitted_total",
            s.frames_transmitted_total,
        );
        push_counter(
            &mut out,
            "vcrtcm_transmit_failures_total",
            s.transmit_failures_total,
        );

        push_counter(
            &mut out,
            "vcrtcm_push_buffer_allocs_total",
            s.push_buffer_allocs_total,
        );
        push_counter(
            &mut out,
            "vcrtcm_push_buffer_frees_total",
            s.push_buffer_frees_total,
        );

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_sample(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_sample(out, name, "counter", val);
}

fn push_sample(out: &mut String, name: &str, ty: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(ty);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}
