use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::backend::{MemoryPcon, SoftwareGpu};
use crate::metrics::Metrics;
use crate::push_buffer::PushBuffers;
use crate::registry::{Pcon, PconRegistry};
use crate::types::{BufferKind, PconId};

const TABLE_SLOTS: usize = 16;
const PAGE: usize = 4096;

#[derive(Debug, Clone)]
enum TableOp {
    Alloc,
    /// Index into the currently live ids (modulo their count).
    Dealloc(usize),
}

fn table_ops() -> impl Strategy<Value = Vec<TableOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(TableOp::Alloc),
            2 => any::<usize>().prop_map(TableOp::Dealloc),
        ],
        1..128,
    )
}

fn run_table_ops(ops: &[TableOp]) -> TestCaseResult {
    let reg = PconRegistry::new(TABLE_SLOTS, 0);
    let mut live = BTreeSet::<PconId>::new();

    for op in ops {
        match op {
            TableOp::Alloc => match reg.alloc_pcon() {
                Ok(id) => {
                    prop_assert!(!live.contains(&id), "id {} handed out twice", id);
                    // Lowest free slot wins.
                    let expected = (0..TABLE_SLOTS as PconId)
                        .find(|i| !live.contains(i))
                        .unwrap();
                    prop_assert_eq!(id, expected);
                    reg.install(Arc::new(Pcon::new(
                        id,
                        "prop".into(),
                        0,
                        String::new(),
                        None,
                        Arc::new(MemoryPcon::new()),
                    )))
                    .unwrap();
                    live.insert(id);
                }
                Err(_) => {
                    prop_assert_eq!(live.len(), TABLE_SLOTS);
                }
            },
            TableOp::Dealloc(pick) => {
                if live.is_empty() {
                    continue;
                }
                let id = *live.iter().nth(pick % live.len()).unwrap();
                prop_assert!(reg.dealloc_pcon(id).is_some());
                live.remove(&id);
                prop_assert!(!reg.pconid_valid(id));
            }
        }

        let ids: BTreeSet<PconId> = reg.live().iter().map(|p| p.id).collect();
        prop_assert_eq!(&ids, &live);
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Resize {
    kind: BufferKind,
    bytes: usize,
    /// Successful allocations allowed before an injected failure.
    fail_after: Option<u64>,
}

fn resize_ops() -> impl Strategy<Value = Vec<Resize>> {
    let kind = prop_oneof![Just(BufferKind::Framebuffer), Just(BufferKind::Cursor)];
    let bytes = prop_oneof![Just(0usize), 1usize..=8 * PAGE];
    let fail_after = prop::option::weighted(0.3, 0u64..=2);
    prop::collection::vec(
        (kind, bytes, fail_after).prop_map(|(kind, bytes, fail_after)| Resize {
            kind,
            bytes,
            fail_after,
        }),
        1..48,
    )
}

fn pages_of(bufs: &PushBuffers, kind: BufferKind) -> Option<[usize; 2]> {
    bufs.pair(kind).map(|pair| {
        let info = pair.info();
        [info[0].pages, info[1].pages]
    })
}

fn run_resize_ops(ops: &[Resize]) -> TestCaseResult {
    let gpu = SoftwareGpu::new();
    let metrics = Metrics::new();
    let mut bufs = PushBuffers::default();

    for op in ops {
        let before = pages_of(&bufs, op.kind);
        if let Some(n) = op.fail_after {
            gpu.fail_alloc_after(n);
        }
        let result = bufs.ensure_size(&gpu, 0, op.kind, op.bytes, PAGE, &metrics);
        let after = pages_of(&bufs, op.kind);
        let wanted = op.bytes.div_ceil(PAGE);

        match result {
            Ok(()) if wanted == 0 => {
                prop_assert_eq!(after, None);
            }
            Ok(()) => {
                prop_assert_eq!(after, Some([wanted, wanted]));
            }
            // A failed resize leaves the kind untouched.
            Err(_) => {
                prop_assert_eq!(after, before);
            }
        }
        // Disarm whatever the op did not consume.
        gpu.fail_alloc_after(u64::MAX);

        let pairs = [BufferKind::Framebuffer, BufferKind::Cursor]
            .into_iter()
            .filter(|&k| bufs.pair(k).is_some())
            .count();
        prop_assert_eq!(gpu.live_allocations(), pairs * 2);
    }

    bufs.release_all(&gpu, &metrics);
    prop_assert_eq!(gpu.live_allocations(), 0);
    let m = metrics.snapshot();
    prop_assert_eq!(m.push_buffer_allocs_total, m.push_buffer_frees_total);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_live_pcon_ids_are_unique(ops in table_ops()) {
        run_table_ops(&ops)?;
    }

    #[test]
    fn prop_push_buffer_pairs_never_half_allocated(ops in resize_ops()) {
        run_resize_ops(&ops)?;
    }
}
