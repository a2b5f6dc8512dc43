use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use super::simulate::{run_reference, run_scheduled, verify, SimOptions};
use super::*;
use crate::error::SimulationError;
use crate::infer::infer;
use crate::ir::builder::{pvar, KernelBuilder};
use crate::ir::{Access, Affine, Assign, BinaryOp, DType, Expr};
use crate::kernels::{matmul, MatmulConfig};
use crate::tensor::{TensorSupply, Tolerance};

fn config(trip: u32, stages: u32) -> MatmulConfig {
    MatmulConfig {
        m: 64,
        n: 64,
        k: 32 * trip,
        block_m: 32,
        block_n: 32,
        block_k: 32,
        stages,
        ..MatmulConfig::default()
    }
}

fn inferred(trip: u32, stages: u32) -> Kernel {
    infer(matmul(&config(trip, stages)), &TargetCaps::sm80())
        .unwrap()
        .kernel
}

fn scheduled(trip: u32, stages: u32) -> Kernel {
    schedule(inferred(trip, stages), &TargetCaps::sm80()).unwrap()
}

fn region_of(kernel: &Kernel) -> OpId {
    kernel
        .body
        .iter()
        .find(|op| matches!(op.kind, OpKind::Pipelined { .. }))
        .map(|op| op.id)
        .unwrap()
}

fn staged_of(kernel: &Kernel) -> &StagedLoop {
    kernel
        .body
        .iter()
        .find_map(|op| match &op.kind {
            OpKind::Pipelined {
                schedule: Some(s), ..
            } => Some(s),
            _ => None,
        })
        .unwrap()
}

fn staged_mut(kernel: &mut Kernel) -> &mut StagedLoop {
    kernel
        .body
        .iter_mut()
        .find_map(|op| match &mut op.kind {
            OpKind::Pipelined {
                schedule: Some(s), ..
            } => Some(s),
            _ => None,
        })
        .unwrap()
}

/// Walk the unrolled schedule and check the ordering every consumer relies on.
fn check_ordering(s: &StagedLoop) {
    let stages = s.stages as u64;
    let mut issued: HashMap<(OpId, u64), u32> = HashMap::new();
    let mut acquired = HashSet::new();
    let mut released = HashSet::new();
    let mut consumed: HashMap<u64, usize> = HashMap::new();

    for step in s.unroll() {
        for action in step.actions {
            match action {
                ConcreteAction::Wait {
                    kind: WaitKind::Acquire,
                    iter,
                    slot,
                } => {
                    assert_eq!(slot, s.slot(iter));
                    for p in &s.producers {
                        assert!(issued.contains_key(&(*p, iter)), "acquire({}) before {}", iter, p);
                    }
                    acquired.insert(iter);
                }
                ConcreteAction::Wait {
                    kind: WaitKind::Release,
                    iter,
                    ..
                } => {
                    assert_eq!(
                        consumed.get(&iter).copied().unwrap_or(0),
                        s.consumers.len(),
                        "release({}) before its consumers ran",
                        iter
                    );
                    released.insert(iter);
                }
                ConcreteAction::Issue {
                    op,
                    role: OpRole::Producer,
                    iter,
                    slot,
                } => {
                    assert_eq!(slot as u64, iter % stages);
                    if iter >= stages {
                        assert!(released.contains(&(iter - stages)), "slot {} reused early", slot);
                    }
                    *issued.entry((op, iter)).or_default() += 1;
                }
                ConcreteAction::Issue {
                    op,
                    role: OpRole::Consumer,
                    iter,
                    ..
                } => {
                    assert!(acquired.contains(&iter), "{} ran before acquire({})", op, iter);
                    *consumed.entry(iter).or_default() += 1;
                }
            }
        }
    }

    for j in 0..s.trip_count {
        for p in &s.producers {
            assert_eq!(issued.get(&(*p, j)), Some(&1), "{} at {}", p, j);
        }
        assert_eq!(consumed.get(&j).copied().unwrap_or(0), s.consumers.len());
    }
    assert_eq!(consumed.len() as u64, s.trip_count);
}

// --- Stage count ---

#[test]
fn test_effective_stages() {
    assert_eq!(effective_stages(3, 10), 3);
    assert_eq!(effective_stages(8, 2), 2);
    assert_eq!(effective_stages(0, 5), 1);
    assert_eq!(effective_stages(3, 0), 1);
    assert_eq!(effective_stages(1, 1), 1);
}

// --- Scheduling the matmul loop ---

#[test]
fn test_schedule_matmul_three_stages() {
    let mut kernel = inferred(4, 3);
    let tiles_before = kernel.tiles.len();
    let region = region_of(&kernel);
    let s = schedule_region(&mut kernel, region, &TargetCaps::sm80()).unwrap();

    assert_eq!(s.stages, 3);
    assert_eq!(s.producers.len(), 2);
    assert_eq!(s.consumers.len(), 1);
    assert_eq!(s.prologue.len(), 2);
    assert_eq!(
        s.steady.as_ref().map(|st| (st.first, st.last)),
        Some((2, 3))
    );
    assert_eq!(s.epilogue.len(), 2);

    assert_eq!(s.rotation.len(), 2);
    assert_eq!(kernel.tiles.len(), tiles_before + 6);
    let a_shared = kernel.find_tile("A_shared").unwrap();
    let slots: Vec<&str> = s.rotation[0]
        .slots
        .iter()
        .map(|t| kernel.tile(*t).name.as_str())
        .collect();
    assert_eq!(s.rotation[0].logical, a_shared);
    assert_eq!(slots, vec!["A_shared@0", "A_shared@1", "A_shared@2"]);
    for slot in &s.rotation[0].slots {
        assert_eq!(kernel.tile(*slot).layout, kernel.tile(a_shared).layout);
    }

    assert_eq!(staged_of(&kernel), &s);
    check_ordering(&s);
}

#[test]
fn test_roles_and_slots() {
    let kernel = scheduled(5, 2);
    let s = staged_of(&kernel);
    let gemm = s.consumers[0];
    assert_eq!(s.role_of(gemm), Some(OpRole::Consumer));
    assert_eq!(s.role_of(s.producers[1]), Some(OpRole::Producer));
    assert_eq!(s.role_of(OpId(999)), None);

    let b_shared = kernel.find_tile("B_shared").unwrap();
    let b_slots = &s.rotation[1].slots;
    assert_eq!(s.slot_tile(b_shared, 0), Some(b_slots[0]));
    assert_eq!(s.slot_tile(b_shared, 3), Some(b_slots[1]));
    let c_local = kernel.find_tile("C_local").unwrap();
    assert_eq!(s.slot_tile(c_local, 0), None);
}

#[test]
fn test_unroll_two_stages() {
    let kernel = scheduled(4, 2);
    let s = staged_of(&kernel);
    let steps = s.unroll();
    assert_eq!(steps.len(), 1 + 3 + 1);
    assert_eq!(steps[0].phase, Phase::Prologue);
    assert_eq!(steps[4].phase, Phase::Epilogue);

    // first steady step has no slot to release yet
    assert!(matches!(
        steps[1].actions[0],
        ConcreteAction::Issue {
            role: OpRole::Producer,
            iter: 1,
            slot: 1,
            ..
        }
    ));
    assert_eq!(
        steps[2].actions[0],
        ConcreteAction::Wait {
            kind: WaitKind::Release,
            iter: 0,
            slot: 0
        }
    );
    assert_eq!(
        steps[4].actions[0],
        ConcreteAction::Wait {
            kind: WaitKind::Acquire,
            iter: 3,
            slot: 1
        }
    );
    check_ordering(s);
}

#[test]
fn test_sync_edges() {
    let kernel = scheduled(3, 2);
    let s = staged_of(&kernel);
    let edges = s.sync_edges();
    assert_eq!(edges.len(), 3 * 2);
    for j in 0..3 {
        for &p in &s.producers {
            assert!(edges.contains(&SyncEdge {
                producer: p,
                consumer: s.consumers[0],
                iter: j,
                slot: (j % 2) as u32,
            }));
        }
    }
}

#[test]
fn test_describe() {
    let kernel = scheduled(4, 2);
    let lines = staged_of(&kernel).describe();
    assert_eq!(
        lines,
        vec![
            "stages=2 (requested 2) trip=4",
            "rotate t3 -> [t6, t7]",
            "rotate t4 -> [t8, t9]",
            "prologue[0]: %4@0 %5@0",
            "steady i=1..=3: release(i-2) %4@i %5@i acquire(i-1) %6@i-1",
            "epilogue[0]: acquire(3) %6@3",
        ]
    );
}

#[test]
fn test_stages_clamped_to_trip_count() {
    let kernel = scheduled(2, 8);
    let s = staged_of(&kernel);
    assert_eq!(s.requested_stages, 8);
    assert_eq!(s.stages, 2);
    assert_eq!(s.rotation[0].slots.len(), 2);
    assert_eq!(s.describe()[0], "stages=2 (requested 8) trip=2");
    check_ordering(s);
}

#[test]
fn test_zero_stages_means_no_overlap() {
    let kernel = scheduled(3, 0);
    let s = staged_of(&kernel);
    assert_eq!(s.stages, 1);
    assert!(s.prologue.is_empty());
    assert!(s.epilogue.is_empty());
    assert_eq!(s.rotation[0].slots, vec![s.rotation[0].logical]);
    assert_eq!(
        s.steady.as_ref().map(|st| (st.first, st.last)),
        Some((0, 2))
    );
    check_ordering(s);
}

#[test]
fn test_zero_trip_count_is_empty() {
    let mut kernel = inferred(2, 3);
    let region = region_of(&kernel);
    if let Some(OpKind::Pipelined { trip_count, .. }) =
        kernel.find_op_mut(region).map(|op| &mut op.kind)
    {
        *trip_count = 0;
    }
    let s = schedule_region(&mut kernel, region, &TargetCaps::sm80()).unwrap();
    assert!(s.prologue.is_empty());
    assert!(s.steady.is_none());
    assert!(s.epilogue.is_empty());
    assert!(s.unroll().is_empty());
    assert!(s.sync_edges().is_empty());
}

#[test]
fn test_schedule_skips_scheduled_regions() {
    let once = scheduled(3, 3);
    let twice = schedule(once.clone(), &TargetCaps::sm80()).unwrap();
    assert_eq!(once, twice);
}

// --- Errors ---

#[test]
fn test_not_a_region() {
    let mut kernel = inferred(2, 2);
    let s = staged_of_err(schedule_region(&mut kernel, OpId(3), &TargetCaps::sm80()));
    assert_eq!(s, ScheduleError::NotARegion { op: OpId(3) });
    let s = staged_of_err(schedule_region(&mut kernel, OpId(999), &TargetCaps::sm80()));
    assert_eq!(s, ScheduleError::NotARegion { op: OpId(999) });
}

fn staged_of_err(r: Result<StagedLoop, ScheduleError>) -> ScheduleError {
    match r {
        Ok(_) => panic!("expected a schedule error"),
        Err(e) => e,
    }
}

#[test]
fn test_nested_region() {
    let mut b = KernelBuilder::new("nested");
    let x = b.alloc_fragment("x", &[32], DType::F32);
    let mut inner = OpId(0);
    let outer = b.pipelined("i", 4, 2, |b| {
        inner = b.pipelined("j", 4, 2, |b| {
            b.clear(x);
        });
    });
    let mut kernel = b.build();
    let err = schedule_region(&mut kernel, outer, &TargetCaps::sm80()).unwrap_err();
    assert_eq!(
        err,
        ScheduleError::NestedRegion {
            region: outer,
            inner
        }
    );
    assert_eq!(
        schedule(kernel, &TargetCaps::sm80()).unwrap_err(),
        ScheduleError::NestedRegion {
            region: outer,
            inner
        }
    );
}

#[test]
fn test_unresolved_layout() {
    let kernel = matmul(&config(2, 2));
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::UnresolvedLayout { ref tile, .. } if tile == "A_shared"
    ));
}

#[test]
fn test_shared_memory_exceeded() {
    let cfg = MatmulConfig {
        k: 512,
        block_k: 64,
        stages: 8,
        ..MatmulConfig::default()
    };
    let kernel = infer(matmul(&cfg), &TargetCaps::sm80()).unwrap().kernel;
    let tiles = kernel.tiles.len();
    let region = region_of(&kernel);
    let mut attempt = kernel.clone();
    let err = schedule_region(&mut attempt, region, &TargetCaps::sm80()).unwrap_err();
    assert_eq!(
        err,
        ScheduleError::SharedMemoryExceeded {
            region,
            stages: 8,
            required: 2 * 128 * 64 * 2 * 8,
            available: 164 * 1024,
        }
    );
    assert_eq!(attempt.tiles.len(), tiles);
    assert_eq!(attempt, kernel);
}

#[test]
fn test_shared_bytes_counts_slots_once() {
    let kernel = scheduled(4, 3);
    // logical buffers are retired, three 2 KiB slots each remain
    assert_eq!(shared_bytes(&kernel, &[], 1), 2 * 3 * 32 * 32 * 2);
    let before = inferred(4, 3);
    let rotated = [
        before.find_tile("A_shared").unwrap(),
        before.find_tile("B_shared").unwrap(),
    ];
    assert_eq!(shared_bytes(&before, &rotated, 3), 2 * 3 * 32 * 32 * 2);
    assert_eq!(shared_bytes(&before, &[], 3), 2 * 32 * 32 * 2);
}

/// `x <- G[k]`, then `t = x + u` and `u = t`: `u` flows to the next iteration.
fn carried_kernel() -> (Kernel, OpId, OpId) {
    let mut b = KernelBuilder::new("carried").threads(&[128]);
    let g = b.global("G", &[8, 32], DType::F32);
    let x = b.alloc_fragment("x", &[1, 32], DType::F32);
    let t = b.alloc_fragment("t", &[1, 32], DType::F32);
    let u = b.alloc_fragment("u", &[1, 32], DType::F32);
    let at = |tile| Access {
        tile,
        indices: vec![pvar(0), pvar(1)],
    };
    let mut ids = (OpId(0), OpId(0));
    b.pipelined("k", 8, 2, |b| {
        let src = b.region(g, vec![Affine::loop_var("k"), Affine::constant(0)], &[1, 32]);
        let dst = b.full(x);
        b.copy(src, dst);
        let sum = Assign {
            dst: at(t),
            value: Expr::binary(
                BinaryOp::Add,
                Expr::Load(at(x)),
                Expr::Load(at(u)),
            ),
        };
        ids.0 = b.parallel(&[1, 32], vec![sum]);
        let back = Assign {
            dst: at(u),
            value: Expr::Load(at(t)),
        };
        ids.1 = b.parallel(&[1, 32], vec![back]);
    });
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    (kernel, ids.0, ids.1)
}

#[test]
fn test_loop_carried_consumer_dependency_rejected() {
    let (kernel, reader, writer) = carried_kernel();
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    match err {
        ScheduleError::UnsupportedDependency {
            reader: r,
            writer: w,
            tile,
            reason,
            ..
        } => {
            assert_eq!((r, w), (reader, writer));
            assert_eq!(tile, "u");
            assert!(reason.contains("loop-carried"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_producer_reading_loop_output_rejected() {
    let mut b = KernelBuilder::new("feedback").threads(&[128]);
    let g = b.global("G", &[4, 32], DType::F32);
    let x = b.alloc_fragment("x", &[1, 32], DType::F32);
    let mut ids = (OpId(0), OpId(0));
    b.pipelined("k", 4, 2, |b| {
        let row = vec![Affine::loop_var("k"), Affine::constant(0)];
        let src = b.region(g, row.clone(), &[1, 32]);
        let dst = b.full(x);
        ids.0 = b.copy(src, dst);
        let src = b.full(x);
        let dst = b.region(g, row, &[1, 32]);
        ids.1 = b.copy(src, dst);
    });
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::UnsupportedDependency { reader, writer, ref tile, .. }
            if reader == ids.0 && writer == ids.1 && tile == "G"
    ));
}

#[test]
fn test_producer_after_its_consumer_rejected() {
    let mut b = KernelBuilder::new("late_load").threads(&[128]);
    let g = b.global("G", &[4, 32], DType::F32);
    let x = b.alloc_fragment("x", &[1, 32], DType::F32);
    let y = b.alloc_fragment("y", &[1, 32], DType::F32);
    let mut ids = (OpId(0), OpId(0));
    b.pipelined("k", 4, 2, |b| {
        let read = Assign {
            dst: Access {
                tile: y,
                indices: vec![pvar(0), pvar(1)],
            },
            value: Expr::load(x, vec![pvar(0), pvar(1)]),
        };
        ids.0 = b.parallel(&[1, 32], vec![read]);
        let src = b.region(g, vec![Affine::loop_var("k"), Affine::constant(0)], &[1, 32]);
        let dst = b.full(x);
        ids.1 = b.copy(src, dst);
    });
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    match err {
        ScheduleError::UnsupportedDependency {
            reader,
            writer,
            tile,
            reason,
            ..
        } => {
            assert_eq!((reader, writer), (ids.1, ids.0));
            assert_eq!(tile, "x");
            assert!(reason.contains("depends on a consumer"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_relayout_pair_around_accumulator_is_loop_carried() {
    let mut kernel = matmul(&config(4, 2));
    let c = kernel.find_tile("C_local").unwrap();
    kernel.tile_mut(c).declared = Some(crate::layout::Layout::fragment(
        &[32, 32],
        crate::layout::FragmentLayout::Striped {
            threads: 128,
            vector: 4,
        },
    ));
    let kernel = infer(kernel, &TargetCaps::sm80()).unwrap().kernel;
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::UnsupportedDependency { ref tile, .. } if tile == "C_local"
    ));
}

// --- Simulation ---

fn one_block(supply: TensorSupply) -> SimOptions {
    SimOptions {
        supply,
        seed: 7,
        max_blocks: Some(1),
    }
}

#[test]
fn test_staged_run_matches_reference() {
    let kernel = scheduled(4, 3);
    let opts = SimOptions::default();
    let verified = verify(&kernel, &opts, Tolerance::exact()).unwrap();
    assert_eq!(verified.blocks, 4);
    assert_eq!(verified.regions, 1);
    assert_eq!(verified.compared, 64 * 128 + 64 * 128 + 64 * 64);

    let c = kernel.find_tile("C").unwrap();
    let reference = run_reference(&kernel, &opts).unwrap();
    let staged = run_scheduled(&kernel, &opts).unwrap();
    assert_eq!(reference.get(c), staged.get(c));
    assert!(reference.get(c).iter().any(|&v| v != 0.0));
}

#[test]
fn test_reference_result_with_ones() {
    let kernel = scheduled(4, 2);
    let opts = SimOptions {
        max_blocks: None,
        ..one_block(TensorSupply::One)
    };
    let c = kernel.find_tile("C").unwrap();
    let staged = run_scheduled(&kernel, &opts).unwrap();
    // every output element sums K = 128 products of ones
    assert!(staged.get(c).iter().all(|&v| v == 128.0));
}

#[test]
fn test_missing_acquire_is_detected() {
    let mut kernel = scheduled(4, 2);
    let s = staged_mut(&mut kernel);
    let is_acquire = |a: &Action| {
        matches!(
            a,
            Action::Wait {
                kind: WaitKind::Acquire,
                ..
            }
        )
    };
    if let Some(steady) = s.steady.as_mut() {
        steady.step.actions.retain(|a| !is_acquire(a));
    }
    for step in &mut s.epilogue {
        step.actions.retain(|a| !is_acquire(a));
    }
    let err = verify(&kernel, &one_block(TensorSupply::One), Tolerance::default()).unwrap_err();
    assert!(matches!(err, SimulationError::Mismatch { ref tile, .. } if tile == "C"));
}

#[test]
fn test_late_release_is_detected() {
    let mut kernel = scheduled(4, 2);
    let s = staged_mut(&mut kernel);
    if let Some(steady) = s.steady.as_mut() {
        let release = steady.step.actions.remove(0);
        steady.step.actions.push(release);
    }
    let err = verify(&kernel, &one_block(TensorSupply::One), Tolerance::default()).unwrap_err();
    assert_eq!(
        err,
        SimulationError::ReleaseViolation {
            region: s_region(&kernel),
            iter: 0,
            slot: 0
        }
    );
}

fn s_region(kernel: &Kernel) -> OpId {
    staged_of(kernel).region
}

proptest! {
    #[test]
    fn prop_unrolled_schedule_is_ordered(trip in 0u64..16, stages in 0u32..8, consumers in 1usize..4) {
        let producers = vec![OpId(0), OpId(1)];
        let consumers: Vec<OpId> = (0..consumers).map(|i| OpId(2 + i as u32)).collect();
        let s = StagedLoop::build(OpId(9), "k", trip, stages, producers, consumers, Vec::new());
        prop_assert_eq!(s.stages, effective_stages(stages, trip));
        prop_assert_eq!(s.sync_edges().len() as u64, trip * 2 * s.consumers.len() as u64);
        check_ordering(&s);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_staged_matmul_matches_sequential(
        (trip, stages) in (1u32..=6).prop_flat_map(|t| (Just(t), 1..=t)),
        seed in 0u64..1000,
    ) {
        let kernel = scheduled(trip, stages);
        let opts = SimOptions {
            supply: TensorSupply::Integer,
            seed,
            max_blocks: Some(2),
        };
        let verified = verify(&kernel, &opts, Tolerance::exact());
        prop_assert!(verified.is_ok(), "{:?}", verified);
    }
}

#[test]
fn test_partial_producer_fill_rejected() {
    let mut b = KernelBuilder::new("row_by_row").threads(&[128]);
    let g = b.global("G", &[4, 32], DType::F32);
    let x = b.alloc_fragment("X", &[4, 32], DType::F32);
    let o = b.global("O", &[4, 32], DType::F32);
    let mut ids = (OpId(0), OpId(0));
    b.pipelined("k", 4, 2, |b| {
        let row = vec![Affine::loop_var("k"), Affine::constant(0)];
        let src = b.region(g, row.clone(), &[1, 32]);
        let dst = b.region(x, row, &[1, 32]);
        ids.0 = b.copy(src, dst);
        let src = b.full(x);
        let dst = b.full(o);
        ids.1 = b.copy(src, dst);
    });
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    let err = schedule(kernel, &TargetCaps::sm80()).unwrap_err();
    match err {
        ScheduleError::UnsupportedDependency {
            reader,
            writer,
            tile,
            reason,
            ..
        } => {
            assert_eq!((reader, writer), (ids.1, ids.0));
            assert_eq!(tile, "X");
            assert!(reason.contains("part of a rotated buffer"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }
}
