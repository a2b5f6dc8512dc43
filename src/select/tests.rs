use super::*;
use crate::infer::infer;
use crate::ir::builder::{pvar, KernelBuilder};
use crate::ir::{Access, Affine, Assign, BinaryOp, DType, Expr};
use crate::kernels::{matmul, MatmulConfig};
use crate::layout::FragmentLayout;
use crate::target::mma;

fn matmul_on(caps: &TargetCaps) -> Kernel {
    infer(matmul(&MatmulConfig::default()), caps).unwrap().kernel
}

fn op_where(kernel: &Kernel, pred: impl Fn(&OpKind) -> bool) -> &Op {
    kernel.ops().into_iter().find(|op| pred(&op.kind)).unwrap()
}

fn is_gemm(kind: &OpKind) -> bool {
    matches!(kind, OpKind::Gemm { .. })
}

fn copy_into<'a>(kernel: &'a Kernel, name: &str) -> &'a Op {
    let tile = kernel.find_tile(name).unwrap();
    op_where(kernel, |k| matches!(k, OpKind::Copy { dst, .. } if dst.tile == tile))
}

#[test]
fn test_gemm_binds_matrix_instruction() {
    let caps = TargetCaps::sm80();
    let kernel = matmul_on(&caps);
    let gemm = op_where(&kernel, is_gemm);
    let sig = mma::lookup(&caps, DType::F16, DType::F16, DType::F32).unwrap();
    assert_eq!(
        select(gemm, &kernel, &caps).unwrap(),
        Some(Strategy::MatrixInstruction {
            instruction: sig.name.clone(),
            shape: [16, 8, 16],
            warps: [2, 2],
            repeats: [4, 8, 2],
        })
    );
}

#[test]
fn test_gemm_strategy_agrees_with_accumulator_layout() {
    let caps = TargetCaps::gfx90a();
    let kernel = matmul_on(&caps);
    let gemm = op_where(&kernel, is_gemm);
    let Some(Strategy::MatrixInstruction { warps, .. }) = select(gemm, &kernel, &caps).unwrap()
    else {
        panic!("expected a matrix instruction");
    };
    let c = kernel.tile(kernel.find_tile("C_local").unwrap());
    match c.layout.as_ref().map(|l| &l.kind) {
        Some(LayoutKind::Fragment(FragmentLayout::Operand { warps: w, .. })) => {
            assert_eq!(*w, warps)
        }
        other => panic!("unexpected accumulator layout {:?}", other),
    }
}

#[test]
fn test_gemm_without_instruction_is_scalar() {
    let caps = TargetCaps::sm70();
    let kernel = matmul_on(&caps);
    let gemm = op_where(&kernel, is_gemm);
    assert_eq!(select(gemm, &kernel, &caps).unwrap(), Some(Strategy::Scalar));
}

#[test]
fn test_tampered_accumulator_is_a_mismatch() {
    let caps = TargetCaps::sm80();
    let mut kernel = matmul_on(&caps);
    let c = kernel.find_tile("C_local").unwrap();
    kernel.tile_mut(c).layout = Some(Layout::fragment(
        &[128, 128],
        FragmentLayout::Striped {
            threads: 128,
            vector: 4,
        },
    ));
    let gemm = op_where(&kernel, is_gemm);
    let err = select(gemm, &kernel, &caps).unwrap_err();
    let SelectionError::LayoutMismatch {
        op,
        tile,
        constraint,
    } = err;
    assert_eq!(op, gemm.id);
    assert_eq!(tile, "C_local");
    assert!(constraint.contains("operand C"), "{}", constraint);
}

#[test]
fn test_shared_loads_use_cp_async() {
    let caps = TargetCaps::sm80();
    let kernel = matmul_on(&caps);
    for name in ["A_shared", "B_shared"] {
        let copy = copy_into(&kernel, name);
        assert_eq!(
            select(copy, &kernel, &caps).unwrap(),
            Some(Strategy::BulkAsyncCopy {
                engine: BulkEngine::CpAsync,
                bytes: 128 * 32 * 2,
            }),
            "{}",
            name
        );
    }
}

#[test]
fn test_shared_loads_use_tma_on_sm90() {
    let caps = TargetCaps::sm90();
    let kernel = matmul_on(&caps);
    let copy = copy_into(&kernel, "A_shared");
    assert!(matches!(
        select(copy, &kernel, &caps).unwrap(),
        Some(Strategy::BulkAsyncCopy {
            engine: BulkEngine::Tma,
            ..
        })
    ));
}

#[test]
fn test_no_bulk_engine_falls_back_to_vectors() {
    let caps = TargetCaps::sm70();
    let kernel = matmul_on(&caps);
    let copy = copy_into(&kernel, "A_shared");
    assert_eq!(
        select(copy, &kernel, &caps).unwrap(),
        Some(Strategy::Vector { width: 8 })
    );
}

#[test]
fn test_small_copies_skip_the_bulk_engine() {
    let caps = TargetCaps::sm80();
    let mut b = KernelBuilder::new("small_copy").threads(&[128]);
    let g = b.global("G", &[8, 32], DType::F16);
    let s = b.alloc_shared("S", &[8, 32], DType::F16);
    let src = b.full(g);
    let dst = b.full(s);
    let id = b.copy(src, dst);
    let kernel = infer(b.build(), &caps).unwrap().kernel;
    let op = kernel.find_op(id).unwrap();
    // 512 bytes, under the engine's minimum
    assert_eq!(
        select(op, &kernel, &caps).unwrap(),
        Some(Strategy::Vector { width: 8 })
    );
}

fn window_copy(cols: u32) -> (Kernel, OpId) {
    let mut b = KernelBuilder::new("window").threads(&[128]);
    let g = b.global("G", &[128, 64], DType::F16);
    let s = b.alloc_shared("S", &[128, 64], DType::F16);
    let origin = vec![Affine::constant(0); 2];
    let src = b.region(g, origin.clone(), &[128, cols]);
    let dst = b.region(s, origin, &[128, cols]);
    let id = b.copy(src, dst);
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    (kernel, id)
}

#[test]
fn test_narrow_window_skips_the_bulk_engine() {
    let caps = TargetCaps::sm80();
    // 1024 bytes in 8-byte rows: large enough, but rows split 16-byte chunks
    let (kernel, id) = window_copy(4);
    let strategy = select(kernel.find_op(id).unwrap(), &kernel, &caps).unwrap();
    assert!(
        !matches!(strategy, Some(Strategy::BulkAsyncCopy { .. })),
        "{:?}",
        strategy
    );

    let (kernel, id) = window_copy(8);
    let strategy = select(kernel.find_op(id).unwrap(), &kernel, &caps).unwrap();
    assert_eq!(
        strategy,
        Some(Strategy::BulkAsyncCopy {
            engine: BulkEngine::CpAsync,
            bytes: 128 * 8 * 2,
        })
    );
}

#[test]
fn test_accumulator_store_width_follows_fragment_runs() {
    let caps = TargetCaps::sm80();
    let kernel = matmul_on(&caps);
    let store = copy_into(&kernel, "C");
    // the accumulator atom keeps two adjacent columns per thread
    assert_eq!(
        select(store, &kernel, &caps).unwrap(),
        Some(Strategy::Vector { width: 2 })
    );
}

#[test]
fn test_structural_ops_have_no_strategy() {
    let caps = TargetCaps::sm80();
    let kernel = matmul_on(&caps);
    for op in kernel.ops() {
        let s = select(op, &kernel, &caps).unwrap();
        match op.kind {
            OpKind::Alloc { .. } | OpKind::Pipelined { .. } => assert!(s.is_none()),
            _ => assert!(s.is_some(), "{} has no strategy", op.id),
        }
    }
}

#[test]
fn test_select_kernel_annotates_ops() {
    let caps = TargetCaps::sm80();
    let kernel = select_kernel(matmul_on(&caps), &caps).unwrap();
    let gemm = op_where(&kernel, is_gemm);
    assert_eq!(
        gemm.strategy.as_ref().map(Strategy::describe).as_deref(),
        Some("mma[mma.m16n8k16.f32.f16.f16.f32, warps 2x2, repeats 4x8x2]")
    );
    let copy = copy_into(&kernel, "B_shared");
    assert_eq!(
        copy.strategy.as_ref().map(Strategy::describe).as_deref(),
        Some("bulk[cp.async, 8192B]")
    );
}

#[test]
fn test_unresolved_on_chip_layout_is_a_mismatch() {
    let caps = TargetCaps::sm80();
    let kernel = matmul(&MatmulConfig::default());
    let copy = copy_into(&kernel, "A_shared");
    let SelectionError::LayoutMismatch { tile, constraint, .. } =
        select(copy, &kernel, &caps).unwrap_err();
    assert_eq!(tile, "A_shared");
    assert_eq!(constraint, "a resolved layout");
}

fn pinned_copy(width: u32) -> (Kernel, OpId) {
    let mut b = KernelBuilder::new("pinned").threads(&[128]);
    let g = b.global("G", &[64, 64], DType::F16);
    let s = b.alloc_shared("S", &[64, 64], DType::F16);
    let src = b.full(g);
    let dst = b.full(s);
    let id = b.copy_coalesced(src, dst, width);
    let kernel = infer(b.build(), &TargetCaps::sm80()).unwrap().kernel;
    (kernel, id)
}

fn set_width(kernel: &mut Kernel, id: OpId, width: u32) {
    if let Some(OpKind::Copy {
        coalesced_width, ..
    }) = kernel.find_op_mut(id).map(|op| &mut op.kind)
    {
        *coalesced_width = Some(width);
    }
}

#[test]
fn test_pinned_width_is_honored() {
    let caps = TargetCaps::sm80();
    let (mut kernel, id) = pinned_copy(4);
    let op = kernel.find_op(id).unwrap();
    // a pinned copy never goes through the bulk engine
    assert_eq!(
        select(op, &kernel, &caps).unwrap(),
        Some(Strategy::Vector { width: 4 })
    );

    set_width(&mut kernel, id, 1);
    let op = kernel.find_op(id).unwrap();
    assert_eq!(select(op, &kernel, &caps).unwrap(), Some(Strategy::Scalar));
}

#[test]
fn test_pinned_width_must_divide_extent() {
    let caps = TargetCaps::sm80();
    let (mut kernel, id) = pinned_copy(4);
    set_width(&mut kernel, id, 3);
    let op = kernel.find_op(id).unwrap();
    let SelectionError::LayoutMismatch { op: at, constraint, .. } =
        select(op, &kernel, &caps).unwrap_err();
    assert_eq!(at, id);
    assert!(constraint.contains("innermost extent 64"), "{}", constraint);

    set_width(&mut kernel, id, 0);
    let op = kernel.find_op(id).unwrap();
    let SelectionError::LayoutMismatch { constraint, .. } =
        select(op, &kernel, &caps).unwrap_err();
    assert_eq!(constraint, "a non-zero coalesced width");
}

#[test]
fn test_strided_parallel_is_scalar() {
    let caps = TargetCaps::sm80();
    let mut b = KernelBuilder::new("transpose").threads(&[64]);
    let x = b.alloc_fragment("x", &[8, 8], DType::F32);
    let y = b.alloc_fragment("y", &[8, 8], DType::F32);
    b.clear(x);
    let assign = Assign {
        dst: Access {
            tile: y,
            indices: vec![pvar(0), pvar(1)],
        },
        value: Expr::binary(
            BinaryOp::Add,
            Expr::load(x, vec![pvar(0), pvar(1)]),
            Expr::load(x, vec![pvar(1), pvar(0)]),
        ),
    };
    let id = b.parallel(&[8, 8], vec![assign]);
    let kernel = infer(b.build(), &caps).unwrap().kernel;
    let op = kernel.find_op(id).unwrap();
    assert_eq!(select(op, &kernel, &caps).unwrap(), Some(Strategy::Scalar));
}
