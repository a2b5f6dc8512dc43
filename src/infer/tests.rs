use std::collections::HashSet;

use super::*;
use crate::ir::builder::{pvar, KernelBuilder};
use crate::ir::{Access, Affine, Assign, DType, Expr};
use crate::kernels::{matmul, MatmulConfig};
use crate::layout::{Atom, FragmentLayout, Swizzle};
use crate::target::BUILTIN_TARGETS;

fn small_matmul() -> Kernel {
    matmul(&MatmulConfig {
        m: 256,
        n: 256,
        k: 128,
        ..MatmulConfig::default()
    })
}

fn layout_of<'a>(kernel: &'a Kernel, name: &str) -> &'a Layout {
    let id = kernel.find_tile(name).unwrap();
    kernel.tile(id).layout.as_ref().unwrap()
}

#[test]
fn test_matmul_layouts_sm80() {
    let caps = TargetCaps::sm80();
    let out = infer(small_matmul(), &caps).unwrap();
    assert!(out.relayouts.is_empty());
    assert!(out.diagnostics.is_empty());
    assert!(out.kernel.tiles.iter().all(|t| t.layout.is_some()));

    let a = layout_of(&out.kernel, "A_shared");
    assert_eq!(a.kind, LayoutKind::Swizzled(Swizzle::new(2, 3, 3)));
    assert_eq!(layout_of(&out.kernel, "B_shared"), a);
    assert_eq!(layout_of(&out.kernel, "A").kind, LayoutKind::RowMajor);

    let c = layout_of(&out.kernel, "C_local");
    assert_eq!(
        c.kind,
        LayoutKind::Fragment(FragmentLayout::Operand {
            atom: Atom::MmaC,
            warps: [2, 2],
            replicas: 1,
            transposed: false,
        })
    );
    assert!(c.is_injective());
}

#[test]
fn test_matmul_shared_tiles_are_conflict_free() {
    let caps = TargetCaps::sm80();
    let out = infer(small_matmul(), &caps).unwrap();
    let a = layout_of(&out.kernel, "A_shared");
    let operand = AccessPattern::Operand(FragmentLayout::Operand {
        atom: Atom::MmaA { pack: 2 },
        warps: [2, 1],
        replicas: 2,
        transposed: false,
    });
    assert_eq!(conflict_degree(a, &operand, 2, &caps), 1);
    assert_eq!(
        conflict_degree(a, &AccessPattern::RowMajor { vector: 8 }, 2, &caps),
        1
    );
}

#[test]
fn test_matmul_infers_on_every_target() {
    for name in BUILTIN_TARGETS {
        let caps = TargetCaps::builtin(name).unwrap();
        let out = infer(small_matmul(), &caps).unwrap();
        assert!(out.relayouts.is_empty(), "{}", name);
        for tile in &out.kernel.tiles {
            let layout = tile.layout.as_ref().unwrap();
            assert!(layout.is_injective(), "{} on {}", tile.name, name);
        }
    }
}

#[test]
fn test_amd_accumulator_uses_mfma() {
    let out = infer(small_matmul(), &TargetCaps::gfx90a()).unwrap();
    let c = layout_of(&out.kernel, "C_local");
    assert_eq!(
        c.kind,
        LayoutKind::Fragment(FragmentLayout::Operand {
            atom: Atom::MfmaC { m: 16, n: 16 },
            warps: [2, 1],
            replicas: 1,
            transposed: false,
        })
    );
}

#[test]
fn test_scalar_gemm_gets_striped_accumulator() {
    let out = infer(small_matmul(), &TargetCaps::sm70()).unwrap();
    let c = layout_of(&out.kernel, "C_local");
    assert_eq!(
        c.kind,
        LayoutKind::Fragment(FragmentLayout::Striped {
            threads: 128,
            vector: 1
        })
    );
}

/// A coalesced copy into a register tile that a gemm reads as operand A.
fn coalesced_operand_kernel() -> (Kernel, OpId, OpId) {
    let mut b = KernelBuilder::new("relayout").threads(&[128]);
    let a = b.global("A", &[64, 32], DType::F16);
    let bg = b.global("B", &[32, 64], DType::F16);
    let a_local = b.alloc_fragment("A_local", &[64, 32], DType::F16);
    let b_shared = b.alloc_shared("B_shared", &[32, 64], DType::F16);
    let c_local = b.alloc_fragment("C_local", &[64, 64], DType::F32);
    let src = b.full(a);
    let dst = b.full(a_local);
    let copy = b.copy_coalesced(src, dst, 8);
    let src = b.full(bg);
    let dst = b.full(b_shared);
    b.copy(src, dst);
    b.clear(c_local);
    let gemm = b.gemm(a_local, b_shared, c_local);
    (b.build(), copy, gemm)
}

#[test]
fn test_coalesced_copy_into_operand_inserts_one_relayout() {
    let (kernel, copy, gemm) = coalesced_operand_kernel();
    let out = infer(kernel, &TargetCaps::sm80()).unwrap();
    assert_eq!(out.relayouts.len(), 1);

    let record = &out.relayouts[0];
    assert_eq!(record.serves, copy);
    assert_eq!(out.kernel.tile(record.src).name, "A_local_relayout0");
    assert_eq!(out.kernel.tile(record.dst).name, "A_local");

    let twin = out.kernel.tile(record.src).layout.as_ref().unwrap();
    assert_eq!(
        twin.kind,
        LayoutKind::Fragment(FragmentLayout::Striped {
            threads: 128,
            vector: 8
        })
    );

    // copy writes the twin, the relayout follows it, the gemm is untouched
    let order: Vec<OpId> = out.kernel.body.iter().map(|op| op.id).collect();
    let at = |id: OpId| order.iter().position(|o| *o == id).unwrap();
    assert_eq!(at(record.op), at(copy) + 1);
    assert!(at(record.op) < at(gemm));
    let copy_op = out.kernel.find_op(copy).unwrap();
    assert!(visit::writes(&copy_op.kind).contains(&record.src));
    let gemm_op = out.kernel.find_op(gemm).unwrap();
    assert!(visit::reads(&gemm_op.kind).contains(&record.dst));

    // the primary tile keeps exactly the operand layout the gemm binds
    let binding = bind_gemm(&out.kernel, &gemm_op.kind, &TargetCaps::sm80())
        .unwrap()
        .unwrap();
    assert_eq!(
        layout_of(&out.kernel, "A_local").kind,
        LayoutKind::Fragment(binding.operand_layout(Role::A, false))
    );

    assert!(out
        .diagnostics
        .iter()
        .any(|d| !d.is_error() && d.message.contains("inserted relayout")));
}

#[test]
fn test_shared_tile_split_between_conflicting_readers() {
    let mut b = KernelBuilder::new("split").threads(&[128]);
    let g = b.global("G", &[64, 32], DType::F16);
    let s = b.alloc_shared("S", &[64, 32], DType::F16);
    let bs = b.alloc_shared("B_shared", &[32, 64], DType::F16);
    let c = b.alloc_fragment("C", &[64, 64], DType::F32);
    let t = b.alloc_fragment("T", &[32, 64], DType::F16);
    let src = b.full(g);
    let dst = b.full(s);
    b.copy(src, dst);
    b.clear(c);
    b.gemm(s, bs, c);
    // transposed read: lanes walk a column of S
    let transposed = Assign {
        dst: Access {
            tile: t,
            indices: vec![pvar(0), pvar(1)],
        },
        value: Expr::load(s, vec![pvar(1), pvar(0)]),
    };
    let par = b.parallel(&[32, 64], vec![transposed]);
    let out = infer(b.build(), &TargetCaps::sm80()).unwrap();

    assert_eq!(layout_of(&out.kernel, "S").describe(), "swizzle<2,3,3>");
    assert_eq!(out.relayouts.len(), 1);
    let record = &out.relayouts[0];
    assert_eq!(record.serves, par);
    assert_eq!(out.kernel.tile(record.src).name, "S");
    let twin = out.kernel.tile(record.dst);
    assert_eq!(twin.name, "S_relayout0");
    assert_eq!(twin.layout.as_ref().unwrap().kind, LayoutKind::Padded { pad: 2 });
}

#[test]
fn test_reduce_over_rows_pads_shared_tile() {
    let mut b = KernelBuilder::new("rowsum").threads(&[128]);
    let x = b.global("X", &[32, 32], DType::F32);
    let s = b.alloc_shared("S", &[32, 32], DType::F32);
    let r = b.alloc_fragment("R", &[32], DType::F32);
    let src = b.full(x);
    let dst = b.full(s);
    b.copy(src, dst);
    b.reduce(s, r, 1, crate::ir::ReduceKind::Sum, true);
    let out = infer(b.build(), &TargetCaps::sm80()).unwrap();
    assert_eq!(layout_of(&out.kernel, "S").kind, LayoutKind::Padded { pad: 1 });
    assert!(layout_of(&out.kernel, "R").is_fragment());
    assert!(out.relayouts.is_empty());
}

#[test]
fn test_unused_on_chip_tile_is_an_error() {
    let mut b = KernelBuilder::new("unused");
    let g = b.global("G", &[16, 16], DType::F32);
    let f = b.alloc_fragment("F", &[16, 16], DType::F32);
    b.alloc_shared("orphan", &[16, 16], DType::F32);
    let src = b.full(g);
    let dst = b.full(f);
    b.copy(src, dst);
    let err = infer(b.build(), &TargetCaps::sm80()).unwrap_err();
    assert_eq!(
        err,
        InferenceError::NoAccessPattern {
            tile: "orphan".to_string()
        }
    );
}

#[test]
fn test_unused_global_tile_warns() {
    let mut b = KernelBuilder::new("unused");
    let g = b.global("G", &[16, 16], DType::F32);
    b.global("spare", &[16, 16], DType::F32);
    let f = b.alloc_fragment("F", &[16, 16], DType::F32);
    let src = b.full(g);
    let dst = b.full(f);
    b.copy(src, dst);
    let out = infer(b.build(), &TargetCaps::sm80()).unwrap();
    assert_eq!(out.diagnostics.len(), 1);
    assert!(out.diagnostics[0].message.contains("'spare'"));
    assert_eq!(layout_of(&out.kernel, "spare").kind, LayoutKind::RowMajor);
}

#[test]
fn test_unknown_tile_reference() {
    let mut kernel = Kernel::new("broken");
    let id = kernel.fresh_op_id();
    kernel.body.push(Op::new(
        id,
        OpKind::Fill {
            tile: TileId(7),
            value: 0.0,
        },
    ));
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert_eq!(err, InferenceError::UnknownTile { op: id, tile: 7 });
}

#[test]
fn test_declared_layout_is_kept_with_conflict_warning() {
    let mut kernel = small_matmul();
    let a = kernel.find_tile("A_shared").unwrap();
    kernel.tile_mut(a).declared = Some(Layout::row_major(&[128, 32]));
    let out = infer(kernel, &TargetCaps::sm80()).unwrap();
    assert_eq!(layout_of(&out.kernel, "A_shared").kind, LayoutKind::RowMajor);
    let warning = out
        .diagnostics
        .iter()
        .find(|d| d.message.contains("bank conflicts"))
        .unwrap();
    assert!(warning.message.contains("4-way"));
    assert_eq!(warning.site, Site::Tile("A_shared".to_string()));
}

#[test]
fn test_declared_layout_shape_mismatch() {
    let mut kernel = small_matmul();
    let a = kernel.find_tile("A_shared").unwrap();
    kernel.tile_mut(a).declared = Some(Layout::row_major(&[64, 32]));
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(matches!(
        err,
        InferenceError::Layout(LayoutError::InvalidDeclaredLayout { ref tile, .. }) if tile == "A_shared"
    ));
}

#[test]
fn test_declared_layout_rejects_non_bijective_swizzle() {
    let mut kernel = small_matmul();
    let a = kernel.find_tile("A_shared").unwrap();
    // shift narrower than the field: source and target bits overlap
    kernel.tile_mut(a).declared = Some(Layout::swizzled(&[128, 32], Swizzle::new(3, 3, 2)));
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(err.to_string().contains("maps two elements"));
}

#[test]
fn test_declared_fragment_on_shared_tile() {
    let mut kernel = small_matmul();
    let a = kernel.find_tile("A_shared").unwrap();
    kernel.tile_mut(a).declared = Some(Layout::fragment(
        &[128, 32],
        FragmentLayout::Striped {
            threads: 128,
            vector: 8,
        },
    ));
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(err.to_string().contains("cannot describe a shared tile"));
}

#[test]
fn test_declared_global_must_be_row_major() {
    let mut kernel = small_matmul();
    let a = kernel.find_tile("A").unwrap();
    kernel.tile_mut(a).declared = Some(Layout::padded(&[256, 128], 8));
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert!(err.to_string().contains("row-major"));
}

#[test]
fn test_declared_striped_accumulator_is_relayouted_around_gemm() {
    let mut kernel = small_matmul();
    let c = kernel.find_tile("C_local").unwrap();
    kernel.tile_mut(c).declared = Some(Layout::fragment(
        &[128, 128],
        FragmentLayout::Striped {
            threads: 128,
            vector: 4,
        },
    ));
    let out = infer(kernel, &TargetCaps::sm80()).unwrap();
    assert_eq!(out.relayouts.len(), 2);
    assert_eq!(out.relayouts[0].serves, out.relayouts[1].serves);
    assert_eq!(out.relayouts[0].src, c);
    assert_eq!(out.relayouts[1].dst, c);
    let twin = out.kernel.tile(out.relayouts[0].dst);
    assert!(matches!(
        twin.layout.as_ref().unwrap().kind,
        LayoutKind::Fragment(FragmentLayout::Operand { atom: Atom::MmaC, .. })
    ));

    // both relayouts sit in the loop body around the gemm
    let body = out
        .kernel
        .body
        .iter()
        .find_map(|op| match &op.kind {
            OpKind::Pipelined { body, .. } => Some(body),
            _ => None,
        })
        .unwrap();
    let names: Vec<&str> = body.iter().map(|op| op.kind.mnemonic()).collect();
    assert_eq!(names, vec!["copy", "copy", "relayout", "gemm", "relayout"]);
}

/// Serialize a kernel, drop `next_op` the way a hand-written file would.
fn without_next_op(kernel: &Kernel) -> Kernel {
    let mut value = serde_json::to_value(kernel).unwrap();
    value.as_object_mut().unwrap().remove("next_op");
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_kernel_without_next_op_gets_fresh_relayout_ids() {
    let (kernel, _, _) = coalesced_operand_kernel();
    let loaded = without_next_op(&kernel);
    assert_eq!(loaded.next_op, 0);

    let out = infer(loaded, &TargetCaps::sm80()).unwrap();
    let ids: Vec<OpId> = out.kernel.ops().iter().map(|op| op.id).collect();
    let unique: HashSet<OpId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    let relayout = out.relayouts[0].op;
    assert!(kernel.find_op(relayout).is_none());
    assert!(out.kernel.next_op > relayout.0);
}

#[test]
fn test_duplicate_op_ids_rejected() {
    let mut kernel = Kernel::new("twice");
    let f = kernel.add_tile(Tile::new("F", vec![16, 16], DType::F32, Scope::Fragment));
    let id = kernel.fresh_op_id();
    for _ in 0..2 {
        kernel
            .body
            .push(Op::new(id, OpKind::Fill { tile: f, value: 0.0 }));
    }
    let err = infer(kernel, &TargetCaps::sm80()).unwrap_err();
    assert_eq!(err, InferenceError::DuplicateOpId { op: id });
}

fn shape_error(kernel: Kernel, caps: &TargetCaps) -> (OpId, String, String) {
    match infer(kernel, caps).unwrap_err() {
        InferenceError::ShapeMismatch { op, tile, reason } => (op, tile, reason),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_copy_extents_must_agree() {
    let mut b = KernelBuilder::new("reshape").threads(&[128]);
    let g = b.global("G", &[4, 32], DType::F32);
    let x = b.alloc_fragment("X", &[4, 8, 2], DType::F32);
    let src = b.region(g, vec![Affine::constant(0); 2], &[1, 32]);
    let dst = b.full(x);
    let copy = b.copy(src, dst);
    let (op, tile, reason) = shape_error(b.build(), &TargetCaps::sm80());
    assert_eq!((op, tile.as_str()), (copy, "X"));
    assert!(reason.contains("[1, 32]"), "{}", reason);
}

#[test]
fn test_region_rank_must_match_tile() {
    let mut b = KernelBuilder::new("rank").threads(&[128]);
    let g = b.global("G", &[4, 32], DType::F32);
    let x = b.alloc_fragment("X", &[32], DType::F32);
    let src = b.region(g, vec![Affine::constant(0)], &[32]);
    let dst = b.full(x);
    let copy = b.copy(src, dst);
    let (op, tile, reason) = shape_error(b.build(), &TargetCaps::sm80());
    assert_eq!((op, tile.as_str()), (copy, "G"));
    assert!(reason.contains("rank 1 on a tile of rank 2"), "{}", reason);
}

#[test]
fn test_gemm_dims_checked_without_matrix_instruction() {
    let mut b = KernelBuilder::new("bad_gemm").threads(&[128]);
    let a = b.alloc_shared("A", &[64, 32], DType::F16);
    let bt = b.alloc_shared("B", &[48, 64], DType::F16);
    let c = b.alloc_fragment("C", &[16, 16], DType::F32);
    b.clear(a);
    b.clear(bt);
    b.clear(c);
    let gemm = b.gemm(a, bt, c);
    let (op, tile, reason) = shape_error(b.build(), &TargetCaps::sm70());
    assert_eq!((op, tile.as_str()), (gemm, "C"));
    assert!(reason.contains("cannot produce [16, 16]"), "{}", reason);
}

#[test]
fn test_reduce_axis_out_of_range() {
    let mut b = KernelBuilder::new("axis").threads(&[128]);
    let s = b.alloc_shared("S", &[32, 32], DType::F32);
    let r = b.alloc_fragment("R", &[32], DType::F32);
    b.clear(s);
    let reduce = b.reduce(s, r, 2, crate::ir::ReduceKind::Max, true);
    let (op, tile, reason) = shape_error(b.build(), &TargetCaps::sm80());
    assert_eq!((op, tile.as_str()), (reduce, "S"));
    assert!(reason.contains("axis 2"), "{}", reason);
}

#[test]
fn test_reduce_output_shape_must_drop_the_axis() {
    let mut b = KernelBuilder::new("rowsum").threads(&[128]);
    let s = b.alloc_shared("S", &[32, 64], DType::F32);
    let r = b.alloc_fragment("R", &[64], DType::F32);
    b.clear(s);
    let reduce = b.reduce(s, r, 1, crate::ir::ReduceKind::Sum, true);
    let (op, tile, reason) = shape_error(b.build(), &TargetCaps::sm80());
    assert_eq!((op, tile.as_str()), (reduce, "R"));
    assert!(reason.contains("yields [32], not [64]"), "{}", reason);
}
