//! Walking op trees and computing which tiles an op touches.

use super::{Op, OpId, OpKind, TileId};

/// Pre-order walk over `body`, descending into loop bodies.
pub fn walk<'a>(body: &'a [Op], f: &mut impl FnMut(&'a Op)) {
    for op in body {
        f(op);
        if let OpKind::Pipelined { body, .. } = &op.kind {
            walk(body, f);
        }
    }
}

pub fn walk_mut(body: &mut [Op], f: &mut impl FnMut(&mut Op)) {
    for op in body {
        f(op);
        if let OpKind::Pipelined { body, .. } = &mut op.kind {
            walk_mut(body, f);
        }
    }
}

pub fn find_op(body: &[Op], id: OpId) -> Option<&Op> {
    for op in body {
        if op.id == id {
            return Some(op);
        }
        if let OpKind::Pipelined { body, .. } = &op.kind {
            if let Some(found) = find_op(body, id) {
                return Some(found);
            }
        }
    }
    None
}

pub fn find_op_mut(body: &mut [Op], id: OpId) -> Option<&mut Op> {
    for op in body {
        if op.id == id {
            return Some(op);
        }
        if let OpKind::Pipelined { body, .. } = &mut op.kind {
            if let Some(found) = find_op_mut(body, id) {
                return Some(found);
            }
        }
    }
    None
}

/// Tiles read by the op. A loop reads everything its body reads.
pub fn reads(kind: &OpKind) -> Vec<TileId> {
    let mut out = Vec::new();
    match kind {
        OpKind::Alloc { .. } | OpKind::Fill { .. } => {}
        OpKind::Copy { src, .. } => out.push(src.tile),
        OpKind::Parallel { body, .. } => {
            for assign in body {
                for load in assign.value.loads() {
                    out.push(load.tile);
                }
            }
        }
        OpKind::Gemm {
            a, b, c, clear_accum, ..
        } => {
            out.push(*a);
            out.push(*b);
            if !clear_accum {
                out.push(*c);
            }
        }
        OpKind::Reduce {
            src, dst, clear, ..
        } => {
            out.push(*src);
            if !clear {
                out.push(*dst);
            }
        }
        OpKind::Pipelined { body, .. } => {
            for op in body {
                out.extend(reads(&op.kind));
            }
        }
        OpKind::Relayout { src, .. } => out.push(*src),
    }
    dedup(out)
}

/// Tiles written by the op.
pub fn writes(kind: &OpKind) -> Vec<TileId> {
    let mut out = Vec::new();
    match kind {
        OpKind::Alloc { .. } => {}
        OpKind::Copy { dst, .. } => out.push(dst.tile),
        OpKind::Fill { tile, .. } => out.push(*tile),
        OpKind::Parallel { body, .. } => out.extend(body.iter().map(|a| a.dst.tile)),
        OpKind::Gemm { c, .. } => out.push(*c),
        OpKind::Reduce { dst, .. } => out.push(*dst),
        OpKind::Pipelined { body, .. } => {
            for op in body {
                out.extend(writes(&op.kind));
            }
        }
        OpKind::Relayout { dst, .. } => out.push(*dst),
    }
    dedup(out)
}

/// Tiles the op overwrites completely, so no earlier value survives it.
pub fn defines(kind: &OpKind, shape_of: impl Fn(TileId) -> Vec<u32>) -> Vec<TileId> {
    match kind {
        OpKind::Copy { dst, .. } if dst.covers(&shape_of(dst.tile)) => vec![dst.tile],
        OpKind::Fill { tile, .. } => vec![*tile],
        OpKind::Gemm {
            c,
            clear_accum: true,
            ..
        } => vec![*c],
        OpKind::Reduce {
            dst, clear: true, ..
        } => vec![*dst],
        OpKind::Relayout { dst, .. } => vec![*dst],
        _ => Vec::new(),
    }
}

/// Every tile the op mentions, alloc targets included.
pub fn mentions(kind: &OpKind) -> Vec<TileId> {
    let mut out = reads(kind);
    out.extend(writes(kind));
    if let OpKind::Alloc { tile } = kind {
        out.push(*tile);
    }
    dedup(out)
}

/// Replace every reference to `from` with `to` in a non-structural op.
pub fn replace_tile(kind: &mut OpKind, from: TileId, to: TileId) {
    let swap = |t: &mut TileId| {
        if *t == from {
            *t = to;
        }
    };
    match kind {
        OpKind::Alloc { tile } | OpKind::Fill { tile, .. } => swap(tile),
        OpKind::Copy { src, dst, .. } => {
            swap(&mut src.tile);
            swap(&mut dst.tile);
        }
        OpKind::Parallel { body, .. } => {
            for assign in body {
                swap(&mut assign.dst.tile);
                for load in assign.value.loads_mut() {
                    swap(&mut load.tile);
                }
            }
        }
        OpKind::Gemm { a, b, c, .. } => {
            swap(a);
            swap(b);
            swap(c);
        }
        OpKind::Reduce { src, dst, .. } | OpKind::Relayout { src, dst } => {
            swap(src);
            swap(dst);
        }
        OpKind::Pipelined { .. } => {}
    }
}

fn dedup(mut v: Vec<TileId>) -> Vec<TileId> {
    let mut seen = Vec::with_capacity(v.len());
    v.retain(|t| {
        if seen.contains(t) {
            false
        } else {
            seen.push(*t);
            true
        }
    });
    v
}
