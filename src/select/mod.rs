//! Instruction selection.
//!
//! Picks, per op, the hardware path that realizes it, first applicable
//! wins:
//!
//! 1. gemm bound to a matrix instruction of the target
//! 2. global ↔ shared copy large and contiguous enough for the bulk engine
//! 3. vector accesses sized to the element type and the layouts' runs
//! 4. scalar
//!
//! Selection only annotates ops. A choice the resolved layouts cannot
//! honor is a `LayoutMismatch`.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SelectionError;
use crate::ir::{Affine, Kernel, Op, OpId, OpKind, Region, Scope, Tile, TileId};
use crate::layout::fragment::bind_gemm;
use crate::layout::swizzle::CHUNK_BYTES;
use crate::layout::{Layout, LayoutKind};
use crate::target::{BulkEngine, Role, TargetCaps};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Strategy {
    /// Asynchronous copy through the bulk-copy engine.
    BulkAsyncCopy { engine: BulkEngine, bytes: u64 },
    /// Each thread moves `width` contiguous elements per access.
    Vector { width: u32 },
    /// Tensor-core / matrix-core instruction tiled over a warp grid.
    MatrixInstruction {
        instruction: String,
        /// `[m, n, k]` of one instruction.
        shape: [u32; 3],
        warps: [u32; 2],
        /// Instructions per warp along m, n and k.
        repeats: [u32; 3],
    },
    Scalar,
}

impl Strategy {
    pub fn describe(&self) -> String {
        match self {
            Strategy::BulkAsyncCopy { engine, bytes } => {
                format!("bulk[{}, {}B]", engine.name(), bytes)
            }
            Strategy::Vector { width } => format!("vector[{}]", width),
            Strategy::MatrixInstruction {
                instruction,
                warps,
                repeats,
                ..
            } => format!(
                "mma[{}, warps {}x{}, repeats {}x{}x{}]",
                instruction, warps[0], warps[1], repeats[0], repeats[1], repeats[2]
            ),
            Strategy::Scalar => "scalar".to_string(),
        }
    }
}

/// Strategy for one op. Structural ops (`alloc`, pipelined loops) get none.
pub fn select(
    op: &Op,
    kernel: &Kernel,
    caps: &TargetCaps,
) -> Result<Option<Strategy>, SelectionError> {
    let strategy = match &op.kind {
        OpKind::Alloc { .. } | OpKind::Pipelined { .. } => return Ok(None),
        OpKind::Gemm { .. } => select_gemm(op, kernel, caps)?,
        OpKind::Copy {
            src,
            dst,
            coalesced_width,
        } => {
            let s = layout_of(op.id, kernel, src.tile)?;
            let d = layout_of(op.id, kernel, dst.tile)?;
            let tiles = [(src.tile, &s), (dst.tile, &d)];
            if coalesced_width.is_none() {
                let bulk = select_bulk(kernel, caps, (src, &s), (dst, &d));
                if let Some(bulk) = bulk {
                    return Ok(Some(bulk));
                }
            }
            let inner = dst.extents.last().copied().unwrap_or(1);
            match coalesced_width {
                Some(w) => pinned_width(op.id, kernel, *w, inner, &tiles)?,
                None => vector(kernel, caps, dst.tile, inner, &tiles),
            }
        }
        OpKind::Fill { tile, .. } => {
            let l = layout_of(op.id, kernel, *tile)?;
            let inner = kernel.tile(*tile).cols();
            vector(kernel, caps, *tile, inner, &[(*tile, &l)])
        }
        OpKind::Relayout { src, dst } => {
            let s = layout_of(op.id, kernel, *src)?;
            let d = layout_of(op.id, kernel, *dst)?;
            let inner = kernel.tile(*dst).cols();
            vector(kernel, caps, *dst, inner, &[(*src, &s), (*dst, &d)])
        }
        OpKind::Reduce { src, axis, .. } => {
            let s = layout_of(op.id, kernel, *src)?;
            let t = kernel.tile(*src);
            if *axis + 1 == t.shape.len() {
                vector(kernel, caps, *src, t.cols(), &[(*src, &s)])
            } else {
                Strategy::Scalar
            }
        }
        OpKind::Parallel {
            vars,
            extents,
            body,
        } => {
            let inner_var = vars.last().map(String::as_str).unwrap_or("");
            let inner = extents.last().copied().unwrap_or(1);
            let mut accesses = Vec::new();
            for assign in body {
                accesses.push((assign.dst.tile, assign.dst.indices.as_slice()));
                for load in assign.value.loads() {
                    accesses.push((load.tile, load.indices.as_slice()));
                }
            }
            if !accesses.iter().all(|(_, ix)| unit_stride(ix, inner_var)) {
                Strategy::Scalar
            } else {
                let mut layouts = Vec::new();
                for &(tile, _) in &accesses {
                    layouts.push((tile, layout_of(op.id, kernel, tile)?));
                }
                let tiles: Vec<(TileId, &Layout)> =
                    layouts.iter().map(|(t, l)| (*t, l)).collect();
                match accesses.first() {
                    Some(&(widest, _)) => vector(kernel, caps, widest, inner, &tiles),
                    None => Strategy::Scalar,
                }
            }
        }
    };
    Ok(Some(strategy))
}

/// Annotate every op of the kernel with its strategy.
pub fn select_kernel(mut kernel: Kernel, caps: &TargetCaps) -> Result<Kernel, SelectionError> {
    let mut chosen = Vec::new();
    for op in kernel.ops() {
        let strategy = select(op, &kernel, caps)?;
        if let Some(s) = &strategy {
            debug!("{} {}: {}", op.id, op.kind.mnemonic(), s.describe());
        }
        chosen.push((op.id, strategy));
    }
    let mut counts = [0usize; 4];
    for (id, strategy) in chosen {
        if let Some(s) = &strategy {
            counts[match s {
                Strategy::MatrixInstruction { .. } => 0,
                Strategy::BulkAsyncCopy { .. } => 1,
                Strategy::Vector { .. } => 2,
                Strategy::Scalar => 3,
            }] += 1;
        }
        if let Some(op) = kernel.find_op_mut(id) {
            op.strategy = strategy;
        }
    }
    info!(
        "selected strategies for {}: {} mma, {} bulk, {} vector, {} scalar",
        kernel.name, counts[0], counts[1], counts[2], counts[3]
    );
    Ok(kernel)
}

fn select_gemm(op: &Op, kernel: &Kernel, caps: &TargetCaps) -> Result<Strategy, SelectionError> {
    let OpKind::Gemm {
        a,
        b,
        c,
        transpose_a,
        transpose_b,
        ..
    } = &op.kind
    else {
        return Ok(Strategy::Scalar);
    };
    let binding = bind_gemm(kernel, &op.kind, caps).map_err(|e| SelectionError::LayoutMismatch {
        op: op.id,
        tile: e.tile().to_string(),
        constraint: e.to_string(),
    })?;
    let Some(binding) = binding else {
        return Ok(Strategy::Scalar);
    };
    for (tile, role, transposed) in [
        (*a, Role::A, *transpose_a),
        (*b, Role::B, *transpose_b),
        (*c, Role::C, false),
    ] {
        let layout = layout_of(op.id, kernel, tile)?;
        let t = kernel.tile(tile);
        let expected = binding.operand_layout(role, transposed);
        let ok = match (&layout.kind, t.scope) {
            (LayoutKind::Fragment(f), Scope::Fragment) => *f == expected,
            (LayoutKind::Fragment(_), _) | (_, Scope::Fragment) => false,
            _ => true,
        };
        if !ok {
            return Err(SelectionError::LayoutMismatch {
                op: op.id,
                tile: t.name.clone(),
                constraint: format!(
                    "operand {} layout {} of {} (found {})",
                    role.name(),
                    expected.describe(),
                    binding.sig.name,
                    layout.describe()
                ),
            });
        }
    }
    let sig = &binding.sig;
    Ok(Strategy::MatrixInstruction {
        instruction: sig.name.clone(),
        shape: [sig.m(), sig.n(), sig.k()],
        warps: binding.warps,
        repeats: binding.repeats(),
    })
}

/// Bulk copy between global and shared memory, when the engine can do it.
fn select_bulk(
    kernel: &Kernel,
    caps: &TargetCaps,
    (src, src_layout): (&Region, &Layout),
    (dst, dst_layout): (&Region, &Layout),
) -> Option<Strategy> {
    let bulk = caps.bulk_copy?;
    let (ts, td) = (kernel.tile(src.tile), kernel.tile(dst.tile));
    let eb = td.dtype.bytes();
    let (shared, layout, loading) = match (ts.scope, td.scope) {
        (Scope::Global, Scope::Shared) => (td, dst_layout, true),
        (Scope::Shared, Scope::Global) => (ts, src_layout, false),
        _ => return None,
    };
    let bytes = dst.numel() * eb as u64;
    // every row of the window on both sides moves in whole chunks
    let row_bytes = |r: &Region| {
        r.extents.last().copied().unwrap_or(1) * kernel.tile(r.tile).dtype.bytes()
    };
    let chunked = [row_bytes(src), row_bytes(dst), shared.cols() * eb]
        .iter()
        .all(|b| b % CHUNK_BYTES == 0);
    if !chunked || bytes < bulk.min_bytes {
        return None;
    }
    let tma_ready = matches!(layout.kind, LayoutKind::RowMajor)
        || matches!(&layout.kind, LayoutKind::Swizzled(s) if s.is_hardware_mode(eb));
    let engine = match bulk.engine {
        BulkEngine::Tma if tma_ready => BulkEngine::Tma,
        // per-thread async copies only load, and need whole 16-byte chunks
        _ if loading && layout.contiguous_run() * eb >= CHUNK_BYTES => BulkEngine::CpAsync,
        _ => return None,
    };
    Some(Strategy::BulkAsyncCopy { engine, bytes })
}

/// Widest power-of-two vector no wider than the element type's natural
/// width that divides `inner` and every layout's contiguous run.
fn vector(
    kernel: &Kernel,
    caps: &TargetCaps,
    widest: TileId,
    inner: u32,
    tiles: &[(TileId, &Layout)],
) -> Strategy {
    let mut width = caps.vector_elems(kernel.tile(widest).dtype).max(1);
    while width > 1 && !fits(width, inner, tiles) {
        width /= 2;
    }
    if width > 1 {
        Strategy::Vector { width }
    } else {
        Strategy::Scalar
    }
}

fn fits(width: u32, inner: u32, tiles: &[(TileId, &Layout)]) -> bool {
    inner % width == 0 && tiles.iter().all(|(_, l)| l.contiguous_run() % width == 0)
}

/// Honor an author-pinned width or fail.
fn pinned_width(
    op: OpId,
    kernel: &Kernel,
    width: u32,
    inner: u32,
    tiles: &[(TileId, &Layout)],
) -> Result<Strategy, SelectionError> {
    if width == 0 {
        return Err(SelectionError::LayoutMismatch {
            op,
            tile: kernel.tile(tiles[0].0).name.clone(),
            constraint: "a non-zero coalesced width".to_string(),
        });
    }
    if inner % width != 0 {
        return Err(SelectionError::LayoutMismatch {
            op,
            tile: kernel.tile(tiles[0].0).name.clone(),
            constraint: format!(
                "coalesced width {} dividing the innermost extent {}",
                width, inner
            ),
        });
    }
    if let Some((tile, layout)) = tiles.iter().find(|(_, l)| l.contiguous_run() % width != 0) {
        return Err(SelectionError::LayoutMismatch {
            op,
            tile: kernel.tile(*tile).name.clone(),
            constraint: format!(
                "coalesced width {} (layout {} has contiguous runs of {})",
                width,
                layout.describe(),
                layout.contiguous_run()
            ),
        });
    }
    Ok(if width == 1 {
        Strategy::Scalar
    } else {
        Strategy::Vector { width }
    })
}

fn layout_of(op: OpId, kernel: &Kernel, tile: TileId) -> Result<Layout, SelectionError> {
    let t: &Tile = kernel.tile(tile);
    match (&t.layout, t.scope) {
        (Some(l), _) => Ok(l.clone()),
        (None, Scope::Global) => Ok(Layout::row_major(&t.shape)),
        (None, _) => Err(SelectionError::LayoutMismatch {
            op,
            tile: t.name.clone(),
            constraint: "a resolved layout".to_string(),
        }),
    }
}

/// The innermost loop variable steps the last index by one and nothing else.
fn unit_stride(indices: &[Affine], var: &str) -> bool {
    let Some((last, rest)) = indices.split_last() else {
        return true;
    };
    last.coefficient(var) == 1 && rest.iter().all(|ix| !ix.depends_on(var))
}
