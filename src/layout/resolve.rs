use super::fragment::FragmentLayout;
use super::pattern::{conflict_degree, fit_vector, AccessPattern};
use super::swizzle::{Swizzle, CHUNK_BYTES};
use super::Layout;
use crate::error::LayoutError;
use crate::ir::{DType, Scope};
use crate::target::TargetCaps;

/// The tile a layout is being resolved for.
#[derive(Clone, Copy, Debug)]
pub struct LayoutRequest<'a> {
    pub tile: &'a str,
    pub shape: &'a [u32],
    pub dtype: DType,
    pub scope: Scope,
    /// Threads in the block; register layouts are dealt over them.
    pub threads: u32,
}

/// Pick a layout for a tile that satisfies every access pattern.
pub fn resolve(
    req: &LayoutRequest,
    patterns: &[AccessPattern],
    caps: &TargetCaps,
) -> Result<Layout, LayoutError> {
    if req.shape.is_empty() || req.shape.contains(&0) {
        return Err(LayoutError::DegenerateShape {
            tile: req.tile.to_string(),
            shape: req.shape.to_vec(),
        });
    }
    match req.scope {
        Scope::Global => Ok(Layout::row_major(req.shape)),
        Scope::Shared => resolve_shared(req, patterns, caps),
        Scope::Fragment => resolve_fragment(req, patterns),
    }
}

/// Shared-memory candidates, simplest first.
pub fn shared_candidates(shape: &[u32], dtype: DType) -> Vec<Layout> {
    let eb = dtype.bytes();
    let mut out = vec![Layout::row_major(shape)];
    for bytes in [32, 64, 128] {
        if let Some(s) = Swizzle::for_bytes(bytes, eb) {
            let l = Layout::swizzled(shape, s);
            if l.is_well_formed() {
                out.push(l);
            }
        }
    }
    // one bank word, then one 16-byte chunk
    for pad in [(4 / eb).max(1), (CHUNK_BYTES / eb).max(1)] {
        let l = Layout::padded(shape, pad);
        if !out.contains(&l) {
            out.push(l);
        }
    }
    out
}

fn resolve_shared(
    req: &LayoutRequest,
    patterns: &[AccessPattern],
    caps: &TargetCaps,
) -> Result<Layout, LayoutError> {
    let eb = req.dtype.bytes();
    let mut best: Option<(Layout, u32)> = None;
    let mut conflict_free = Vec::new();
    for candidate in shared_candidates(req.shape, req.dtype) {
        let degree = patterns
            .iter()
            .map(|p| conflict_degree(&candidate, p, eb, caps))
            .max()
            .unwrap_or(0);
        if degree <= 1 {
            conflict_free.push(candidate);
        } else if best.as_ref().map_or(true, |(_, d)| degree < *d) {
            best = Some((candidate, degree));
        }
    }

    let chosen = conflict_free
        .iter()
        .find(|l| l.is_bulk_copy_compatible(eb, caps))
        .or_else(|| conflict_free.first())
        .cloned();

    match chosen {
        Some(layout) => {
            tracing::debug!("tile '{}': shared layout {}", req.tile, layout.describe());
            Ok(layout)
        }
        None => {
            let (best, degree) = best
                .map(|(l, d)| (l.describe(), d))
                .unwrap_or_else(|| ("none".to_string(), 0));
            Err(LayoutError::NoConflictFree {
                tile: req.tile.to_string(),
                patterns: patterns.iter().map(|p| p.describe()).collect(),
                best,
                degree,
            })
        }
    }
}

fn resolve_fragment(
    req: &LayoutRequest,
    patterns: &[AccessPattern],
) -> Result<Layout, LayoutError> {
    let mut exact: Option<&FragmentLayout> = None;
    let mut widest = 1;
    for p in patterns {
        match p {
            AccessPattern::Operand(f) => match exact {
                Some(prev) if prev != f => {
                    return Err(LayoutError::ConflictingFragments {
                        tile: req.tile.to_string(),
                        first: prev.describe(),
                        second: f.describe(),
                    });
                }
                _ => exact = Some(f),
            },
            AccessPattern::RowMajor { vector } => widest = widest.max(*vector),
            AccessPattern::ColumnMajor => {}
        }
    }

    let layout = match exact {
        Some(f) => Layout::fragment(req.shape, f.clone()),
        None => {
            let cols = req.shape.last().copied().unwrap_or(1);
            Layout::fragment(
                req.shape,
                FragmentLayout::Striped {
                    threads: req.threads.max(1),
                    vector: fit_vector(widest, cols),
                },
            )
        }
    };
    if !layout.is_well_formed() {
        return Err(LayoutError::IncompatibleFragmentShape {
            tile: req.tile.to_string(),
            shape: req.shape.to_vec(),
            instruction: layout.describe(),
            reason: "the fragment grid does not tile the shape".to_string(),
        });
    }
    tracing::debug!("tile '{}': fragment layout {}", req.tile, layout.describe());
    Ok(layout)
}
