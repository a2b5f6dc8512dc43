//! Layout inference.
//!
//! Every operation that touches a tile exerts a demand on its layout. The
//! demands on one tile are resolved together when they agree. When they
//! cannot be met by a single layout, the tile keeps the layout that serves
//! most uses and every other use is redirected to a twin tile holding the
//! alternative layout, with an explicit `Relayout` op between them:
//!
//! ```text
//!   copy  G -> X            copy  G -> X'          (X' striped, vectorized)
//!   gemm  X, B, C     ==>   relayout X' -> X       (inserted, warned)
//!                           gemm  X, B, C          (X in operand layout)
//! ```

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::diagnostic::Diagnostic;
use crate::error::{InferenceError, LayoutError};
use crate::ir::{visit, Access, Kernel, Op, OpId, OpKind, Region, Scope, Tile, TileId};
use crate::layout::fragment::{bind_gemm, gemm_dims};
use crate::layout::{conflict_degree, resolve, AccessPattern, Layout, LayoutKind, LayoutRequest};
use crate::span::Site;
use crate::target::{Role, TargetCaps};

/// Result of inference: the annotated kernel plus what was changed.
#[derive(Clone, Debug)]
pub struct Inferred {
    pub kernel: Kernel,
    /// Warnings (inserted relayouts, accepted bank conflicts, unused tiles).
    pub diagnostics: Vec<Diagnostic>,
    pub relayouts: Vec<RelayoutRecord>,
}

/// One inserted `Relayout` op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayoutRecord {
    /// The inserted op.
    pub op: OpId,
    /// The op it serves.
    pub serves: OpId,
    pub src: TileId,
    pub dst: TileId,
}

/// How one op wants to see a tile.
#[derive(Clone, Debug, PartialEq)]
enum Demand {
    /// A traversal pattern (shared tiles) or an exact fragment (register tiles).
    Pattern(AccessPattern),
    /// Register tile accessed `n` elements at a time.
    Vector(u32),
    /// Anything works.
    Free,
}

#[derive(Clone, Debug)]
struct Use {
    op: OpId,
    tile: TileId,
    read: bool,
    write: bool,
    demand: Demand,
}

/// Ops that must see a tile through a twin with a different layout.
struct Redirect {
    from: TileId,
    to: TileId,
    read: bool,
    write: bool,
}

pub fn infer(mut kernel: Kernel, caps: &TargetCaps) -> Result<Inferred, InferenceError> {
    check_references(&kernel)?;
    reserve_op_ids(&mut kernel)?;
    check_shapes(&kernel)?;

    let uses = collect_uses(&kernel, caps)?;
    let mut by_tile: BTreeMap<TileId, Vec<&Use>> = BTreeMap::new();
    for u in &uses {
        by_tile.entry(u.tile).or_default().push(u);
    }

    let mut diagnostics = Vec::new();
    let mut redirects: HashMap<OpId, Vec<Redirect>> = HashMap::new();
    let original_tiles = kernel.tiles.len();

    for index in 0..original_tiles {
        let id = TileId(index as u32);
        let tile_uses = by_tile.get(&id).cloned().unwrap_or_default();
        let tile = kernel.tile(id).clone();

        if tile_uses.is_empty() {
            if tile.scope == Scope::Global {
                diagnostics.push(Diagnostic::warning(
                    format!("global tile '{}' is never used", tile.name),
                    Site::Tile(tile.name.clone()),
                ));
                kernel.tile_mut(id).layout = Some(Layout::row_major(&tile.shape));
                continue;
            }
            return Err(InferenceError::NoAccessPattern { tile: tile.name });
        }

        let plan = plan_tile(&kernel, &tile, &tile_uses, caps, &mut diagnostics)?;
        kernel.tile_mut(id).layout = Some(plan.primary);

        for (n, (layout, ops)) in plan.twins.into_iter().enumerate() {
            let mut twin = Tile::new(
                format!("{}_relayout{}", tile.name, n),
                tile.shape.clone(),
                tile.dtype,
                tile.scope,
            );
            twin.layout = Some(layout);
            let twin_id = kernel.add_tile(twin);
            for op in ops {
                let (read, write) = tile_uses
                    .iter()
                    .filter(|u| u.op == op)
                    .fold((false, false), |(r, w), u| (r || u.read, w || u.write));
                redirects.entry(op).or_default().push(Redirect {
                    from: id,
                    to: twin_id,
                    read,
                    write,
                });
            }
        }
    }

    let mut relayouts = Vec::new();
    if !redirects.is_empty() {
        let mut body = std::mem::take(&mut kernel.body);
        let mut next = kernel.next_op;
        splice(&mut body, &redirects, &mut next, &mut relayouts);
        kernel.body = body;
        kernel.next_op = next;
    }

    for r in &relayouts {
        let src = kernel.tile(r.src);
        let dst = kernel.tile(r.dst);
        let describe = |t: &Tile| {
            t.layout
                .as_ref()
                .map(|l| l.describe())
                .unwrap_or_else(|| "?".to_string())
        };
        tracing::info!(
            "inserted relayout {} '{}' -> '{}' for op {}",
            r.op,
            src.name,
            dst.name,
            r.serves
        );
        diagnostics.push(
            Diagnostic::warning(
                format!(
                    "inserted relayout {} from '{}' to '{}' for op {}",
                    r.op, src.name, dst.name, r.serves
                ),
                Site::Op(r.op),
            )
            .with_note(format!("{} -> {}", describe(src), describe(dst))),
        );
    }

    Ok(Inferred {
        kernel,
        diagnostics,
        relayouts,
    })
}

fn check_references(kernel: &Kernel) -> Result<(), InferenceError> {
    let mut bad = None;
    visit::walk(&kernel.body, &mut |op: &Op| {
        if bad.is_some() {
            return;
        }
        if let Some(t) = visit::mentions(&op.kind)
            .into_iter()
            .find(|t| kernel.get_tile(*t).is_none())
        {
            bad = Some(InferenceError::UnknownTile { op: op.id, tile: t.0 });
        }
    });
    match bad {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Reject repeated op ids and move `next_op` past every id in use, so ops
/// inserted later never collide with ones read from a file.
fn reserve_op_ids(kernel: &mut Kernel) -> Result<(), InferenceError> {
    let mut seen = HashSet::new();
    for op in kernel.ops() {
        if !seen.insert(op.id) {
            return Err(InferenceError::DuplicateOpId { op: op.id });
        }
    }
    if let Some(max) = seen.iter().map(|id| id.0).max() {
        kernel.next_op = kernel.next_op.max(max + 1);
    }
    Ok(())
}

fn check_shapes(kernel: &Kernel) -> Result<(), InferenceError> {
    for op in kernel.ops() {
        check_op_shapes(kernel, op)?;
    }
    Ok(())
}

fn check_op_shapes(kernel: &Kernel, op: &Op) -> Result<(), InferenceError> {
    let mismatch = |tile: TileId, reason: String| InferenceError::ShapeMismatch {
        op: op.id,
        tile: kernel.tile(tile).name.clone(),
        reason,
    };
    let check_region = |r: &Region| {
        let rank = kernel.tile(r.tile).shape.len();
        if r.extents.len() != rank || r.offsets.len() != rank {
            return Err(mismatch(
                r.tile,
                format!(
                    "region of rank {} on a tile of rank {}",
                    r.extents.len().max(r.offsets.len()),
                    rank
                ),
            ));
        }
        Ok(())
    };
    let check_access = |a: &Access| {
        let rank = kernel.tile(a.tile).shape.len();
        if a.indices.len() != rank {
            return Err(mismatch(
                a.tile,
                format!("{} indices on a tile of rank {}", a.indices.len(), rank),
            ));
        }
        Ok(())
    };

    match &op.kind {
        OpKind::Alloc { .. } | OpKind::Fill { .. } | OpKind::Pipelined { .. } => {}
        OpKind::Copy { src, dst, .. } => {
            check_region(src)?;
            check_region(dst)?;
            let squeeze = |e: &[u32]| e.iter().copied().filter(|&n| n != 1).collect::<Vec<_>>();
            if squeeze(&src.extents[..]) != squeeze(&dst.extents[..]) {
                return Err(mismatch(
                    dst.tile,
                    format!(
                        "copies {:?} elements into a {:?} region",
                        src.extents, dst.extents
                    ),
                ));
            }
        }
        OpKind::Parallel { body, .. } => {
            for assign in body {
                check_access(&assign.dst)?;
                for load in assign.value.loads() {
                    check_access(load)?;
                }
            }
        }
        OpKind::Gemm {
            a,
            b,
            c,
            transpose_a,
            transpose_b,
            ..
        } => {
            let (ta, tb, tc) = (kernel.tile(*a), kernel.tile(*b), kernel.tile(*c));
            if gemm_dims(&ta.shape, &tb.shape, &tc.shape, *transpose_a, *transpose_b).is_none() {
                return Err(mismatch(
                    *c,
                    format!(
                        "gemm of {:?} by {:?} cannot produce {:?}",
                        ta.shape, tb.shape, tc.shape
                    ),
                ));
            }
        }
        OpKind::Reduce { src, dst, axis, .. } => {
            let shape = &kernel.tile(*src).shape;
            if shape.len() != 2 || *axis >= shape.len() {
                return Err(mismatch(
                    *src,
                    format!("cannot reduce axis {} of a {:?} tile", axis, shape),
                ));
            }
            let mut reduced = shape.clone();
            reduced.remove(*axis);
            let out = &kernel.tile(*dst).shape;
            if *out != reduced {
                return Err(mismatch(
                    *dst,
                    format!("reduction yields {:?}, not {:?}", reduced, out),
                ));
            }
        }
        OpKind::Relayout { src, dst } => {
            if kernel.tile(*src).shape != kernel.tile(*dst).shape {
                return Err(mismatch(*dst, "relayout changes the shape".to_string()));
            }
        }
    }
    Ok(())
}

// ─── Demand collection ─────────────────────────────────────────────

fn collect_uses(kernel: &Kernel, caps: &TargetCaps) -> Result<Vec<Use>, InferenceError> {
    let mut uses = Vec::new();
    for op in kernel.ops() {
        op_uses(kernel, op, caps, &mut uses)?;
    }
    Ok(uses)
}

fn op_uses(
    kernel: &Kernel,
    op: &Op,
    caps: &TargetCaps,
    out: &mut Vec<Use>,
) -> Result<(), InferenceError> {
    let mut push = |tile: TileId, read: bool, write: bool, demand: Demand| {
        out.push(Use {
            op: op.id,
            tile,
            read,
            write,
            demand,
        })
    };
    // Demand for a plain traversal; register tiles don't care unless vectorized.
    let traversal = |tile: TileId, pattern: AccessPattern| -> Demand {
        match kernel.tile(tile).scope {
            Scope::Fragment => match pattern {
                AccessPattern::RowMajor { vector } if vector > 1 => Demand::Vector(vector),
                _ => Demand::Free,
            },
            _ => Demand::Pattern(pattern),
        }
    };
    let natural = |tile: TileId, inner: u32| -> u32 {
        let t = kernel.tile(tile);
        let v = caps.vector_elems(t.dtype);
        let mut v = v.min(inner.max(1));
        while v > 1 && inner % v != 0 {
            v /= 2;
        }
        v.max(1)
    };

    match &op.kind {
        OpKind::Alloc { .. } | OpKind::Pipelined { .. } => {}
        OpKind::Copy {
            src,
            dst,
            coalesced_width,
        } => {
            let inner = dst.extents.last().copied().unwrap_or(1);
            for (region, read) in [(src, true), (dst, false)] {
                let t = kernel.tile(region.tile);
                let demand = match (t.scope, coalesced_width) {
                    (Scope::Fragment, Some(w)) => Demand::Vector(*w),
                    (Scope::Fragment, None) => Demand::Free,
                    (_, Some(w)) => Demand::Pattern(AccessPattern::RowMajor { vector: *w }),
                    (_, None) => Demand::Pattern(AccessPattern::RowMajor {
                        vector: natural(region.tile, inner),
                    }),
                };
                push(region.tile, read, !read, demand);
            }
        }
        OpKind::Fill { tile, .. } => {
            let v = natural(*tile, kernel.tile(*tile).cols());
            let demand = match kernel.tile(*tile).scope {
                Scope::Fragment => Demand::Free,
                _ => Demand::Pattern(AccessPattern::RowMajor { vector: v }),
            };
            push(*tile, false, true, demand);
        }
        OpKind::Parallel { vars, body, .. } => {
            let inner = vars.last().map(String::as_str).unwrap_or("");
            for assign in body {
                for load in assign.value.loads() {
                    let p = elementwise_pattern(&load.indices, inner);
                    push(load.tile, true, false, traversal(load.tile, p));
                }
                let p = elementwise_pattern(&assign.dst.indices, inner);
                push(assign.dst.tile, false, true, traversal(assign.dst.tile, p));
            }
        }
        OpKind::Gemm {
            a,
            b,
            c,
            transpose_a,
            transpose_b,
            clear_accum,
        } => match bind_gemm(kernel, &op.kind, caps)? {
            Some(binding) => {
                let operand = |role: Role, transposed: bool| {
                    Demand::Pattern(AccessPattern::Operand(
                        binding.operand_layout(role, transposed),
                    ))
                };
                push(*a, true, false, operand(Role::A, *transpose_a));
                push(*b, true, false, operand(Role::B, *transpose_b));
                push(*c, !clear_accum, true, operand(Role::C, false));
            }
            None => {
                let scalar = AccessPattern::RowMajor { vector: 1 };
                push(*a, true, false, traversal(*a, scalar.clone()));
                push(*b, true, false, traversal(*b, scalar.clone()));
                push(*c, !clear_accum, true, traversal(*c, scalar));
            }
        },
        OpKind::Reduce {
            src,
            dst,
            axis,
            clear,
            ..
        } => {
            let p = if *axis + 1 == kernel.tile(*src).shape.len() {
                AccessPattern::ColumnMajor
            } else {
                AccessPattern::RowMajor { vector: 1 }
            };
            push(*src, true, false, traversal(*src, p));
            push(
                *dst,
                !clear,
                true,
                traversal(*dst, AccessPattern::RowMajor { vector: 1 }),
            );
        }
        OpKind::Relayout { src, dst } => {
            push(*src, true, false, Demand::Free);
            push(*dst, false, true, Demand::Free);
        }
    }
    Ok(())
}

/// Row-major when the innermost loop variable walks the last index with
/// stride 1; column-major when it walks an outer index.
fn elementwise_pattern(indices: &[crate::ir::Affine], inner: &str) -> AccessPattern {
    let Some((last, outer)) = indices.split_last() else {
        return AccessPattern::RowMajor { vector: 1 };
    };
    if outer.iter().any(|ix| ix.depends_on(inner)) && !last.depends_on(inner) {
        AccessPattern::ColumnMajor
    } else {
        AccessPattern::RowMajor { vector: 1 }
    }
}

// ─── Per-tile planning ─────────────────────────────────────────────

struct TilePlan {
    primary: Layout,
    /// Alternative layouts and the ops redirected to each.
    twins: Vec<(Layout, Vec<OpId>)>,
}

fn plan_tile(
    kernel: &Kernel,
    tile: &Tile,
    uses: &[&Use],
    caps: &TargetCaps,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<TilePlan, InferenceError> {
    let req = LayoutRequest {
        tile: &tile.name,
        shape: &tile.shape,
        dtype: tile.dtype,
        scope: tile.scope,
        threads: kernel.num_threads(),
    };

    if tile.scope == Scope::Global {
        if let Some(decl) = &tile.declared {
            if decl.kind != LayoutKind::RowMajor {
                return Err(LayoutError::InvalidDeclaredLayout {
                    tile: tile.name.clone(),
                    reason: "global tiles are always row-major".to_string(),
                }
                .into());
            }
        }
        return Ok(TilePlan {
            primary: Layout::row_major(&tile.shape),
            twins: Vec::new(),
        });
    }

    if let Some(decl) = &tile.declared {
        validate_declared(tile, decl)?;
        if tile.scope == Scope::Shared {
            for u in uses {
                if let Demand::Pattern(p) = &u.demand {
                    let degree = conflict_degree(decl, p, tile.dtype.bytes(), caps);
                    if degree > 1 {
                        diagnostics.push(
                            Diagnostic::warning(
                                format!(
                                    "declared layout {} of tile '{}' has {}-way bank conflicts",
                                    decl.describe(),
                                    tile.name,
                                    degree
                                ),
                                Site::Tile(tile.name.clone()),
                            )
                            .with_note(format!("access by op {}: {}", u.op, p.describe())),
                        );
                    }
                }
            }
            return Ok(TilePlan {
                primary: decl.clone(),
                twins: Vec::new(),
            });
        }
        return partition_fragment(&req, decl.clone(), uses, caps);
    }

    match tile.scope {
        Scope::Shared => plan_shared(&req, uses, caps),
        _ => {
            let primary = match uses.iter().find_map(|u| match &u.demand {
                Demand::Pattern(p @ AccessPattern::Operand(_)) => Some(p.clone()),
                _ => None,
            }) {
                Some(exact) => resolve(&req, &[exact], caps)?,
                None => {
                    let widest = uses
                        .iter()
                        .filter_map(|u| match u.demand {
                            Demand::Vector(v) => Some(v),
                            _ => None,
                        })
                        .max()
                        .unwrap_or(1);
                    resolve(&req, &[AccessPattern::RowMajor { vector: widest }], caps)?
                }
            };
            partition_fragment(&req, primary, uses, caps)
        }
    }
}

fn validate_declared(tile: &Tile, decl: &Layout) -> Result<(), LayoutError> {
    let invalid = |reason: String| LayoutError::InvalidDeclaredLayout {
        tile: tile.name.clone(),
        reason,
    };
    if decl.shape != tile.shape {
        return Err(invalid(format!(
            "layout shape {:?} does not match tile shape {:?}",
            decl.shape, tile.shape
        )));
    }
    if decl.is_fragment() != (tile.scope == Scope::Fragment) {
        return Err(invalid(format!(
            "{} layout cannot describe a {} tile",
            decl.describe(),
            tile.scope.name()
        )));
    }
    if !decl.is_injective() {
        return Err(invalid(format!(
            "{} maps two elements to the same slot",
            decl.describe()
        )));
    }
    Ok(())
}

/// Resolve a shared tile, splitting its uses when no single layout is
/// conflict free for all of them.
fn plan_shared(
    req: &LayoutRequest,
    uses: &[&Use],
    caps: &TargetCaps,
) -> Result<TilePlan, InferenceError> {
    let mut ops: Vec<(OpId, Vec<AccessPattern>)> = Vec::new();
    for u in uses {
        let Demand::Pattern(p) = &u.demand else {
            continue;
        };
        match ops.iter_mut().find(|(id, _)| *id == u.op) {
            Some((_, ps)) => ps.push(p.clone()),
            None => ops.push((u.op, vec![p.clone()])),
        }
    }
    let all: Vec<AccessPattern> = ops.iter().flat_map(|(_, ps)| ps.clone()).collect();
    match resolve(req, &all, caps) {
        Ok(layout) => {
            return Ok(TilePlan {
                primary: layout,
                twins: Vec::new(),
            })
        }
        Err(LayoutError::NoConflictFree { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    // Greedy grouping in program order: each group is the largest prefix
    // of the remaining ops that still has a conflict-free layout.
    let mut groups: Vec<(Layout, Vec<OpId>)> = Vec::new();
    let mut remaining = ops;
    while !remaining.is_empty() {
        let mut patterns = Vec::new();
        let mut members = Vec::new();
        let mut layout = None;
        let mut rest = Vec::new();
        for (op, ps) in remaining {
            let mut trial = patterns.clone();
            trial.extend(ps.iter().cloned());
            match resolve(req, &trial, caps) {
                Ok(l) => {
                    patterns = trial;
                    members.push(op);
                    layout = Some(l);
                }
                Err(LayoutError::NoConflictFree { .. }) if !members.is_empty() => {
                    rest.push((op, ps))
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(l) = layout {
            groups.push((l, members));
        }
        remaining = rest;
    }

    let mut groups = groups.into_iter();
    let primary = match groups.next() {
        Some((l, _)) => l,
        None => Layout::row_major(req.shape),
    };
    Ok(TilePlan {
        primary,
        twins: groups.collect(),
    })
}

/// Keep `primary` for every use it satisfies; group the others by the
/// layout they need.
fn partition_fragment(
    req: &LayoutRequest,
    primary: Layout,
    uses: &[&Use],
    caps: &TargetCaps,
) -> Result<TilePlan, InferenceError> {
    let run = primary.contiguous_run();
    let mut twins: Vec<(Layout, Vec<OpId>)> = Vec::new();
    for u in uses {
        let wanted = match &u.demand {
            Demand::Free => continue,
            Demand::Vector(v) => {
                if *v <= 1 || run % v == 0 {
                    continue;
                }
                resolve(req, &[AccessPattern::RowMajor { vector: *v }], caps)?
            }
            Demand::Pattern(p) => {
                let exact = resolve(req, std::slice::from_ref(p), caps)?;
                if exact == primary {
                    continue;
                }
                exact
            }
        };
        match twins.iter_mut().find(|(l, _)| *l == wanted) {
            Some((_, ops)) => {
                if !ops.contains(&u.op) {
                    ops.push(u.op)
                }
            }
            None => twins.push((wanted, vec![u.op])),
        }
    }
    // An op redirected for one demand sees the twin for all its demands on
    // this tile; keep only its first group.
    let mut seen = Vec::new();
    for (_, ops) in &mut twins {
        ops.retain(|op| {
            if seen.contains(op) {
                false
            } else {
                seen.push(*op);
                true
            }
        });
    }
    twins.retain(|(_, ops)| !ops.is_empty());
    Ok(TilePlan { primary, twins })
}

// ─── Rewriting ─────────────────────────────────────────────────────

fn splice(
    body: &mut Vec<Op>,
    redirects: &HashMap<OpId, Vec<Redirect>>,
    next: &mut u32,
    records: &mut Vec<RelayoutRecord>,
) {
    let old = std::mem::take(body);
    for mut op in old {
        if let OpKind::Pipelined { body: inner, .. } = &mut op.kind {
            splice(inner, redirects, next, records);
        }
        let Some(list) = redirects.get(&op.id) else {
            body.push(op);
            continue;
        };
        let mut after = Vec::new();
        for r in list {
            visit::replace_tile(&mut op.kind, r.from, r.to);
            if r.read {
                let id = fresh(next);
                body.push(Op::new(
                    id,
                    OpKind::Relayout {
                        src: r.from,
                        dst: r.to,
                    },
                ));
                records.push(RelayoutRecord {
                    op: id,
                    serves: op.id,
                    src: r.from,
                    dst: r.to,
                });
            }
            if r.write {
                let id = fresh(next);
                after.push(Op::new(
                    id,
                    OpKind::Relayout {
                        src: r.to,
                        dst: r.from,
                    },
                ));
                records.push(RelayoutRecord {
                    op: id,
                    serves: op.id,
                    src: r.to,
                    dst: r.from,
                });
            }
        }
        body.push(op);
        body.extend(after);
    }
}

fn fresh(next: &mut u32) -> OpId {
    let id = OpId(*next);
    *next += 1;
    id
}
