//! Pipeline scheduler.
//!
//! Rewrites each `Pipelined` region into a [`StagedLoop`]: producers (global
//! → on-chip copies) run `S - 1` iterations ahead of consumers, every buffer
//! they write is expanded into `S` slot tiles, and acquire/release waits
//! order the two sides.

pub mod deps;
pub mod simulate;
pub mod staged;

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::ScheduleError;
use crate::ir::{visit, Kernel, OpId, OpKind, Scope, TileId};
use crate::target::TargetCaps;

pub use deps::{classify, Roles};
pub use staged::{
    effective_stages, Action, ConcreteAction, ConcreteStep, IterRef, OpRole, Phase, RotatedBuffer,
    StagedLoop, SteadyState, Step, SyncEdge, WaitKind,
};

/// Schedule one pipelined region and attach the result to it.
///
/// Slot tiles for rotated buffers are appended to the kernel's tile table.
/// On error the kernel is left unchanged.
pub fn schedule_region(
    kernel: &mut Kernel,
    region: OpId,
    caps: &TargetCaps,
) -> Result<StagedLoop, ScheduleError> {
    let Some(op) = kernel.find_op(region) else {
        return Err(ScheduleError::NotARegion { op: region });
    };
    let OpKind::Pipelined {
        var,
        trip_count,
        stages,
        body,
        ..
    } = &op.kind
    else {
        return Err(ScheduleError::NotARegion { op: region });
    };
    if let Some(inner) = body
        .iter()
        .find(|op| matches!(op.kind, OpKind::Pipelined { .. }))
    {
        return Err(ScheduleError::NestedRegion {
            region,
            inner: inner.id,
        });
    }

    for op in body {
        for tile in visit::mentions(&op.kind) {
            let t = kernel.tile(tile);
            if t.scope.is_on_chip() && t.layout.is_none() {
                return Err(ScheduleError::UnresolvedLayout {
                    region,
                    tile: t.name.clone(),
                });
            }
        }
    }

    let roles = classify(kernel, region, body)?;
    let var = var.clone();
    let trip_count = *trip_count;
    let requested = *stages;
    let stages = effective_stages(requested, trip_count);
    if stages != requested.max(1) {
        debug!(
            "region {}: {} stages requested, {} used for {} iterations",
            region, requested, stages, trip_count
        );
    }

    let required = shared_bytes(kernel, &roles.rotated, stages);
    if required > caps.shared.capacity_bytes {
        return Err(ScheduleError::SharedMemoryExceeded {
            region,
            stages,
            required,
            available: caps.shared.capacity_bytes,
        });
    }

    let rotation = roles
        .rotated
        .iter()
        .map(|&logical| RotatedBuffer {
            logical,
            slots: slot_tiles(kernel, logical, stages),
        })
        .collect();

    let staged = StagedLoop::build(
        region,
        &var,
        trip_count,
        requested,
        roles.producers,
        roles.consumers,
        rotation,
    );
    info!(
        "scheduled region {} ({}): {} stages, {} producers, {} consumers, {} bytes shared",
        region,
        var,
        staged.stages,
        staged.producers.len(),
        staged.consumers.len(),
        required
    );

    if let Some(OpKind::Pipelined { schedule, .. }) =
        kernel.find_op_mut(region).map(|op| &mut op.kind)
    {
        *schedule = Some(staged.clone());
    }
    Ok(staged)
}

/// Schedule every pipelined region of the kernel that has no schedule yet.
pub fn schedule(mut kernel: Kernel, caps: &TargetCaps) -> Result<Kernel, ScheduleError> {
    let pending: Vec<OpId> = kernel
        .body
        .iter()
        .filter(|op| matches!(op.kind, OpKind::Pipelined { schedule: None, .. }))
        .map(|op| op.id)
        .collect();
    for region in pending {
        schedule_region(&mut kernel, region, caps)?;
    }
    Ok(kernel)
}

/// One tile per stage. With a single stage the logical tile is its own slot.
fn slot_tiles(kernel: &mut Kernel, logical: TileId, stages: u32) -> Vec<TileId> {
    if stages <= 1 {
        return vec![logical];
    }
    let template = kernel.tile(logical).clone();
    (0..stages)
        .map(|k| {
            let mut slot = template.clone();
            slot.name = format!("{}@{}", template.name, k);
            kernel.add_tile(slot)
        })
        .collect()
}

/// Shared-memory bytes live in the block once `rotated` is expanded into
/// `stages` slots.
///
/// Logical tiles already replaced by slots of an earlier region are not
/// counted twice.
pub fn shared_bytes(kernel: &Kernel, rotated: &[TileId], stages: u32) -> u64 {
    let mut retired = HashSet::new();
    for op in kernel.ops() {
        if let OpKind::Pipelined {
            schedule: Some(s), ..
        } = &op.kind
        {
            for r in &s.rotation {
                if r.slots.len() > 1 {
                    retired.insert(r.logical);
                }
            }
        }
    }
    kernel
        .tiles
        .iter()
        .enumerate()
        .filter(|(_, t)| t.scope == Scope::Shared)
        .map(|(i, t)| {
            let id = TileId(i as u32);
            if retired.contains(&id) {
                0
            } else if rotated.contains(&id) {
                t.footprint_bytes() * stages as u64
            } else {
                t.footprint_bytes()
            }
        })
        .sum()
}
