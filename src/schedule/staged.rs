//! Staged loop representation.
//!
//! For `T` iterations and `S` stages:
//!
//! ```text
//!   prologue   p = 0 .. S-2        issue producers(p)
//!   steady     i = S-1 .. T-1      release(i-S)  producers(i)  acquire(i-S+1)  consumers(i-S+1)
//!   epilogue   j = T-S+1 .. T-1    acquire(j)  consumers(j)
//! ```
//!
//! Producer and consumer actions of iteration `j` use buffer slot `j mod S`.
//! The steady state is kept as one parametric step; `unroll` expands it.

use serde::{Deserialize, Serialize};

use crate::ir::{OpId, TileId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpRole {
    /// Asynchronous global → on-chip copy for a future iteration.
    Producer,
    /// Everything that computes on the current iteration's data.
    Consumer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prologue,
    Steady,
    Epilogue,
}

/// Iteration an action refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterRef {
    Fixed(u64),
    /// Offset from the steady-state loop variable.
    Relative(i64),
}

impl IterRef {
    /// Concrete iteration at steady-state index `i`; `None` before iteration 0.
    pub fn at(self, i: u64) -> Option<u64> {
        match self {
            IterRef::Fixed(j) => Some(j),
            IterRef::Relative(d) => {
                let j = i as i64 + d;
                (j >= 0).then_some(j as u64)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    /// Consumer waits until the producers of its iteration have landed.
    Acquire,
    /// Producer waits until the consumers of the slot's previous occupant
    /// have finished reading it.
    Release,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Issue { op: OpId, role: OpRole, iter: IterRef },
    Wait { kind: WaitKind, iter: IterRef },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub actions: Vec<Action>,
}

/// The steady-state step, repeated for `i` in `first..=last`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteadyState {
    pub first: u64,
    pub last: u64,
    pub step: Step,
}

/// A buffer written by producers, expanded into one tile per stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatedBuffer {
    pub logical: TileId,
    /// Slot `k` holds iterations `j` with `j mod S == k`.
    pub slots: Vec<TileId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedLoop {
    pub region: OpId,
    pub var: String,
    pub trip_count: u64,
    /// Stage count as written.
    pub requested_stages: u32,
    /// Stage count after clamping to `1..=trip_count`.
    pub stages: u32,
    pub producers: Vec<OpId>,
    pub consumers: Vec<OpId>,
    pub rotation: Vec<RotatedBuffer>,
    pub prologue: Vec<Step>,
    pub steady: Option<SteadyState>,
    pub epilogue: Vec<Step>,
}

/// One action with its iteration and slot resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcreteAction {
    Issue {
        op: OpId,
        role: OpRole,
        iter: u64,
        slot: u32,
    },
    Wait {
        kind: WaitKind,
        iter: u64,
        slot: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcreteStep {
    pub phase: Phase,
    pub actions: Vec<ConcreteAction>,
}

/// Ordering guarantee: every producer issue of `iter` completes before the
/// consumer issue of `iter` starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncEdge {
    pub producer: OpId,
    pub consumer: OpId,
    pub iter: u64,
    pub slot: u32,
}

/// Stage count actually used for `requested` stages over `trip_count`.
pub fn effective_stages(requested: u32, trip_count: u64) -> u32 {
    let s = requested.max(1) as u64;
    s.min(trip_count.max(1)) as u32
}

impl StagedLoop {
    /// Build the three-phase schedule. `rotation` must already hold one slot
    /// tile per effective stage.
    pub fn build(
        region: OpId,
        var: &str,
        trip_count: u64,
        requested_stages: u32,
        producers: Vec<OpId>,
        consumers: Vec<OpId>,
        rotation: Vec<RotatedBuffer>,
    ) -> Self {
        let stages = effective_stages(requested_stages, trip_count);
        let t = trip_count;
        let s = stages as u64;
        let issue = |ops: &[OpId], role: OpRole, iter: IterRef| -> Vec<Action> {
            ops.iter()
                .map(|&op| Action::Issue { op, role, iter })
                .collect()
        };

        let mut prologue = Vec::new();
        let mut steady = None;
        let mut epilogue = Vec::new();

        if t > 0 {
            for p in 0..s - 1 {
                prologue.push(Step {
                    actions: issue(&producers, OpRole::Producer, IterRef::Fixed(p)),
                });
            }

            let lag = (s - 1) as i64;
            let mut actions = vec![Action::Wait {
                kind: WaitKind::Release,
                iter: IterRef::Relative(-(s as i64)),
            }];
            actions.extend(issue(&producers, OpRole::Producer, IterRef::Relative(0)));
            actions.push(Action::Wait {
                kind: WaitKind::Acquire,
                iter: IterRef::Relative(-lag),
            });
            actions.extend(issue(&consumers, OpRole::Consumer, IterRef::Relative(-lag)));
            steady = Some(SteadyState {
                first: s - 1,
                last: t - 1,
                step: Step { actions },
            });

            for j in t - (s - 1)..t {
                let mut actions = vec![Action::Wait {
                    kind: WaitKind::Acquire,
                    iter: IterRef::Fixed(j),
                }];
                actions.extend(issue(&consumers, OpRole::Consumer, IterRef::Fixed(j)));
                epilogue.push(Step { actions });
            }
        }

        Self {
            region,
            var: var.to_string(),
            trip_count,
            requested_stages,
            stages,
            producers,
            consumers,
            rotation,
            prologue,
            steady,
            epilogue,
        }
    }

    pub fn slot(&self, iter: u64) -> u32 {
        (iter % self.stages.max(1) as u64) as u32
    }

    pub fn role_of(&self, op: OpId) -> Option<OpRole> {
        if self.producers.contains(&op) {
            Some(OpRole::Producer)
        } else if self.consumers.contains(&op) {
            Some(OpRole::Consumer)
        } else {
            None
        }
    }

    /// Physical tile holding `logical` for iteration `iter`, if rotated.
    pub fn slot_tile(&self, logical: TileId, iter: u64) -> Option<TileId> {
        let slot = self.slot(iter) as usize;
        self.rotation
            .iter()
            .find(|r| r.logical == logical)
            .and_then(|r| r.slots.get(slot).copied())
    }

    /// Expand every step into concrete actions, in execution order. Waits on
    /// iterations before 0 are dropped.
    pub fn unroll(&self) -> Vec<ConcreteStep> {
        let mut out = Vec::new();
        for step in &self.prologue {
            out.push(self.concrete(Phase::Prologue, step, 0));
        }
        if let Some(steady) = &self.steady {
            for i in steady.first..=steady.last {
                out.push(self.concrete(Phase::Steady, &steady.step, i));
            }
        }
        for step in &self.epilogue {
            out.push(self.concrete(Phase::Epilogue, step, 0));
        }
        out
    }

    fn concrete(&self, phase: Phase, step: &Step, i: u64) -> ConcreteStep {
        let actions = step
            .actions
            .iter()
            .filter_map(|action| match *action {
                Action::Issue { op, role, iter } => iter.at(i).map(|iter| ConcreteAction::Issue {
                    op,
                    role,
                    iter,
                    slot: self.slot(iter),
                }),
                Action::Wait { kind, iter } => iter.at(i).map(|iter| ConcreteAction::Wait {
                    kind,
                    iter,
                    slot: self.slot(iter),
                }),
            })
            .collect();
        ConcreteStep { phase, actions }
    }

    /// Producer → consumer edges enforced by acquire waits.
    pub fn sync_edges(&self) -> Vec<SyncEdge> {
        let mut edges = Vec::new();
        for step in self.unroll() {
            let mut acquired = None;
            for action in &step.actions {
                match *action {
                    ConcreteAction::Wait {
                        kind: WaitKind::Acquire,
                        iter,
                        ..
                    } => acquired = Some(iter),
                    ConcreteAction::Issue {
                        op,
                        role: OpRole::Consumer,
                        iter,
                        slot,
                    } if acquired == Some(iter) => {
                        for &producer in &self.producers {
                            edges.push(SyncEdge {
                                producer,
                                consumer: op,
                                iter,
                                slot,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        edges
    }

    /// Compact one-line-per-step rendering used by listings.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "stages={} (requested {}) trip={}",
            self.stages, self.requested_stages, self.trip_count
        )];
        for r in &self.rotation {
            let slots: Vec<String> = r.slots.iter().map(|s| s.to_string()).collect();
            lines.push(format!("rotate {} -> [{}]", r.logical, slots.join(", ")));
        }
        for (p, step) in self.prologue.iter().enumerate() {
            lines.push(format!("prologue[{}]: {}", p, render_step(step)));
        }
        if let Some(steady) = &self.steady {
            lines.push(format!(
                "steady i={}..={}: {}",
                steady.first,
                steady.last,
                render_step(&steady.step)
            ));
        }
        for (e, step) in self.epilogue.iter().enumerate() {
            lines.push(format!("epilogue[{}]: {}", e, render_step(step)));
        }
        lines
    }
}

fn render_iter(iter: IterRef) -> String {
    match iter {
        IterRef::Fixed(j) => j.to_string(),
        IterRef::Relative(0) => "i".to_string(),
        IterRef::Relative(d) if d > 0 => format!("i+{}", d),
        IterRef::Relative(d) => format!("i-{}", -d),
    }
}

fn render_step(step: &Step) -> String {
    let parts: Vec<String> = step
        .actions
        .iter()
        .map(|a| match a {
            Action::Issue { op, iter, .. } => format!("{}@{}", op, render_iter(*iter)),
            Action::Wait {
                kind: WaitKind::Acquire,
                iter,
            } => format!("acquire({})", render_iter(*iter)),
            Action::Wait {
                kind: WaitKind::Release,
                iter,
            } => format!("release({})", render_iter(*iter)),
        })
        .collect();
    parts.join(" ")
}
