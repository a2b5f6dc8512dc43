//! Dependence analysis of a pipelined loop body.
//!
//! Nodes are body ops; edges are flow (write → read), anti (read → write)
//! and output (write → write) dependences on a tile. Edges between ops of
//! the same iteration follow body order. A *carried* flow edge means a read
//! in iteration `i` sees a value written in iteration `i - 1`.

use std::collections::HashMap;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::ScheduleError;
use crate::ir::{visit, Kernel, Op, OpId, OpKind, Scope, TileId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepKind {
    Flow,
    Anti,
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dep {
    pub kind: DepKind,
    pub tile: TileId,
    pub carried: bool,
}

pub struct DepGraph {
    pub graph: DiGraph<OpId, Dep>,
    index: HashMap<OpId, NodeIndex>,
}

impl DepGraph {
    pub fn build(kernel: &Kernel, body: &[Op]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for op in body {
            index.insert(op.id, graph.add_node(op.id));
        }
        let reads: Vec<Vec<TileId>> = body.iter().map(|op| visit::reads(&op.kind)).collect();
        let writes: Vec<Vec<TileId>> = body.iter().map(|op| visit::writes(&op.kind)).collect();
        let defines: Vec<Vec<TileId>> = body
            .iter()
            .map(|op| visit::defines(&op.kind, |t| kernel.tile(t).shape.clone()))
            .collect();

        for (i, a) in body.iter().enumerate() {
            for (j, b) in body.iter().enumerate() {
                let (na, nb) = (index[&a.id], index[&b.id]);
                if i < j {
                    for &t in &writes[i] {
                        if reads[j].contains(&t) {
                            graph.add_edge(na, nb, dep(DepKind::Flow, t, false));
                        }
                        if writes[j].contains(&t) {
                            graph.add_edge(na, nb, dep(DepKind::Output, t, false));
                        }
                    }
                    for &t in &reads[i] {
                        if writes[j].contains(&t) {
                            graph.add_edge(na, nb, dep(DepKind::Anti, t, false));
                        }
                    }
                } else {
                    // a (at or after b in body order) feeds b of the next iteration,
                    // unless something before b redefines the tile first
                    for &t in &writes[i] {
                        let killed = defines[..j].iter().any(|d| d.contains(&t));
                        if reads[j].contains(&t) && !killed {
                            graph.add_edge(na, nb, dep(DepKind::Flow, t, true));
                        }
                    }
                }
            }
        }
        Self { graph, index }
    }

    pub fn node(&self, op: OpId) -> Option<NodeIndex> {
        self.index.get(&op).copied()
    }

    /// Carried flow edges `(writer, reader, tile)`.
    pub fn carried(&self) -> Vec<(OpId, OpId, TileId)> {
        self.graph
            .edge_references()
            .filter(|e| e.weight().carried && e.weight().kind == DepKind::Flow)
            .map(|e| (self.graph[e.source()], self.graph[e.target()], e.weight().tile))
            .collect()
    }

    /// The graph restricted to same-iteration edges.
    pub fn intra(&self) -> DiGraph<OpId, Dep> {
        let mut intra = self.graph.clone();
        intra.retain_edges(|g, e| !g[e].carried);
        intra
    }

    /// Does `to` depend on `from` within one iteration?
    pub fn depends(&self, intra: &DiGraph<OpId, Dep>, from: OpId, to: OpId) -> bool {
        match (self.node(from), self.node(to)) {
            (Some(a), Some(b)) if a != b => has_path_connecting(intra, a, b, None),
            _ => false,
        }
    }
}

fn dep(kind: DepKind, tile: TileId, carried: bool) -> Dep {
    Dep {
        kind,
        tile,
        carried,
    }
}

/// Producer/consumer split of a loop body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Roles {
    pub producers: Vec<OpId>,
    pub consumers: Vec<OpId>,
    /// On-chip tiles written by producers; these get one slot per stage.
    pub rotated: Vec<TileId>,
}

/// Derive roles and reject dependences the staged schedule would break.
pub fn classify(kernel: &Kernel, region: OpId, body: &[Op]) -> Result<Roles, ScheduleError> {
    let graph = DepGraph::build(kernel, body);
    let body_writes: Vec<(OpId, Vec<TileId>)> = body
        .iter()
        .map(|op| (op.id, visit::writes(&op.kind)))
        .collect();

    let mut roles = Roles {
        producers: Vec::new(),
        consumers: Vec::new(),
        rotated: Vec::new(),
    };
    let mut producer_dst = Vec::new();
    for op in body {
        let OpKind::Copy { src, dst, .. } = &op.kind else {
            roles.consumers.push(op.id);
            continue;
        };
        let from_global = kernel.tile(src.tile).scope == Scope::Global;
        let to_chip = kernel.tile(dst.tile).scope.is_on_chip();
        if !(from_global && to_chip) {
            roles.consumers.push(op.id);
            continue;
        }
        // a producer must only read data that exists before the loop
        if let Some((writer, _)) = body_writes
            .iter()
            .find(|(id, w)| *id != op.id && w.contains(&src.tile))
        {
            return Err(ScheduleError::UnsupportedDependency {
                region,
                reader: op.id,
                writer: *writer,
                tile: kernel.tile(src.tile).name.clone(),
                reason: "a producer copy reads data computed inside the loop".to_string(),
            });
        }
        // slots start empty, so a partial fill would expose stale elements
        if !dst.covers(&kernel.tile(dst.tile).shape) {
            let reader = body
                .iter()
                .find(|r| r.id != op.id && visit::reads(&r.kind).contains(&dst.tile))
                .map_or(op.id, |r| r.id);
            return Err(ScheduleError::UnsupportedDependency {
                region,
                reader,
                writer: op.id,
                tile: kernel.tile(dst.tile).name.clone(),
                reason: "a producer fills only part of a rotated buffer".to_string(),
            });
        }
        roles.producers.push(op.id);
        producer_dst.push(dst.tile);
        if !roles.rotated.contains(&dst.tile) {
            roles.rotated.push(dst.tile);
        }
    }

    let intra = graph.intra();
    for (&p, &dst) in roles.producers.iter().zip(&producer_dst) {
        if let Some(&c) = roles
            .consumers
            .iter()
            .find(|&&c| graph.depends(&intra, c, p))
        {
            return Err(ScheduleError::UnsupportedDependency {
                region,
                reader: p,
                writer: c,
                tile: kernel.tile(dst).name.clone(),
                reason: "a producer depends on a consumer of the same iteration".to_string(),
            });
        }
    }

    for (writer, reader, tile) in graph.carried() {
        if writer == reader {
            // in-place accumulation; consumers run in iteration order
            continue;
        }
        return Err(ScheduleError::UnsupportedDependency {
            region,
            reader,
            writer,
            tile: kernel.tile(tile).name.clone(),
            reason: "the value crosses iterations (loop-carried)".to_string(),
        });
    }

    Ok(roles)
}
