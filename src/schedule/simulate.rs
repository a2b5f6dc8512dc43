//! Functional simulation of scheduled kernels.
//!
//! Runs a kernel twice over the same synthetic inputs: once sequentially,
//! ignoring pipeline schedules, and once following each region's staged
//! schedule. In the staged run a producer's writes stay in flight until the
//! acquire wait of its iteration commits them, and reusing a slot before its
//! consumers drained is reported. Tile contents are kept in logical
//! row-major order; layouts are bijective and do not affect values.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::staged::{ConcreteAction, OpRole, StagedLoop, WaitKind};
use crate::error::SimulationError;
use crate::ir::{
    BinaryOp, Bindings, DType, Expr, Kernel, Op, OpKind, Region, Scope, TileId, UnaryOp,
};
use crate::raster;
use crate::tensor::{assert_close, Supplier, TensorSupply, Tolerance};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimOptions {
    pub supply: TensorSupply,
    pub seed: u64,
    /// Simulate only the first blocks in launch order; `None` runs the grid.
    pub max_blocks: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            supply: TensorSupply::Integer,
            seed: 0,
            max_blocks: Some(4),
        }
    }
}

/// Tile contents after a run, indexed by `TileId`.
#[derive(Clone, Debug, PartialEq)]
pub struct Memory {
    tiles: Vec<Vec<f64>>,
}

impl Memory {
    fn new(kernel: &Kernel, opts: &SimOptions) -> Self {
        let mut supplier = Supplier::new(opts.supply, opts.seed);
        let tiles = kernel
            .tiles
            .iter()
            .map(|t| match t.scope {
                Scope::Global => supplier.generate(t.numel() as usize, t.dtype),
                _ => vec![0.0; t.numel() as usize],
            })
            .collect();
        Self { tiles }
    }

    pub fn get(&self, tile: TileId) -> &[f64] {
        &self.tiles[tile.0 as usize]
    }
}

/// Outcome of a successful [`verify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    pub blocks: u64,
    pub regions: usize,
    pub compared: u64,
}

/// A single write `tile[index] = value`.
type Write = (TileId, usize, f64);

struct Machine<'k> {
    kernel: &'k Kernel,
    mem: Memory,
    env: Bindings,
    staged: bool,
}

pub fn run_reference(kernel: &Kernel, opts: &SimOptions) -> Result<Memory, SimulationError> {
    run(kernel, opts, false)
}

pub fn run_scheduled(kernel: &Kernel, opts: &SimOptions) -> Result<Memory, SimulationError> {
    run(kernel, opts, true)
}

/// Compare staged against sequential execution on every global tile.
pub fn verify(
    kernel: &Kernel,
    opts: &SimOptions,
    tol: Tolerance,
) -> Result<Verified, SimulationError> {
    let expected = run_reference(kernel, opts)?;
    let actual = run_scheduled(kernel, opts)?;
    let mut compared = 0;
    for (i, tile) in kernel.tiles.iter().enumerate() {
        if tile.scope != Scope::Global {
            continue;
        }
        let id = TileId(i as u32);
        assert_close(actual.get(id), expected.get(id), tol).map_err(|m| {
            SimulationError::Mismatch {
                tile: tile.name.clone(),
                detail: m.to_string(),
            }
        })?;
        compared += tile.numel();
    }
    let regions = kernel
        .ops()
        .iter()
        .filter(|op| {
            matches!(
                op.kind,
                OpKind::Pipelined {
                    schedule: Some(_),
                    ..
                }
            )
        })
        .count();
    let blocks = block_count(kernel, opts);
    debug!(
        "verified {}: {} blocks, {} regions, {} elements",
        kernel.name, blocks, regions, compared
    );
    Ok(Verified {
        blocks,
        regions,
        compared,
    })
}

fn block_count(kernel: &Kernel, opts: &SimOptions) -> u64 {
    let total = kernel.num_blocks();
    opts.max_blocks.map_or(total, |m| m.min(total))
}

fn run(kernel: &Kernel, opts: &SimOptions, staged: bool) -> Result<Memory, SimulationError> {
    let mut machine = Machine {
        kernel,
        mem: Memory::new(kernel, opts),
        env: Bindings::default(),
        staged,
    };
    let blocks = block_count(kernel, opts) as usize;
    for block in raster::launch_order(kernel).take(blocks) {
        machine.reset_on_chip();
        machine.env = Bindings::with_block(block);
        machine.exec_body(&kernel.body)?;
    }
    Ok(machine.mem)
}

impl Machine<'_> {
    fn reset_on_chip(&mut self) {
        for (t, data) in self.kernel.tiles.iter().zip(self.mem.tiles.iter_mut()) {
            if t.scope.is_on_chip() {
                data.iter_mut().for_each(|x| *x = 0.0);
            }
        }
    }

    fn exec_body(&mut self, body: &[Op]) -> Result<(), SimulationError> {
        let identity = HashMap::new();
        for op in body {
            match &op.kind {
                OpKind::Pipelined {
                    var,
                    trip_count,
                    body,
                    schedule,
                    ..
                } => match schedule {
                    Some(s) if self.staged => self.exec_staged(s, body)?,
                    _ => {
                        for it in 0..*trip_count {
                            self.env.bind(var, it as i64);
                            self.exec_body(body)?;
                        }
                        self.env.unbind(var);
                    }
                },
                kind => {
                    let writes = self.eval(kind, &identity);
                    self.commit(writes);
                }
            }
        }
        Ok(())
    }

    fn exec_staged(&mut self, s: &StagedLoop, body: &[Op]) -> Result<(), SimulationError> {
        let ops: HashMap<_, _> = body.iter().map(|op| (op.id, op)).collect();
        let mut in_flight: HashMap<u64, Vec<Write>> = HashMap::new();
        let mut consumed: HashMap<u64, usize> = HashMap::new();
        let mut released: HashSet<u64> = HashSet::new();
        let stages = s.stages as u64;

        for step in s.unroll() {
            for action in step.actions {
                match action {
                    ConcreteAction::Wait {
                        kind: WaitKind::Acquire,
                        iter,
                        ..
                    } => {
                        if let Some(writes) = in_flight.remove(&iter) {
                            self.commit(writes);
                        }
                    }
                    ConcreteAction::Wait {
                        kind: WaitKind::Release,
                        iter,
                        slot,
                    } => {
                        if consumed.get(&iter).copied().unwrap_or(0) < s.consumers.len() {
                            return Err(SimulationError::ReleaseViolation {
                                region: s.region,
                                iter,
                                slot,
                            });
                        }
                        released.insert(iter);
                    }
                    ConcreteAction::Issue {
                        op,
                        role,
                        iter,
                        slot,
                    } => {
                        let Some(op) = ops.get(&op) else {
                            continue;
                        };
                        let map = self.slot_map(s, iter);
                        self.env.bind(&s.var, iter as i64);
                        let writes = self.eval(&op.kind, &map);
                        match role {
                            OpRole::Producer => {
                                if iter >= stages && !released.contains(&(iter - stages)) {
                                    return Err(SimulationError::ReleaseViolation {
                                        region: s.region,
                                        iter: iter - stages,
                                        slot,
                                    });
                                }
                                in_flight.entry(iter).or_default().extend(writes);
                            }
                            OpRole::Consumer => {
                                self.commit(writes);
                                *consumed.entry(iter).or_default() += 1;
                            }
                        }
                    }
                }
            }
        }
        self.env.unbind(&s.var);

        // later ops read the logical tile: it holds the last iteration's slot
        if s.trip_count > 0 {
            let last = s.trip_count - 1;
            for r in &s.rotation {
                if let Some(slot) = s.slot_tile(r.logical, last) {
                    if slot != r.logical {
                        let data = self.mem.get(slot).to_vec();
                        self.mem.tiles[r.logical.0 as usize] = data;
                    }
                }
            }
        }
        Ok(())
    }

    fn slot_map(&self, s: &StagedLoop, iter: u64) -> HashMap<TileId, TileId> {
        s.rotation
            .iter()
            .filter_map(|r| s.slot_tile(r.logical, iter).map(|slot| (r.logical, slot)))
            .collect()
    }

    fn commit(&mut self, writes: Vec<Write>) {
        for (tile, index, value) in writes {
            if let Some(x) = self.mem.tiles[tile.0 as usize].get_mut(index) {
                *x = value;
            }
        }
    }

    /// Writes the op would perform, evaluated against current memory.
    fn eval(&self, kind: &OpKind, map: &HashMap<TileId, TileId>) -> Vec<Write> {
        let m = |t: TileId| map.get(&t).copied().unwrap_or(t);
        match kind {
            OpKind::Alloc { .. } | OpKind::Pipelined { .. } => Vec::new(),
            OpKind::Copy { src, dst, .. } => self.copy(src, dst, &m),
            OpKind::Fill { tile, value } => {
                let t = m(*tile);
                (0..self.mem.get(t).len()).map(|i| (t, i, *value)).collect()
            }
            OpKind::Relayout { src, dst } => {
                let (s, d) = (m(*src), m(*dst));
                self.mem
                    .get(s)
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| (d, i, v))
                    .collect()
            }
            OpKind::Gemm {
                a,
                b,
                c,
                transpose_a,
                transpose_b,
                clear_accum,
            } => self.gemm(
                (m(*a), *transpose_a),
                (m(*b), *transpose_b),
                m(*c),
                *clear_accum,
            ),
            OpKind::Reduce {
                src,
                dst,
                axis,
                kind,
                clear,
            } => {
                let (s, d) = (m(*src), m(*dst));
                let tile = self.kernel.tile(s);
                let (rows, cols) = (tile.rows() as usize, tile.cols() as usize);
                let data = self.mem.get(s);
                let out = self.mem.get(d);
                let (outer, inner) = if *axis == 0 { (cols, rows) } else { (rows, cols) };
                (0..outer)
                    .map(|o| {
                        let init = if *clear {
                            kind.identity()
                        } else {
                            out.get(o).copied().unwrap_or(0.0)
                        };
                        let acc = (0..inner).fold(init, |acc, i| {
                            let ix = if *axis == 0 { i * cols + o } else { o * cols + i };
                            kind.combine(acc, data.get(ix).copied().unwrap_or(0.0))
                        });
                        (d, o, acc)
                    })
                    .collect()
            }
            OpKind::Parallel {
                vars,
                extents,
                body,
            } => {
                let mut env = self.env.clone();
                let mut writes = Vec::new();
                let total: u64 = extents.iter().map(|&e| e as u64).product();
                for linear in 0..total {
                    for (var, ix) in vars.iter().zip(unravel(linear, extents)) {
                        env.bind(var, ix);
                    }
                    for assign in body {
                        let t = m(assign.dst.tile);
                        let value = self.expr(&assign.value, &env, &m);
                        let idx: Vec<i64> =
                            assign.dst.indices.iter().map(|a| a.eval(&env)).collect();
                        if let Some(i) = linear_index(&self.kernel.tile(t).shape, &idx) {
                            writes.push((t, i, value));
                        }
                    }
                }
                writes
            }
        }
    }

    fn copy(&self, src: &Region, dst: &Region, m: &impl Fn(TileId) -> TileId) -> Vec<Write> {
        let (s, d) = (m(src.tile), m(dst.tile));
        let s_shape = &self.kernel.tile(s).shape;
        let d_shape = &self.kernel.tile(d).shape;
        let s_base: Vec<i64> = src.offsets.iter().map(|o| o.eval(&self.env)).collect();
        let d_base: Vec<i64> = dst.offsets.iter().map(|o| o.eval(&self.env)).collect();
        let n = src.numel().min(dst.numel());
        let data = self.mem.get(s);
        let mut writes = Vec::with_capacity(n as usize);
        for linear in 0..n {
            let si: Vec<i64> = unravel(linear, &src.extents)
                .zip(&s_base)
                .map(|(i, b)| i + b)
                .collect();
            let di: Vec<i64> = unravel(linear, &dst.extents)
                .zip(&d_base)
                .map(|(i, b)| i + b)
                .collect();
            // out-of-bounds reads are zero, out-of-bounds writes are dropped
            let value = linear_index(s_shape, &si).map_or(0.0, |i| data[i]);
            if let Some(i) = linear_index(d_shape, &di) {
                writes.push((d, i, value));
            }
        }
        writes
    }

    fn gemm(&self, a: (TileId, bool), b: (TileId, bool), c: TileId, clear: bool) -> Vec<Write> {
        let (ta, tb) = (self.kernel.tile(a.0), self.kernel.tile(b.0));
        let tc = self.kernel.tile(c);
        let (m, n) = (tc.rows() as usize, tc.cols() as usize);
        let k = (if a.1 { ta.rows() } else { ta.cols() }) as usize;
        let (a_cols, b_cols) = (ta.cols() as usize, tb.cols() as usize);
        let (da, db, dc) = (self.mem.get(a.0), self.mem.get(b.0), self.mem.get(c));
        let at = |i: usize, p: usize| {
            let ix = if a.1 { p * a_cols + i } else { i * a_cols + p };
            da.get(ix).copied().unwrap_or(0.0)
        };
        let bt = |p: usize, j: usize| {
            let ix = if b.1 { j * b_cols + p } else { p * b_cols + j };
            db.get(ix).copied().unwrap_or(0.0)
        };
        let mut writes = Vec::with_capacity(m * n);
        for i in 0..m {
            for j in 0..n {
                let init = if clear {
                    0.0
                } else {
                    dc.get(i * n + j).copied().unwrap_or(0.0)
                };
                let acc = (0..k).fold(init, |acc, p| acc + at(i, p) * bt(p, j));
                writes.push((c, i * n + j, acc));
            }
        }
        writes
    }

    fn expr(&self, e: &Expr, env: &Bindings, m: &impl Fn(TileId) -> TileId) -> f64 {
        match e {
            Expr::Const(c) => *c,
            Expr::Load(access) => {
                let t = m(access.tile);
                let idx: Vec<i64> = access.indices.iter().map(|a| a.eval(env)).collect();
                linear_index(&self.kernel.tile(t).shape, &idx).map_or(0.0, |i| self.mem.get(t)[i])
            }
            Expr::Unary(op, x) => {
                let x = self.expr(x, env, m);
                match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Relu => x.max(0.0),
                }
            }
            Expr::Binary(op, l, r) => {
                let (l, r) = (self.expr(l, env, m), self.expr(r, env, m));
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    BinaryOp::Max => l.max(r),
                    BinaryOp::Min => l.min(r),
                }
            }
            Expr::Cast(dtype, x) => {
                let x = self.expr(x, env, m);
                match dtype {
                    DType::I8 | DType::I32 => x.trunc(),
                    _ => x,
                }
            }
        }
    }
}

/// Row-major multi-index of `linear` within `extents`.
fn unravel(mut linear: u64, extents: &[u32]) -> impl Iterator<Item = i64> {
    let mut idx = vec![0i64; extents.len()];
    for (slot, &e) in idx.iter_mut().zip(extents).rev() {
        let e = e.max(1) as u64;
        *slot = (linear % e) as i64;
        linear /= e;
    }
    idx.into_iter()
}

fn linear_index(shape: &[u32], idx: &[i64]) -> Option<usize> {
    if shape.len() != idx.len() {
        return None;
    }
    let mut linear = 0usize;
    for (&d, &i) in shape.iter().zip(idx) {
        if i < 0 || i >= d as i64 {
            return None;
        }
        linear = linear * d as usize + i as usize;
    }
    Some(linear)
}
