//! Tile-operation IR.
//!
//! A `Kernel` is a symbol table of tiles plus an ordered list of tile
//! operations. Structural ops (`Pipelined`) carry nested bodies. Each pass
//! takes the kernel by value, annotates it, and hands it to the next:
//!
//! ```text
//! Kernel ─infer─▶ tiles get layouts ─schedule─▶ loops get StagedLoop ─select─▶ ops get Strategy
//! ```

pub mod builder;
pub mod display;
pub mod visit;


use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::layout::Layout;
use crate::schedule::StagedLoop;
use crate::select::Strategy;

// ─── Identifiers ───────────────────────────────────────────────────

/// Index into `Kernel::tiles`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u32);

/// Stable operation identity, unique within a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u32);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

// ─── Element types and scopes ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            DType::I8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I32 => "i32",
        }
    }

    pub fn is_float(self) -> bool {
        !matches!(self, DType::I8 | DType::I32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    /// Accepts both short names and the long names used by kernel authors
    /// ("float16", "float", "int8", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f32" | "float32" | "float" => Ok(DType::F32),
            "f64" | "float64" | "double" => Ok(DType::F64),
            "i8" | "int8" => Ok(DType::I8),
            "i32" | "int32" | "int" => Ok(DType::I32),
            other => Err(format!("unknown element type '{}'", other)),
        }
    }
}

/// Where a tile lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Device memory; always row-major.
    Global,
    /// Block-local on-chip memory, subject to bank conflicts.
    Shared,
    /// Per-thread registers.
    Fragment,
}

impl Scope {
    pub fn is_on_chip(self) -> bool {
        !matches!(self, Scope::Global)
    }

    pub fn name(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Shared => "shared",
            Scope::Fragment => "fragment",
        }
    }
}

// ─── Tiles ─────────────────────────────────────────────────────────

/// A named, typed, rectangular buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub name: String,
    pub shape: Vec<u32>,
    pub dtype: DType,
    pub scope: Scope,
    /// User-declared layout. When present, inference validates it instead
    /// of resolving a new one.
    #[serde(default)]
    pub declared: Option<Layout>,
    /// Layout resolved by inference.
    #[serde(default)]
    pub layout: Option<Layout>,
}

impl Tile {
    pub fn new(name: impl Into<String>, shape: Vec<u32>, dtype: DType, scope: Scope) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            scope,
            declared: None,
            layout: None,
        }
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// Rows of the 2-D view (product of all leading dimensions).
    pub fn rows(&self) -> u32 {
        let n = self.shape.len();
        if n <= 1 {
            1
        } else {
            self.shape[..n - 1].iter().product()
        }
    }

    /// Columns of the 2-D view (innermost extent).
    pub fn cols(&self) -> u32 {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Bytes occupied by the tile, including layout padding when resolved.
    pub fn footprint_bytes(&self) -> u64 {
        let elems = self
            .layout
            .as_ref()
            .map(|l| l.footprint())
            .unwrap_or_else(|| self.numel());
        elems * self.dtype.bytes() as u64
    }
}

// ─── Index expressions ─────────────────────────────────────────────

/// A variable an index expression can refer to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Var {
    /// A loop variable (pipelined or parallel) by name.
    Loop(String),
    /// Block index along grid dimension 0, 1 or 2.
    Block(u8),
}

/// `constant + Σ coeff·var`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affine {
    pub constant: i64,
    #[serde(default)]
    pub terms: Vec<(Var, i64)>,
}

impl Affine {
    pub fn constant(c: i64) -> Self {
        Self {
            constant: c,
            terms: Vec::new(),
        }
    }

    pub fn var(var: Var) -> Self {
        Self {
            constant: 0,
            terms: vec![(var, 1)],
        }
    }

    pub fn loop_var(name: &str) -> Self {
        Self::var(Var::Loop(name.to_string()))
    }

    pub fn block(dim: u8) -> Self {
        Self::var(Var::Block(dim))
    }

    pub fn scaled(mut self, k: i64) -> Self {
        self.constant *= k;
        for (_, c) in &mut self.terms {
            *c *= k;
        }
        self
    }

    pub fn plus(mut self, other: Affine) -> Self {
        self.constant += other.constant;
        for (v, c) in other.terms {
            match self.terms.iter_mut().find(|(w, _)| *w == v) {
                Some((_, existing)) => *existing += c,
                None => self.terms.push((v, c)),
            }
        }
        self.terms.retain(|(_, c)| *c != 0);
        self
    }

    pub fn offset(self, c: i64) -> Self {
        self.plus(Affine::constant(c))
    }

    /// Coefficient of a loop variable (0 when absent).
    pub fn coefficient(&self, name: &str) -> i64 {
        self.terms
            .iter()
            .filter(|(v, _)| matches!(v, Var::Loop(n) if n == name))
            .map(|(_, c)| *c)
            .sum()
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.coefficient(name) != 0
    }

    pub fn eval(&self, env: &Bindings) -> i64 {
        self.terms
            .iter()
            .map(|(v, c)| c * env.value(v))
            .sum::<i64>()
            + self.constant
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (v, c) in &self.terms {
            let name = match v {
                Var::Loop(n) => n.clone(),
                Var::Block(d) => ["bx", "by", "bz"][(*d as usize).min(2)].to_string(),
            };
            if *c == 1 {
                parts.push(name);
            } else {
                parts.push(format!("{}*{}", name, c));
            }
        }
        if self.constant != 0 || parts.is_empty() {
            parts.push(self.constant.to_string());
        }
        f.write_str(&parts.join("+"))
    }
}

/// Variable values for evaluating `Affine` expressions.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    loops: BTreeMap<String, i64>,
    blocks: [i64; 3],
}

impl Bindings {
    pub fn with_block(block: [u32; 3]) -> Self {
        Self {
            loops: BTreeMap::new(),
            blocks: [block[0] as i64, block[1] as i64, block[2] as i64],
        }
    }

    pub fn bind(&mut self, name: &str, value: i64) {
        self.loops.insert(name.to_string(), value);
    }

    pub fn unbind(&mut self, name: &str) {
        self.loops.remove(name);
    }

    pub fn value(&self, var: &Var) -> i64 {
        match var {
            Var::Loop(n) => self.loops.get(n).copied().unwrap_or(0),
            Var::Block(d) => self.blocks[(*d as usize).min(2)],
        }
    }
}

/// A rectangular window into a tile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub tile: TileId,
    pub offsets: Vec<Affine>,
    pub extents: Vec<u32>,
}

impl Region {
    pub fn new(tile: TileId, offsets: Vec<Affine>, extents: Vec<u32>) -> Self {
        Self {
            tile,
            offsets,
            extents,
        }
    }

    /// The whole tile.
    pub fn full(tile: TileId, shape: &[u32]) -> Self {
        Self {
            tile,
            offsets: vec![Affine::constant(0); shape.len()],
            extents: shape.to_vec(),
        }
    }

    pub fn numel(&self) -> u64 {
        self.extents.iter().map(|&e| e as u64).product()
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.offsets.iter().any(|o| o.depends_on(name))
    }

    /// True when the region covers the whole tile of the given shape.
    pub fn covers(&self, shape: &[u32]) -> bool {
        self.extents == shape && self.offsets.iter().all(|o| *o == Affine::constant(0))
    }
}

// ─── Elementwise expressions ───────────────────────────────────────

/// An indexed element access inside a parallel loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Access {
    pub tile: TileId,
    pub indices: Vec<Affine>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Relu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    Load(Access),
    Const(f64),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cast(DType, Box<Expr>),
}

impl Expr {
    pub fn load(tile: TileId, indices: Vec<Affine>) -> Self {
        Expr::Load(Access { tile, indices })
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn unary(op: UnaryOp, e: Expr) -> Self {
        Expr::Unary(op, Box::new(e))
    }

    /// Every element access in the expression, left to right.
    pub fn loads(&self) -> Vec<&Access> {
        let mut out = Vec::new();
        self.collect_loads(&mut out);
        out
    }

    fn collect_loads<'a>(&'a self, out: &mut Vec<&'a Access>) {
        match self {
            Expr::Load(a) => out.push(a),
            Expr::Const(_) => {}
            Expr::Unary(_, e) | Expr::Cast(_, e) => e.collect_loads(out),
            Expr::Binary(_, l, r) => {
                l.collect_loads(out);
                r.collect_loads(out);
            }
        }
    }

    pub(crate) fn loads_mut(&mut self) -> Vec<&mut Access> {
        let mut out = Vec::new();
        self.collect_loads_mut(&mut out);
        out
    }

    fn collect_loads_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Access>) {
        match self {
            Expr::Load(a) => out.push(a),
            Expr::Const(_) => {}
            Expr::Unary(_, e) | Expr::Cast(_, e) => e.collect_loads_mut(out),
            Expr::Binary(_, l, r) => {
                l.collect_loads_mut(out);
                r.collect_loads_mut(out);
            }
        }
    }
}

/// `dst[indices] = value` at every point of a parallel iteration space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    pub dst: Access,
    pub value: Expr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

impl ReduceKind {
    pub fn identity(self) -> f64 {
        match self {
            ReduceKind::Sum => 0.0,
            ReduceKind::Max => f64::NEG_INFINITY,
            ReduceKind::Min => f64::INFINITY,
        }
    }

    pub fn combine(self, acc: f64, x: f64) -> f64 {
        match self {
            ReduceKind::Sum => acc + x,
            ReduceKind::Max => acc.max(x),
            ReduceKind::Min => acc.min(x),
        }
    }
}

// ─── Operations ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Bring an on-chip tile into existence for the enclosing kernel.
    Alloc { tile: TileId },
    /// Copy a region; extents of `src` and `dst` match.
    Copy {
        src: Region,
        dst: Region,
        /// Elements each thread moves per access, when the author pins it.
        #[serde(default)]
        coalesced_width: Option<u32>,
    },
    /// Set every element of a tile (`clear` is `Fill` with 0).
    Fill { tile: TileId, value: f64 },
    /// Elementwise body over an iteration space.
    Parallel {
        vars: Vec<String>,
        extents: Vec<u32>,
        body: Vec<Assign>,
    },
    /// `c (+)= op(a) · op(b)`.
    Gemm {
        a: TileId,
        b: TileId,
        c: TileId,
        #[serde(default)]
        transpose_a: bool,
        #[serde(default)]
        transpose_b: bool,
        #[serde(default)]
        clear_accum: bool,
    },
    /// Reduce a 2-D tile along `axis` into a 1-D tile.
    Reduce {
        src: TileId,
        dst: TileId,
        axis: usize,
        kind: ReduceKind,
        #[serde(default)]
        clear: bool,
    },
    /// Loop over `0..trip_count` software-pipelined with `stages` buffers.
    Pipelined {
        var: String,
        trip_count: u64,
        stages: u32,
        body: Vec<Op>,
        #[serde(default)]
        schedule: Option<StagedLoop>,
    },
    /// Layout-changing local copy, inserted by inference.
    Relayout { src: TileId, dst: TileId },
}

impl OpKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpKind::Alloc { .. } => "alloc",
            OpKind::Copy { .. } => "copy",
            OpKind::Fill { .. } => "fill",
            OpKind::Parallel { .. } => "parallel",
            OpKind::Gemm { .. } => "gemm",
            OpKind::Reduce { .. } => "reduce",
            OpKind::Pipelined { .. } => "pipelined",
            OpKind::Relayout { .. } => "relayout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    /// Chosen by instruction selection.
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

impl Op {
    pub fn new(id: OpId, kind: OpKind) -> Self {
        Self {
            id,
            kind,
            strategy: None,
        }
    }
}

/// Block launch-order remapping for L2 locality (`raster`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rasterization {
    pub panel_size: u32,
    pub enable: bool,
}

// ─── Kernel ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub name: String,
    /// Grid extents (blocks), padded to three dimensions.
    pub grid: [u32; 3],
    /// Thread-block extents, padded to three dimensions.
    pub threads: [u32; 3],
    pub tiles: Vec<Tile>,
    pub body: Vec<Op>,
    #[serde(default)]
    pub rasterization: Option<Rasterization>,
    /// Next unused op id.
    #[serde(default)]
    pub next_op: u32,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grid: [1, 1, 1],
            threads: [128, 1, 1],
            tiles: Vec::new(),
            body: Vec::new(),
            rasterization: None,
            next_op: 0,
        }
    }

    pub fn num_threads(&self) -> u32 {
        self.threads.iter().product()
    }

    pub fn num_blocks(&self) -> u64 {
        self.grid.iter().map(|&g| g as u64).product()
    }

    pub fn tile(&self, id: TileId) -> &Tile {
        &self.tiles[id.0 as usize]
    }

    pub fn tile_mut(&mut self, id: TileId) -> &mut Tile {
        &mut self.tiles[id.0 as usize]
    }

    pub fn get_tile(&self, id: TileId) -> Option<&Tile> {
        self.tiles.get(id.0 as usize)
    }

    pub fn find_tile(&self, name: &str) -> Option<TileId> {
        self.tiles
            .iter()
            .position(|t| t.name == name)
            .map(|i| TileId(i as u32))
    }

    pub fn add_tile(&mut self, tile: Tile) -> TileId {
        self.tiles.push(tile);
        TileId(self.tiles.len() as u32 - 1)
    }

    pub fn fresh_op_id(&mut self) -> OpId {
        let id = OpId(self.next_op);
        self.next_op += 1;
        id
    }

    /// Find an operation anywhere in the kernel, including loop bodies.
    pub fn find_op(&self, id: OpId) -> Option<&Op> {
        visit::find_op(&self.body, id)
    }

    pub fn find_op_mut(&mut self, id: OpId) -> Option<&mut Op> {
        visit::find_op_mut(&mut self.body, id)
    }

    /// All operations in program order, loop bodies flattened after their loop.
    pub fn ops(&self) -> Vec<&Op> {
        let mut out = Vec::new();
        visit::walk(&self.body, &mut |op| out.push(op));
        out
    }
}

/// Integer division rounding up, used for grid extents.
pub fn ceildiv(a: u32, b: u32) -> u32 {
    a.div_ceil(b.max(1))
}
