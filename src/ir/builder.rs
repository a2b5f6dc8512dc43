//! Programmatic kernel construction.
//!
//! Ops are appended to the innermost open body; `pipelined` opens a new
//! body for the duration of its closure.

use super::{
    Affine, Assign, DType, Kernel, Op, OpId, OpKind, Rasterization, ReduceKind, Region, Scope,
    Tile, TileId,
};
use crate::layout::Layout;

/// Options for [`KernelBuilder::gemm_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GemmFlags {
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub clear_accum: bool,
}

pub struct KernelBuilder {
    kernel: Kernel,
    frames: Vec<Vec<Op>>,
}

impl KernelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            kernel: Kernel::new(name),
            frames: vec![Vec::new()],
        }
    }

    /// Grid extents; missing dimensions are 1.
    pub fn grid(mut self, dims: &[u32]) -> Self {
        self.kernel.grid = pad3(dims);
        self
    }

    /// Thread-block extents; missing dimensions are 1.
    pub fn threads(mut self, dims: &[u32]) -> Self {
        self.kernel.threads = pad3(dims);
        self
    }

    pub fn global(&mut self, name: &str, shape: &[u32], dtype: DType) -> TileId {
        self.kernel
            .add_tile(Tile::new(name, shape.to_vec(), dtype, Scope::Global))
    }

    pub fn alloc_shared(&mut self, name: &str, shape: &[u32], dtype: DType) -> TileId {
        self.alloc(name, shape, dtype, Scope::Shared)
    }

    pub fn alloc_fragment(&mut self, name: &str, shape: &[u32], dtype: DType) -> TileId {
        self.alloc(name, shape, dtype, Scope::Fragment)
    }

    fn alloc(&mut self, name: &str, shape: &[u32], dtype: DType, scope: Scope) -> TileId {
        let tile = self
            .kernel
            .add_tile(Tile::new(name, shape.to_vec(), dtype, scope));
        self.push(OpKind::Alloc { tile });
        tile
    }

    /// Pin a layout; inference validates it instead of resolving one.
    pub fn declare_layout(&mut self, tile: TileId, layout: Layout) {
        self.kernel.tile_mut(tile).declared = Some(layout);
    }

    pub fn shape(&self, tile: TileId) -> Vec<u32> {
        self.kernel.tile(tile).shape.clone()
    }

    /// The whole tile as a region.
    pub fn full(&self, tile: TileId) -> Region {
        Region::full(tile, &self.kernel.tile(tile).shape)
    }

    /// A window of `extents` starting at `offsets`.
    pub fn region(&self, tile: TileId, offsets: Vec<Affine>, extents: &[u32]) -> Region {
        Region::new(tile, offsets, extents.to_vec())
    }

    pub fn copy(&mut self, src: Region, dst: Region) -> OpId {
        self.push(OpKind::Copy {
            src,
            dst,
            coalesced_width: None,
        })
    }

    pub fn copy_coalesced(&mut self, src: Region, dst: Region, width: u32) -> OpId {
        self.push(OpKind::Copy {
            src,
            dst,
            coalesced_width: Some(width),
        })
    }

    pub fn fill(&mut self, tile: TileId, value: f64) -> OpId {
        self.push(OpKind::Fill { tile, value })
    }

    pub fn clear(&mut self, tile: TileId) -> OpId {
        self.fill(tile, 0.0)
    }

    pub fn gemm(&mut self, a: TileId, b: TileId, c: TileId) -> OpId {
        self.gemm_with(a, b, c, GemmFlags::default())
    }

    pub fn gemm_with(&mut self, a: TileId, b: TileId, c: TileId, flags: GemmFlags) -> OpId {
        self.push(OpKind::Gemm {
            a,
            b,
            c,
            transpose_a: flags.transpose_a,
            transpose_b: flags.transpose_b,
            clear_accum: flags.clear_accum,
        })
    }

    pub fn reduce(
        &mut self,
        src: TileId,
        dst: TileId,
        axis: usize,
        kind: ReduceKind,
        clear: bool,
    ) -> OpId {
        self.push(OpKind::Reduce {
            src,
            dst,
            axis,
            kind,
            clear,
        })
    }

    /// Elementwise loop; loop variables are named `p0`, `p1`, ... (see [`pvar`]).
    pub fn parallel(&mut self, extents: &[u32], body: Vec<Assign>) -> OpId {
        let vars = (0..extents.len()).map(|i| format!("p{}", i)).collect();
        self.push(OpKind::Parallel {
            vars,
            extents: extents.to_vec(),
            body,
        })
    }

    /// Open a pipelined loop over `var in 0..trip_count`; ops issued inside
    /// `body` land in the loop body.
    pub fn pipelined(
        &mut self,
        var: &str,
        trip_count: u64,
        stages: u32,
        body: impl FnOnce(&mut Self),
    ) -> OpId {
        self.frames.push(Vec::new());
        body(self);
        let ops = self.frames.pop().unwrap_or_default();
        self.push(OpKind::Pipelined {
            var: var.to_string(),
            trip_count,
            stages,
            body: ops,
            schedule: None,
        })
    }

    pub fn use_swizzle(&mut self, panel_size: u32, enable: bool) {
        self.kernel.rasterization = Some(Rasterization { panel_size, enable });
    }

    pub fn build(mut self) -> Kernel {
        while self.frames.len() > 1 {
            let stray = self.frames.pop().unwrap_or_default();
            if let Some(outer) = self.frames.last_mut() {
                outer.extend(stray);
            }
        }
        self.kernel.body = self.frames.pop().unwrap_or_default();
        self.kernel
    }

    fn push(&mut self, kind: OpKind) -> OpId {
        let id = self.kernel.fresh_op_id();
        if let Some(frame) = self.frames.last_mut() {
            frame.push(Op::new(id, kind));
        }
        id
    }
}

/// Loop variable `n` of the enclosing `parallel`.
pub fn pvar(n: usize) -> Affine {
    Affine::loop_var(&format!("p{}", n))
}

fn pad3(dims: &[u32]) -> [u32; 3] {
    let mut out = [1; 3];
    for (slot, &d) in out.iter_mut().zip(dims) {
        *slot = d;
    }
    out
}
