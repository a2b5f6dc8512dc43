//! Reference tile programs.

use serde::{Deserialize, Serialize};

use crate::ir::builder::{GemmFlags, KernelBuilder};
use crate::ir::{ceildiv, Affine, DType, Kernel};

/// Block-tiled `C = A · Bᵀ` (or `A · B`), the canonical pipelined kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatmulConfig {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub block_m: u32,
    pub block_n: u32,
    pub block_k: u32,
    pub stages: u32,
    pub threads: u32,
    pub dtype: DType,
    pub accum: DType,
    /// B is stored `(n, k)`.
    pub transpose_b: bool,
    pub rasterization: bool,
}

impl Default for MatmulConfig {
    fn default() -> Self {
        Self {
            m: 1024,
            n: 1024,
            k: 1024,
            block_m: 128,
            block_n: 128,
            block_k: 32,
            stages: 3,
            threads: 128,
            dtype: DType::F16,
            accum: DType::F32,
            transpose_b: true,
            rasterization: true,
        }
    }
}

/// Build the matmul program for `cfg`.
///
/// Block `(bx, by)` owns the `block_m × block_n` output tile at
/// `(by·block_m, bx·block_n)` and walks K in `block_k` steps through a
/// pipelined loop.
pub fn matmul(cfg: &MatmulConfig) -> Kernel {
    let mut b = KernelBuilder::new("matmul")
        .grid(&[ceildiv(cfg.n, cfg.block_n), ceildiv(cfg.m, cfg.block_m)])
        .threads(&[cfg.threads]);
    let (bm, bn, bk) = (cfg.block_m, cfg.block_n, cfg.block_k);

    let a = b.global("A", &[cfg.m, cfg.k], cfg.dtype);
    let b_shape = if cfg.transpose_b {
        [cfg.n, cfg.k]
    } else {
        [cfg.k, cfg.n]
    };
    let bg = b.global("B", &b_shape, cfg.dtype);
    let c = b.global("C", &[cfg.m, cfg.n], cfg.dtype);

    let a_shared = b.alloc_shared("A_shared", &[bm, bk], cfg.dtype);
    let b_tile = if cfg.transpose_b { [bn, bk] } else { [bk, bn] };
    let b_shared = b.alloc_shared("B_shared", &b_tile, cfg.dtype);
    let c_local = b.alloc_fragment("C_local", &[bm, bn], cfg.accum);

    b.use_swizzle(10, cfg.rasterization);
    b.clear(c_local);

    let row = Affine::block(1).scaled(bm as i64);
    let col = Affine::block(0).scaled(bn as i64);
    b.pipelined("k", ceildiv(cfg.k, bk) as u64, cfg.stages, |b| {
        let kk = Affine::loop_var("k").scaled(bk as i64);
        let src = b.region(a, vec![row.clone(), kk.clone()], &[bm, bk]);
        let dst = b.full(a_shared);
        b.copy(src, dst);

        let offsets = if cfg.transpose_b {
            vec![col.clone(), kk]
        } else {
            vec![kk, col.clone()]
        };
        let src = b.region(bg, offsets, &b_tile);
        let dst = b.full(b_shared);
        b.copy(src, dst);

        b.gemm_with(
            a_shared,
            b_shared,
            c_local,
            GemmFlags {
                transpose_b: cfg.transpose_b,
                ..GemmFlags::default()
            },
        );
    });

    let src = b.full(c_local);
    let dst = b.region(c, vec![row, col], &[bm, bn]);
    b.copy(src, dst);
    b.build()
}
