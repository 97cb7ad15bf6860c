//! Non-persistent consumer GEMM kernel.
//!
//! One scheduling unit per output tile. Each unit maps its linear id
//! through the swizzle, blocks on the readiness flags of exactly the
//! rank range its row tile spans, runs the K loop, and writes its tile
//! once, masking ragged edges on both load and store. Accumulation is
//! f64 (higher precision than the f32 storage), product order strictly
//! ascending in K so every variant produces bitwise-identical output.

use rayon::prelude::*;

use crate::config::TileConfig;
use crate::signal::{FlagBuffer, ReadyToken};
use crate::swizzle::TileScheduler;
use crate::symm::SymmetricBuffer;
use crate::Matrix;

use super::{GemmDims, OutputSlab};

/// Accumulate one K-slice of the output tile at (`row0`, `col0`).
///
/// `a_buf` is scratch for the `block_m x block_k` A tile; `acc` is the
/// `block_m x block_n` f64 accumulator.
#[allow(clippy::too_many_arguments)]
pub(super) fn accumulate_k_slice(
    ws: &SymmetricBuffer,
    b: &Matrix,
    token: &ReadyToken,
    cfg: &TileConfig,
    dims: GemmDims,
    row0: usize,
    col0: usize,
    tile_rows: usize,
    tile_cols: usize,
    k0: usize,
    a_buf: &mut [f32],
    acc: &mut [f64],
) {
    ws.read_tile(token, row0, k0, cfg.block_m, cfg.block_k, dims.m, a_buf);
    let kc = cfg.block_k.min(dims.k - k0);
    let b_data = b.as_slice();
    for i in 0..tile_rows {
        let a_row = &a_buf[i * cfg.block_k..i * cfg.block_k + kc];
        let acc_row = &mut acc[i * cfg.block_n..i * cfg.block_n + tile_cols];
        for (j, acc_ij) in acc_row.iter_mut().enumerate() {
            let b_row = &b_data[(col0 + j) * dims.k + k0..][..kc];
            for (a_v, b_v) in a_row.iter().zip(b_row) {
                *acc_ij += f64::from(*a_v) * f64::from(*b_v);
            }
        }
    }
}

/// Convert the accumulator to f32 and store the tile, optionally as
/// two half-width epilogue subtiles.
#[allow(clippy::too_many_arguments)]
pub(super) fn store_tile(
    c: &OutputSlab,
    acc: &[f64],
    cfg: &TileConfig,
    row0: usize,
    col0: usize,
    tile_rows: usize,
    tile_cols: usize,
) {
    let out: Vec<f32> = acc.iter().map(|&v| v as f32).collect();
    // SAFETY: the scheduler assigns each tile to exactly one unit and
    // the masked extents keep the block in bounds.
    if cfg.epilogue_subtile {
        let half = cfg.block_n / 2;
        let left = tile_cols.min(half);
        unsafe {
            c.write_tile(row0, col0, tile_rows, left, &out, cfg.block_n);
            if tile_cols > half {
                c.write_tile(
                    row0,
                    col0 + half,
                    tile_rows,
                    tile_cols - half,
                    &out[half..],
                    cfg.block_n,
                );
            }
        }
    } else {
        unsafe {
            c.write_tile(row0, col0, tile_rows, tile_cols, &out, cfg.block_n);
        }
    }
}

/// Run the non-persistent kernel: grid of `num_tiles` units, one tile
/// each, executed as Rayon tasks. Units whose flags are already up
/// proceed immediately; the rest spin in-kernel without blocking them.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_non_persistent(
    ws: &SymmetricBuffer,
    b: &Matrix,
    c: &OutputSlab,
    dims: GemmDims,
    flags: &FlagBuffer,
    sched: &TileScheduler,
    cfg: &TileConfig,
    ready_value: u32,
) {
    let k_tiles = dims.k.div_ceil(cfg.block_k);
    (0..sched.num_tiles()).into_par_iter().for_each(|id| {
        let (pid_m, pid_n) = sched.tile(id);
        let (rank_beg, rank_end) = sched.rank_range(pid_m);
        // Block on exactly the segment range this row tile spans.
        let token = flags.wait_range(rank_beg, rank_end - rank_beg + 1, ready_value);

        let row0 = pid_m * cfg.block_m;
        let col0 = pid_n * cfg.block_n;
        let tile_rows = cfg.block_m.min(dims.m - row0);
        let tile_cols = cfg.block_n.min(dims.n - col0);

        let mut a_buf = vec![0.0f32; cfg.block_m * cfg.block_k];
        let mut acc = vec![0.0f64; cfg.block_m * cfg.block_n];
        for kt in 0..k_tiles {
            accumulate_k_slice(
                ws,
                b,
                &token,
                cfg,
                dims,
                row0,
                col0,
                tile_rows,
                tile_cols,
                kt * cfg.block_k,
                &mut a_buf,
                &mut acc,
            );
        }
        store_tile(c, &acc, cfg, row0, col0, tile_rows, tile_cols);
    });
}
