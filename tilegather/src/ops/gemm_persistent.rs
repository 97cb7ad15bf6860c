//! Persistent consumer GEMM kernel.
//!
//! A fixed number of scheduling units (one per worker thread) each
//! loop over a flattened (tile, K-slice) iteration space, advancing to
//! their next output tile whenever the innermost K counter wraps. The
//! readiness wait is re-issued once per output tile, not per K slice,
//! and every A load takes the wait's [`ReadyToken`] as a data
//! dependency, so the load cannot be written before the flag condition
//! resolves.

use crate::config::TileConfig;
use crate::signal::FlagBuffer;
use crate::swizzle::TileScheduler;
use crate::symm::SymmetricBuffer;
use crate::Matrix;

use super::gemm::{accumulate_k_slice, store_tile};
use super::{GemmDims, OutputSlab};

/// Run the persistent kernel with `cfg.effective_workers()` units.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_persistent(
    ws: &SymmetricBuffer,
    b: &Matrix,
    c: &OutputSlab,
    dims: GemmDims,
    flags: &FlagBuffer,
    sched: &TileScheduler,
    cfg: &TileConfig,
    ready_value: u32,
) {
    let num_tiles = sched.num_tiles();
    let num_workers = cfg.effective_workers().min(num_tiles).max(1);
    let k_tiles = dims.k.div_ceil(cfg.block_k);

    std::thread::scope(|s| {
        for worker in 0..num_workers {
            s.spawn(move || {
                let tiles_for_worker =
                    num_tiles / num_workers + usize::from(worker < num_tiles % num_workers);

                let mut a_buf = vec![0.0f32; cfg.block_m * cfg.block_k];
                let mut acc = vec![0.0f64; cfg.block_m * cfg.block_n];

                let mut tile_id = worker;
                let mut first = true;
                let mut ki = k_tiles - 1;
                let mut token = None;
                let (mut row0, mut col0) = (0, 0);
                let (mut tile_rows, mut tile_cols) = (0, 0);

                for _ in 0..k_tiles * tiles_for_worker {
                    ki = if ki == k_tiles - 1 { 0 } else { ki + 1 };
                    if ki == 0 {
                        if first {
                            first = false;
                        } else {
                            tile_id += num_workers;
                        }
                        let (pid_m, pid_n) = sched.tile(tile_id);
                        let (rank_beg, rank_end) = sched.rank_range(pid_m);
                        // Wait amortized per output tile.
                        token =
                            Some(flags.wait_range(rank_beg, rank_end - rank_beg + 1, ready_value));
                        row0 = pid_m * cfg.block_m;
                        col0 = pid_n * cfg.block_n;
                        tile_rows = cfg.block_m.min(dims.m - row0);
                        tile_cols = cfg.block_n.min(dims.n - col0);
                    }
                    let token = token.as_ref().expect("K loop entered before tile wait");
                    accumulate_k_slice(
                        ws,
                        b,
                        token,
                        cfg,
                        dims,
                        row0,
                        col0,
                        tile_rows,
                        tile_cols,
                        ki * cfg.block_k,
                        &mut a_buf,
                        &mut acc,
                    );
                    if ki == k_tiles - 1 {
                        store_tile(c, &acc, cfg, row0, col0, tile_rows, tile_cols);
                        acc.fill(0.0);
                    }
                }
            });
        }
    });
}
