//! Wall-clock search over tile configurations.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use tilegather::{ContextOptions, Matrix, Result, TileConfig};

use crate::engine::AgGemmEngine;

/// Outcome of a tuning run: the winning configuration and its best
/// observed per-call time.
#[derive(Debug, Clone, Serialize)]
pub struct TuneReport {
    pub config: TileConfig,
    pub elapsed: Duration,
}

/// Problem shape to tune for.
#[derive(Debug, Clone, Copy)]
pub struct TuneShape {
    pub num_ranks: usize,
    pub ranks_per_node: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Time every candidate [`TileConfig`] on the given shape and return
/// the fastest.
///
/// One warmup call per candidate, then the minimum over `iters` timed
/// calls. Tile parameters are fixed at context construction, so each
/// candidate gets its own engine.
///
/// # Errors
/// Propagates engine construction and call errors; rejects shapes that
/// do not shard evenly.
pub fn autotune(shape: TuneShape, persistent: bool, iters: usize) -> Result<TuneReport> {
    let a = patterned(shape.m, shape.k);
    let b = patterned(shape.n, shape.k);

    let mut best: Option<TuneReport> = None;
    for config in TileConfig::candidates() {
        let opts = ContextOptions {
            max_m: shape.m,
            tile: config,
            ..ContextOptions::default()
        };
        let mut engine = AgGemmEngine::new(shape.num_ranks, shape.ranks_per_node, shape.k, opts)?;
        engine.multiply(&a, &b, persistent)?;

        let mut elapsed = Duration::MAX;
        for _ in 0..iters.max(1) {
            let start = Instant::now();
            engine.multiply(&a, &b, persistent)?;
            elapsed = elapsed.min(start.elapsed());
        }
        info!(?config, ?elapsed, "candidate timed");
        if best.as_ref().map_or(true, |r| elapsed < r.elapsed) {
            best = Some(TuneReport { config, elapsed });
        }
    }
    // candidates() is never empty
    best.ok_or_else(|| tilegather::Error::Other("no tile candidates".into()))
}

/// Deterministic non-constant fill so timed calls touch real data.
fn patterned(rows: usize, cols: usize) -> Matrix {
    let data = (0..rows * cols)
        .map(|i| ((i * 31 + 7) % 17) as f32 * 0.25 - 2.0)
        .collect();
    Matrix::from_vec(rows, cols, data)
}
