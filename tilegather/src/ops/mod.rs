//! Kernels and per-call device operations.
//!
//! `publish` is the local-shard copy + flag bracket that opens every
//! fused call; `gemm` and `gemm_persistent` are the two consumer
//! kernel variants. The gemm-only entry points run the kernels over a
//! pre-gathered A with an always-ready flag buffer, which is how the
//! kernel tests isolate compute from transport.

mod gemm;
mod gemm_persistent;
mod publish;

pub(crate) use gemm::run_non_persistent;
pub(crate) use gemm_persistent::run_persistent;
pub use publish::{publish_local_shard_inter, publish_local_shard_intra};

use std::cell::UnsafeCell;

use crate::config::TileConfig;
use crate::matrix::Matrix;
use crate::signal::FlagBuffer;
use crate::swizzle::TileScheduler;
use crate::symm::SymmetricBuffer;
use crate::topology::RankLayout;
use crate::{Error, Result};

/// Output dimensions of one fused call: C is `[m, n]`, the K reduction
/// runs over `k`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GemmDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Shared output buffer for C, written tile-by-tile from concurrent
/// scheduling units.
pub(crate) struct OutputSlab {
    rows: usize,
    cols: usize,
    data: UnsafeCell<Vec<f32>>,
}

// SAFETY: every output tile has exactly one writer. The scheduler
// mapping is a bijection over tiles, and each scheduling unit writes
// only its own tile through `write_tile`. Readers appear only after
// the stream join, via `into_matrix`.
unsafe impl Sync for OutputSlab {}

impl OutputSlab {
    pub(crate) fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: UnsafeCell::new(vec![0.0; rows * cols]),
        }
    }

    /// Write a `tile_rows x tile_cols` block at (`row0`, `col0`) from
    /// `src`, which is strided by `src_stride` (≥ `tile_cols`).
    ///
    /// # Safety
    /// The caller must be the unique writer of this tile for the
    /// lifetime of the slab, and the block must be in bounds.
    pub(crate) unsafe fn write_tile(
        &self,
        row0: usize,
        col0: usize,
        tile_rows: usize,
        tile_cols: usize,
        src: &[f32],
        src_stride: usize,
    ) {
        debug_assert!(row0 + tile_rows <= self.rows && col0 + tile_cols <= self.cols);
        debug_assert!(src_stride >= tile_cols);
        let data = &mut *self.data.get();
        for r in 0..tile_rows {
            let dst = (row0 + r) * self.cols + col0;
            data[dst..dst + tile_cols].copy_from_slice(&src[r * src_stride..][..tile_cols]);
        }
    }

    pub(crate) fn into_matrix(self) -> Matrix {
        Matrix::from_vec(self.rows, self.cols, self.data.into_inner())
    }
}

/// Validate one fused call's shapes before any work is issued.
///
/// A is `[m_per_rank, k]` row-major, B is `[n_per_rank, k]` row-major
/// (used transposed). Rejection here is the only failure surface;
/// past this point the call either completes or hangs on a missing
/// peer.
pub(crate) fn validate_shapes(
    a: &Matrix,
    b: &Matrix,
    num_ranks: usize,
    workspace: &SymmetricBuffer,
) -> Result<GemmDims> {
    if a.cols() != b.cols() {
        return Err(Error::ShapeMismatch {
            expected: vec![b.rows(), a.cols()],
            got: vec![b.rows(), b.cols()],
        });
    }
    if a.rows() == 0 || b.rows() == 0 {
        return Err(Error::InvalidShape("empty shard".into()));
    }
    if a.cols() != workspace.cols() {
        return Err(Error::ShapeMismatch {
            expected: vec![a.rows(), workspace.cols()],
            got: vec![a.rows(), a.cols()],
        });
    }
    let m = a.rows() * num_ranks;
    if m > workspace.rows() {
        return Err(Error::InvalidShape(format!(
            "gathered M {m} exceeds workspace capacity {}",
            workspace.rows()
        )));
    }
    Ok(GemmDims {
        m,
        n: b.rows(),
        k: a.cols(),
    })
}

/// Plain tiled GEMM over a fully-resident A: `C = A x Bᵀ`.
///
/// Runs the non-persistent consumer kernel with an always-ready flag
/// buffer, so no wait ever blocks. A is `[m, k]`, B is `[n, k]`.
///
/// # Errors
/// Returns an error on a K mismatch or invalid tile config.
pub fn gemm_only_non_persistent(a: &Matrix, b: &Matrix, cfg: &TileConfig) -> Result<Matrix> {
    gemm_only(a, b, cfg, false)
}

/// Plain tiled GEMM over a fully-resident A, persistent variant.
///
/// # Errors
/// Returns an error on a K mismatch or invalid tile config.
pub fn gemm_only_persistent(a: &Matrix, b: &Matrix, cfg: &TileConfig) -> Result<Matrix> {
    gemm_only(a, b, cfg, true)
}

fn gemm_only(a: &Matrix, b: &Matrix, cfg: &TileConfig, persistent: bool) -> Result<Matrix> {
    cfg.validate()?;
    if a.cols() != b.cols() {
        return Err(Error::ShapeMismatch {
            expected: vec![b.rows(), a.cols()],
            got: vec![b.rows(), b.cols()],
        });
    }
    let dims = GemmDims {
        m: a.rows(),
        n: b.rows(),
        k: a.cols(),
    };
    let ws = SymmetricBuffer::new(a.rows(), a.cols());
    ws.write_rows(0, a.as_slice());
    // Single logical owner of all of A; nothing to wait for.
    let flags = FlagBuffer::all_set(1, 1);
    let layout = RankLayout::single_node(0, 1)?;
    let sched = TileScheduler::new(dims.m, dims.n, dims.m, cfg, layout, false);
    let c = OutputSlab::new(dims.m, dims.n);
    if persistent {
        run_persistent(&ws, b, &c, dims, &flags, &sched, cfg, 1);
    } else {
        run_non_persistent(&ws, b, &c, dims, &flags, &sched, cfg, 1);
    }
    Ok(c.into_matrix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix {
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Matrix::from_vec(rows, cols, data)
    }

    /// f64-accumulated reference for `C = A x Bᵀ`, same summation
    /// order as the kernels.
    fn reference(a: &Matrix, b: &Matrix) -> Matrix {
        let mut c = Matrix::zeros(a.rows(), b.rows());
        for i in 0..a.rows() {
            for j in 0..b.rows() {
                let mut acc = 0.0f64;
                for kk in 0..a.cols() {
                    acc += f64::from(a.at(i, kk)) * f64::from(b.at(j, kk));
                }
                c.as_mut_slice()[i * b.rows() + j] = acc as f32;
            }
        }
        c
    }

    fn check(m: usize, n: usize, k: usize, cfg: &TileConfig) {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_matrix(&mut rng, m, k);
        let b = random_matrix(&mut rng, n, k);
        let expect = reference(&a, &b);
        let got_np = gemm_only_non_persistent(&a, &b, cfg).unwrap();
        let got_p = gemm_only_persistent(&a, &b, cfg).unwrap();
        assert_eq!(got_np, expect, "non-persistent {m}x{n}x{k}");
        assert_eq!(got_p, expect, "persistent {m}x{n}x{k}");
    }

    #[test]
    fn kernels_match_reference_aligned() {
        check(64, 32, 64, &TileConfig::default());
    }

    #[test]
    fn kernels_match_reference_ragged() {
        // Every dimension off the tile grid.
        let cfg = TileConfig {
            block_m: 16,
            block_n: 16,
            block_k: 16,
            ..TileConfig::default()
        };
        check(130, 37, 45, &cfg);
        check(5, 3, 70, &cfg);
    }

    #[test]
    fn epilogue_subtile_store_is_identical() {
        let cfg = TileConfig {
            epilogue_subtile: true,
            ..TileConfig::default()
        };
        check(64, 48, 32, &cfg);
        check(67, 48, 33, &cfg);
    }

    #[test]
    fn k_mismatch_rejected() {
        let a = Matrix::zeros(4, 8);
        let b = Matrix::zeros(4, 9);
        assert!(matches!(
            gemm_only_non_persistent(&a, &b, &TileConfig::default()),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
