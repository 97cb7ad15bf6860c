//! Whole-matrix driver: shard, run the fused call on every rank,
//! reassemble.

use tracing::info;

use tilegather::{ContextOptions, Error, Matrix, Result};

use crate::group::RankGroup;

/// Build-once run-many engine for full `C = A x Bᵀ` products.
///
/// A is sharded by rows across ranks and gathered inside the fused
/// call; B is sharded by rows (output columns), so each rank produces
/// a `[M, n_per_rank]` column strip and the engine concatenates the
/// strips.
pub struct AgGemmEngine {
    group: RankGroup,
    k: usize,
}

impl AgGemmEngine {
    /// # Errors
    /// Propagates context-group construction errors.
    pub fn new(
        num_ranks: usize,
        ranks_per_node: usize,
        k: usize,
        opts: ContextOptions,
    ) -> Result<Self> {
        Ok(Self {
            group: RankGroup::new(num_ranks, ranks_per_node, k, opts)?,
            k,
        })
    }

    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.group.num_ranks()
    }

    /// Multiply full matrices, distributing the work over the group.
    ///
    /// # Errors
    /// Rejects shapes whose M or N do not divide evenly over the
    /// ranks, or whose K differs from the engine's.
    pub fn multiply(&mut self, a: &Matrix, b: &Matrix, persistent: bool) -> Result<Matrix> {
        let num_ranks = self.group.num_ranks();
        if a.cols() != self.k || b.cols() != self.k {
            return Err(Error::ShapeMismatch {
                expected: vec![a.rows(), self.k],
                got: vec![a.rows(), a.cols().max(b.cols())],
            });
        }
        if a.rows() % num_ranks != 0 || b.rows() % num_ranks != 0 {
            return Err(Error::InvalidShape(format!(
                "M={} and N={} must divide evenly over {num_ranks} ranks",
                a.rows(),
                b.rows()
            )));
        }

        let a_shards = shard_rows(a, num_ranks);
        let b_shards = shard_rows(b, num_ranks);
        let strips = self
            .group
            .run(|rank, ctx| ctx.ag_gemm(&a_shards[rank], &b_shards[rank], persistent))?;
        info!(
            m = a.rows(),
            n = b.rows(),
            k = self.k,
            persistent,
            "fused multiply complete"
        );
        Ok(concat_cols(&strips))
    }
}

/// Split a matrix into `parts` equal row blocks.
#[must_use]
pub fn shard_rows(m: &Matrix, parts: usize) -> Vec<Matrix> {
    assert_eq!(m.rows() % parts, 0);
    let rows_per = m.rows() / parts;
    (0..parts)
        .map(|p| {
            let start = p * rows_per * m.cols();
            Matrix::from_vec(
                rows_per,
                m.cols(),
                m.as_slice()[start..start + rows_per * m.cols()].to_vec(),
            )
        })
        .collect()
}

/// Concatenate equal-height column strips into one matrix.
#[must_use]
pub fn concat_cols(strips: &[Matrix]) -> Matrix {
    let rows = strips[0].rows();
    let cols: usize = strips.iter().map(Matrix::cols).sum();
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for s in strips {
            data.extend_from_slice(s.row(r));
        }
    }
    Matrix::from_vec(rows, cols, data)
}
