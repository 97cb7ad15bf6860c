//! Symmetric (peer-visible) staging buffers.
//!
//! The all-gather workspace is one slab per rank, every slab readable
//! by every rank. Row range `[rank * m_per_rank, (rank+1) * m_per_rank)`
//! of the gathered matrix has exactly one writer; readers must observe
//! the writer's readiness flag before touching that range.
//!
//! Values are f32 bit-stored in `AtomicU32` cells. Data accesses are
//! Relaxed on both sides; the happens-before edge comes exclusively
//! from the flag protocol in [`signal`](crate::signal), mirroring how
//! the device kernels pair plain loads/stores with an acquire wait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::matrix::Matrix;
use crate::signal::ReadyToken;

/// A peer-visible `[rows, cols]` f32 slab.
pub struct SymmetricBuffer {
    rows: usize,
    cols: usize,
    cells: Vec<AtomicU32>,
}

impl SymmetricBuffer {
    /// Allocate a zero-filled slab.
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: (0..rows * cols).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// The collective "one slab per rank, visible to all" allocation.
    ///
    /// Single-process stand-in for a symmetric-heap tensor list: every
    /// rank ends up holding handles to all `num_ranks` slabs.
    #[must_use]
    pub fn create_list(num_ranks: usize, rows: usize, cols: usize) -> Vec<Arc<Self>> {
        (0..num_ranks)
            .map(|_| Arc::new(Self::new(rows, cols)))
            .collect()
    }

    /// Row capacity of the slab.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count of the slab.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Write whole rows starting at `row0`.
    ///
    /// Caller must be the unique writer for this row range in the
    /// current phase, and must publish a flag afterwards for readers.
    ///
    /// # Panics
    /// Panics if `src` is not a whole number of rows or overflows the slab.
    pub fn write_rows(&self, row0: usize, src: &[f32]) {
        assert_eq!(src.len() % self.cols, 0, "src is not whole rows");
        let nrows = src.len() / self.cols;
        assert!(row0 + nrows <= self.rows, "row range out of bounds");
        let bits: &[u32] = bytemuck::cast_slice(src);
        let base = row0 * self.cols;
        for (cell, &b) in self.cells[base..base + src.len()].iter().zip(bits) {
            cell.store(b, Ordering::Relaxed);
        }
    }

    /// Read whole rows starting at `row0` into `dst`.
    ///
    /// Ordering contract: the caller must already hold a happens-before
    /// edge to the writer of these rows (a resolved flag wait or a
    /// barrier), otherwise the values read are unspecified.
    ///
    /// # Panics
    /// Panics if `dst` is not a whole number of rows or overflows the slab.
    pub fn read_rows(&self, row0: usize, dst: &mut [f32]) {
        assert_eq!(dst.len() % self.cols, 0, "dst is not whole rows");
        let nrows = dst.len() / self.cols;
        assert!(row0 + nrows <= self.rows, "row range out of bounds");
        let base = row0 * self.cols;
        let len = dst.len();
        for (d, cell) in dst.iter_mut().zip(&self.cells[base..base + len]) {
            *d = f32::from_bits(cell.load(Ordering::Relaxed));
        }
    }

    /// Relay whole rows from this slab into another at the same offset.
    ///
    /// Used by the transport engines to forward an already-published
    /// segment; same ordering contract as [`read_rows`](Self::read_rows).
    ///
    /// # Panics
    /// Panics if the range overflows either slab or the column counts differ.
    pub fn relay_rows_to(&self, dst: &SymmetricBuffer, row0: usize, nrows: usize) {
        assert_eq!(self.cols, dst.cols, "column mismatch");
        assert!(row0 + nrows <= self.rows && row0 + nrows <= dst.rows);
        let base = row0 * self.cols;
        let len = nrows * self.cols;
        for (s, d) in self.cells[base..base + len]
            .iter()
            .zip(&dst.cells[base..base + len])
        {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Token-gated tile load for the compute kernels.
    ///
    /// Fills `out` (`tile_rows * tile_cols`, row-major) from the block
    /// at (`row0`, `col0`), zero-masking rows at or beyond `row_limit`
    /// and columns beyond the slab width. Demanding a [`ReadyToken`]
    /// ties the load to a resolved readiness wait, the way the
    /// descriptor loads consume a wait token on device.
    ///
    /// # Panics
    /// Panics if `out` is not `tile_rows * tile_cols` long or
    /// `row_limit > rows`.
    #[allow(clippy::too_many_arguments)]
    pub fn read_tile(
        &self,
        _token: &ReadyToken,
        row0: usize,
        col0: usize,
        tile_rows: usize,
        tile_cols: usize,
        row_limit: usize,
        out: &mut [f32],
    ) {
        assert_eq!(out.len(), tile_rows * tile_cols);
        assert!(row_limit <= self.rows);
        for r in 0..tile_rows {
            let row = row0 + r;
            let dst = &mut out[r * tile_cols..(r + 1) * tile_cols];
            if row >= row_limit {
                dst.fill(0.0);
                continue;
            }
            let base = row * self.cols;
            for (c, d) in dst.iter_mut().enumerate() {
                let col = col0 + c;
                *d = if col < self.cols {
                    f32::from_bits(self.cells[base + col].load(Ordering::Relaxed))
                } else {
                    0.0
                };
            }
        }
    }

    /// Snapshot the first `nrows` rows as a [`Matrix`] (test/diagnostic use).
    ///
    /// # Panics
    /// Panics if `nrows > rows`.
    #[must_use]
    pub fn to_matrix(&self, nrows: usize) -> Matrix {
        let mut data = vec![0.0; nrows * self.cols];
        self.read_rows(0, &mut data);
        Matrix::from_vec(nrows, self.cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::FlagBuffer;

    #[test]
    fn write_then_read_rows() {
        let buf = SymmetricBuffer::new(4, 3);
        buf.write_rows(1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut out = vec![0.0; 6];
        buf.read_rows(1, &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // Untouched rows stay zero.
        let snap = buf.to_matrix(4);
        assert_eq!(snap.row(0), &[0.0, 0.0, 0.0]);
        assert_eq!(snap.row(3), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn relay_copies_segment() {
        let src = SymmetricBuffer::new(4, 2);
        let dst = SymmetricBuffer::new(4, 2);
        src.write_rows(2, &[7.0, 8.0, 9.0, 10.0]);
        src.relay_rows_to(&dst, 2, 2);
        let mut out = vec![0.0; 4];
        dst.read_rows(2, &mut out);
        assert_eq!(out, [7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn read_tile_masks_ragged_edges() {
        let buf = SymmetricBuffer::new(3, 3);
        buf.write_rows(0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let flags = FlagBuffer::all_set(1, 1);
        let token = flags.wait(0, 1);

        // 2x2 tile at (2, 2): only element (2,2) is in range with
        // row_limit == 3; the rest must be zero-masked.
        let mut out = vec![-1.0; 4];
        buf.read_tile(&token, 2, 2, 2, 2, 3, &mut out);
        assert_eq!(out, [9.0, 0.0, 0.0, 0.0]);

        // row_limit below capacity masks physically-present rows too.
        let mut out = vec![-1.0; 4];
        buf.read_tile(&token, 1, 0, 2, 2, 2, &mut out);
        assert_eq!(out, [4.0, 5.0, 0.0, 0.0]);
    }
}
