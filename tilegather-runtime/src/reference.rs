//! Dense reference GEMM for correctness checks.

use rayon::prelude::*;
use tilegather::Matrix;

/// `C = A x Bᵀ` with f64 accumulation in ascending K order.
///
/// This matches the fused kernels' accumulation order exactly, so
/// outputs compare bitwise equal rather than within a tolerance.
#[must_use]
pub fn matmul_nt(a: &Matrix, b: &Matrix) -> Matrix {
    assert_eq!(a.cols(), b.cols(), "inner dimensions must agree");
    let (m, n, k) = (a.rows(), b.rows(), a.cols());
    let mut out = vec![0.0f32; m * n];
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = a.row(i);
        for (j, cell) in row.iter_mut().enumerate() {
            let b_row = b.row(j);
            let mut acc = 0.0f64;
            for kk in 0..k {
                acc += f64::from(a_row[kk]) * f64::from(b_row[kk]);
            }
            *cell = acc as f32;
        }
    });
    Matrix::from_vec(m, n, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_times_anything() {
        let eye = Matrix::from_vec(3, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        let b = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let c = matmul_nt(&eye, &b);
        // C[i][j] = eye_row_i . b_row_j = b[j][i]
        assert_eq!(c.at(0, 0), 1.0);
        assert_eq!(c.at(1, 0), 2.0);
        assert_eq!(c.at(2, 1), 6.0);
    }

    #[test]
    fn known_product() {
        let a = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let b = Matrix::from_vec(2, 2, vec![5.0, 6.0, 7.0, 8.0]);
        let c = matmul_nt(&a, &b);
        // rows of A dotted with rows of B
        assert_eq!(c.at(0, 0), 17.0);
        assert_eq!(c.at(0, 1), 23.0);
        assert_eq!(c.at(1, 0), 39.0);
        assert_eq!(c.at(1, 1), 53.0);
    }
}
