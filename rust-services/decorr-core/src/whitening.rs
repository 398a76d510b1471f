use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::error::{DecorrError, Result};

/// Eigenvalues at or below this fraction of the largest magnitude are treated
/// as non-positive.
pub const EIGENVALUE_TOLERANCE: f64 = 1e-12;

/// Inverse principal square root of a symmetric positive-definite matrix.
///
/// The input is symmetrized before the eigen-decomposition `M = Q Λ Qᵗ` and
/// the result is `Q Λ^(-1/2) Qᵗ`, so that `W M Wᵗ ≈ I`.
///
/// Fails with `NotPositiveDefinite` instead of regularizing; see
/// [`regularize`] for callers that want to retry.
pub fn inverse_sqrt_matrix(matrix: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = matrix.dim();
    if rows != cols || rows == 0 {
        return Err(DecorrError::NotSquare { rows, cols });
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(DecorrError::NonFinite);
    }

    let symmetric = DMatrix::from_fn(rows, cols, |i, j| 0.5 * matrix[[i, j]] + 0.5 * matrix[[j, i]]);
    let eigen = SymmetricEigen::new(symmetric);
    // Eigenvalues beyond f64 range come back as inf or NaN.
    if eigen.eigenvalues.iter().any(|l| !l.is_finite()) {
        return Err(DecorrError::NonFinite);
    }

    let scale = eigen.eigenvalues.iter().fold(0.0f64, |acc, l| acc.max(l.abs()));
    let threshold = EIGENVALUE_TOLERANCE * scale;
    if let Some(&eigenvalue) = eigen.eigenvalues.iter().find(|&&l| l <= threshold) {
        return Err(DecorrError::NotPositiveDefinite { eigenvalue });
    }
    debug!("covariance eigenvalues {:?}", eigen.eigenvalues.as_slice());

    let q = &eigen.eigenvectors;
    let inv_sqrt = DMatrix::from_diagonal(&eigen.eigenvalues.map(|l| l.sqrt().recip()));
    let w = q * inv_sqrt * q.transpose();
    if w.iter().any(|v| !v.is_finite()) {
        return Err(DecorrError::NonFinite);
    }

    // The principal root is symmetric; drop the rounding asymmetry.
    Ok(Array2::from_shape_fn((rows, cols), |(i, j)| 0.5 * w[(i, j)] + 0.5 * w[(j, i)]))
}

/// `M + epsilon * I`.
pub fn regularize(matrix: ArrayView2<f64>, epsilon: f64) -> Array2<f64> {
    let mut out = matrix.to_owned();
    let mut diag = out.diag_mut();
    diag += epsilon;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}\n{:?}\n{:?}", x, y, a, b);
        }
    }

    #[test]
    fn test_identity_is_fixed_point() {
        let eye = Array2::<f64>::eye(2);
        let w = inverse_sqrt_matrix(eye.view()).unwrap();
        assert_close(&w, &eye, 1e-12);
    }

    #[test]
    fn test_diagonal() {
        let m = array![[4.0, 0.0], [0.0, 9.0]];
        let w = inverse_sqrt_matrix(m.view()).unwrap();
        assert_close(&w, &array![[0.5, 0.0], [0.0, 1.0 / 3.0]], 1e-12);
    }

    #[test]
    fn test_whitens_random_spd() {
        let mut rng = StdRng::seed_from_u64(7);
        for k in 1..=4 {
            let a = Array2::<f64>::random_using((k, k), StandardNormal, &mut rng);
            let m = a.dot(&a.t()) + Array2::<f64>::eye(k) * 0.5;
            let w = inverse_sqrt_matrix(m.view()).unwrap();
            let product = w.dot(&m).dot(&w.t());
            assert_close(&product, &Array2::eye(k), 1e-9);
        }
    }

    #[test]
    fn test_result_is_symmetric() {
        let m = array![[2.0, 0.7, 0.1], [0.7, 1.5, -0.3], [0.1, -0.3, 1.0]];
        let w = inverse_sqrt_matrix(m.view()).unwrap();
        assert_eq!(w, w.t());
    }

    #[test]
    fn test_indefinite_rejected() {
        let m = array![[1.0, 0.0], [0.0, -1.0]];
        match inverse_sqrt_matrix(m.view()) {
            Err(DecorrError::NotPositiveDefinite { eigenvalue }) => {
                assert!((eigenvalue + 1.0).abs() < 1e-12)
            }
            other => panic!("expected NotPositiveDefinite, got {:?}", other),
        }
    }

    #[test]
    fn test_singular_rejected() {
        let m = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(matches!(
            inverse_sqrt_matrix(m.view()),
            Err(DecorrError::NotPositiveDefinite { .. })
        ));
        let zero = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            inverse_sqrt_matrix(zero.view()),
            Err(DecorrError::NotPositiveDefinite { .. })
        ));
    }

    #[test]
    fn test_regularize_recovers_singular() {
        let m = array![[1.0, 1.0], [1.0, 1.0]];
        let reg = regularize(m.view(), 1e-3);
        assert_close(&reg, &array![[1.001, 1.0], [1.0, 1.001]], 1e-15);
        let w = inverse_sqrt_matrix(reg.view()).unwrap();
        assert_close(&w.dot(&reg).dot(&w.t()), &Array2::eye(2), 1e-6);
    }

    #[test]
    fn test_rejects_bad_input() {
        let rect = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            inverse_sqrt_matrix(rect.view()),
            Err(DecorrError::NotSquare { rows: 2, cols: 3 })
        ));
        let empty = Array2::<f64>::zeros((0, 0));
        assert!(matches!(
            inverse_sqrt_matrix(empty.view()),
            Err(DecorrError::NotSquare { .. })
        ));
        let nan = array![[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(matches!(inverse_sqrt_matrix(nan.view()), Err(DecorrError::NonFinite)));
    }

    #[test]
    fn test_near_overflow_entries_rejected() {
        // Finite and positive definite, but the largest eigenvalue exceeds f64::MAX.
        let m = array![[1.7e308, 1.0e308], [1.0e308, 1.7e308]];
        match inverse_sqrt_matrix(m.view()) {
            Err(DecorrError::NonFinite) => {}
            other => panic!("expected NonFinite, got {:?}", other),
        }
    }

    #[test]
    fn test_large_but_representable_entries() {
        let m = array![[4.0e300, 1.0e300], [1.0e300, 4.0e300]];
        let w = inverse_sqrt_matrix(m.view()).unwrap();
        assert!(w.iter().all(|v| v.is_finite()));
        let product = w.dot(&m).dot(&w.t());
        assert_close(&product, &Array2::eye(2), 1e-9);
    }

    #[test]
    fn test_asymmetric_input_symmetrized() {
        let m = array![[2.0, 0.4], [0.6, 3.0]];
        let sym = array![[2.0, 0.5], [0.5, 3.0]];
        let w = inverse_sqrt_matrix(m.view()).unwrap();
        let w_sym = inverse_sqrt_matrix(sym.view()).unwrap();
        assert_close(&w, &w_sym, 1e-12);
    }
}
