use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{DecorrError, Result};
use crate::whitening::inverse_sqrt_matrix;

/// Linear map between channel stacks of shape (k, H, W).
pub trait LinearOperator {
    fn apply(&self, x: ArrayView3<f64>) -> Result<Array3<f64>>;

    fn adjoint(&self, y: ArrayView3<f64>) -> Result<Array3<f64>>;
}

/// k×k block operator whose blocks are scalar multiplications.
///
/// Output channel i is `Σ_j matrix[i, j] * x[j]`, evaluated pixelwise. Built
/// from a whitening matrix this decorrelates the per-pixel channel noise.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMixing {
    matrix: Array2<f64>,
}

impl ChannelMixing {
    pub fn new(matrix: Array2<f64>) -> Result<Self> {
        let (rows, cols) = matrix.dim();
        if rows != cols || rows == 0 {
            return Err(DecorrError::NotSquare { rows, cols });
        }
        Ok(Self { matrix })
    }

    /// Whitening operator `Σ^(-1/2)` for the given covariance matrix.
    pub fn whitening(covariance: ArrayView2<f64>) -> Result<Self> {
        Self::new(inverse_sqrt_matrix(covariance)?)
    }
}

impl LinearOperator for ChannelMixing {
    fn apply(&self, x: ArrayView3<f64>) -> Result<Array3<f64>> {
        mix(self.matrix.view(), x)
    }

    fn adjoint(&self, y: ArrayView3<f64>) -> Result<Array3<f64>> {
        mix(self.matrix.t(), y)
    }
}

fn mix(coefficients: ArrayView2<f64>, x: ArrayView3<f64>) -> Result<Array3<f64>> {
    let (k, h, w) = x.dim();
    if k != coefficients.ncols() {
        return Err(DecorrError::ShapeMismatch {
            left: coefficients.shape().to_vec(),
            right: x.shape().to_vec(),
        });
    }

    let mut out = Array3::<f64>::zeros((coefficients.nrows(), h, w));
    for (i, mut out_i) in out.axis_iter_mut(Axis(0)).enumerate() {
        for (j, x_j) in x.axis_iter(Axis(0)).enumerate() {
            out_i.scaled_add(coefficients[[i, j]], &x_j);
        }
    }
    Ok(out)
}

/// Weighted squared norm `||op(r)||²` of a residual stack, i.e. the
/// correlation-weighted data discrepancy when `op` is a whitening operator.
pub fn weighted_l2_squared<Op>(op: &Op, residual: ArrayView3<f64>) -> Result<f64>
where
    Op: LinearOperator + ?Sized,
{
    let weighted = op.apply(residual)?;
    Ok(weighted.iter().map(|v| v * v).sum())
}
