use ndarray::{arr2, s, Array2, ArrayView2, ArrayView3, Axis};
use tracing::debug;

use crate::error::{DecorrError, Result};

/// Second-difference high-pass kernel. Removes smooth signal content so the
/// filtered images are dominated by noise.
pub const HIGH_PASS_KERNEL: [[f64; 3]; 3] = [
    [1.0, -2.0, 1.0],
    [-2.0, 4.0, -2.0],
    [1.0, -2.0, 1.0],
];

/// Energy gain of `HIGH_PASS_KERNEL` on white noise (sum of squared taps).
pub const CALIBRATION: f64 = 36.0;

pub fn high_pass_kernel() -> Array2<f64> {
    arr2(&HIGH_PASS_KERNEL)
}

/// Full 2D convolution.
///
/// Output has shape (H + kh - 1, W + kw - 1): every position where the
/// kernel overlaps the image at least partially.
pub fn convolve2d_full(image: ArrayView2<f64>, kernel: ArrayView2<f64>) -> Array2<f64> {
    let (h, w) = image.dim();
    let (kh, kw) = kernel.dim();
    let mut out = Array2::<f64>::zeros(((h + kh).saturating_sub(1), (w + kw).saturating_sub(1)));
    if h == 0 || w == 0 {
        return out;
    }

    // out[i + p, j + q] += image[i, j] * kernel[p, q]
    for ((p, q), &k) in kernel.indexed_iter() {
        out.slice_mut(s![p..p + h, q..q + w]).scaled_add(k, &image);
    }
    out
}

/// Estimate the noise covariance between two equally shaped images.
///
/// Both images are high-pass filtered with `HIGH_PASS_KERNEL` (full mode),
/// the filtered products are summed and normalized by `H*W - 1` and
/// `CALIBRATION`. Exactly symmetric in its arguments.
pub fn estimate_cov(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(DecorrError::ShapeMismatch {
            left: a.shape().to_vec(),
            right: b.shape().to_vec(),
        });
    }
    let (h, w) = a.dim();
    check_sample_count(h, w)?;

    let kernel = high_pass_kernel();
    let fa = convolve2d_full(a, kernel.view());
    let fb = convolve2d_full(b, kernel.view());

    Ok(calibrated_inner(&fa, &fb, h * w))
}

/// Covariance matrix of a (k, H, W) channel stack.
///
/// Entry (i, j) equals `estimate_cov(stack[i], stack[j])`. Each channel is
/// filtered once and only the upper triangle is evaluated.
pub fn cov_matrix(stack: ArrayView3<f64>) -> Result<Array2<f64>> {
    let (k, h, w) = stack.dim();
    if k == 0 {
        return Err(DecorrError::EmptyStack);
    }
    check_sample_count(h, w)?;

    let kernel = high_pass_kernel();
    let filtered: Vec<Array2<f64>> = stack
        .axis_iter(Axis(0))
        .map(|channel| convolve2d_full(channel, kernel.view()))
        .collect();

    let mut cov = Array2::<f64>::zeros((k, k));
    for i in 0..k {
        for j in i..k {
            let value = calibrated_inner(&filtered[i], &filtered[j], h * w);
            cov[[i, j]] = value;
            cov[[j, i]] = value;
        }
    }

    debug!(channels = k, height = h, width = w, "estimated covariance matrix {:?}", cov);
    Ok(cov)
}

/// Same as [`cov_matrix`] for channels held as separate arrays.
pub fn cov_matrix_from_channels(channels: &[ArrayView2<f64>]) -> Result<Array2<f64>> {
    let first = channels.first().ok_or(DecorrError::EmptyStack)?;
    if let Some(other) = channels.iter().find(|c| c.shape() != first.shape()) {
        return Err(DecorrError::ShapeMismatch {
            left: first.shape().to_vec(),
            right: other.shape().to_vec(),
        });
    }

    let stack = ndarray::stack(Axis(0), channels).map_err(|_| DecorrError::ShapeMismatch {
        left: first.shape().to_vec(),
        right: first.shape().to_vec(),
    })?;
    cov_matrix(stack.view())
}

fn check_sample_count(height: usize, width: usize) -> Result<()> {
    if height * width < 2 {
        return Err(DecorrError::DegenerateImage { height, width });
    }
    Ok(())
}

fn calibrated_inner(fa: &Array2<f64>, fb: &Array2<f64>, samples: usize) -> f64 {
    let sum: f64 = fa.iter().zip(fb.iter()).map(|(x, y)| x * y).sum();
    sum / (samples - 1) as f64 / CALIBRATION
}
