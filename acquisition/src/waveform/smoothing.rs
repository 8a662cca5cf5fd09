//! One-dimensional Gaussian smoothing.

use ndarray::Array1;

/// Kernel half-width in standard deviations.
pub const DEFAULT_TRUNCATE: f64 = 4.0;

/// Normalized Gaussian weights for offsets `-radius..=radius`, where
/// `radius = floor(truncate * sigma + 0.5)`.
pub fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as usize;
    let radius = radius as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f64 / sigma).powi(2)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Map an out-of-range index back into `0..len` by mirroring about the
/// sample edges (`d c b a | a b c d | d c b a`).
fn reflect(index: isize, len: usize) -> usize {
    let period = 2 * len as isize;
    let m = index.rem_euclid(period);
    if m < len as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// Gaussian filter with mirrored boundaries.
///
/// A non-positive or non-finite `sigma` returns the input unchanged.
pub fn gaussian_filter1d(input: &Array1<f64>, sigma: f64) -> Array1<f64> {
    if input.is_empty() || !sigma.is_finite() || sigma <= 0.0 {
        return input.clone();
    }

    let kernel = gaussian_kernel(sigma, DEFAULT_TRUNCATE);
    let radius = (kernel.len() / 2) as isize;
    let len = input.len();

    Array1::from_shape_fn(len, |i| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * input[reflect(i as isize + k as isize - radius, len)])
            .sum()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(2.0, DEFAULT_TRUNCATE);
        assert_eq!(kernel.len(), 17);
        assert_relative_eq!(kernel.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for i in 0..kernel.len() / 2 {
            assert_relative_eq!(kernel[i], kernel[kernel.len() - 1 - i]);
        }
    }

    #[test]
    fn test_tiny_sigma_is_identity() {
        let input = Array1::from_vec(vec![0.0, 1.0, -1.0, 2.0]);
        assert_eq!(gaussian_kernel(0.05, DEFAULT_TRUNCATE).len(), 1);
        assert_eq!(gaussian_filter1d(&input, 0.05), input);
    }

    #[test]
    fn test_reflect_indices() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(2, 4), 2);
        assert_eq!(reflect(-9, 4), 0);
    }

    #[test]
    fn test_constant_signal_unchanged() {
        let input = Array1::from_elem(10, 3.5);
        let output = gaussian_filter1d(&input, 3.0);
        for &v in output.iter() {
            assert_relative_eq!(v, 3.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_impulse_spreads_and_preserves_mass() {
        let mut input = Array1::zeros(41);
        input[20] = 1.0;
        let output = gaussian_filter1d(&input, 1.5);
        assert_relative_eq!(output.sum(), 1.0, epsilon = 1e-12);
        assert!(output[20] < 1.0);
        assert_relative_eq!(output[19], output[21], epsilon = 1e-15);
        assert!(output[19] > 0.0);
    }
}
