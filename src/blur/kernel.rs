//! Convolution kernels for background blur.
//!
//! Box and gaussian blurs are separable, so they are expressed as two 1-D
//! passes: a horizontal `(2r+1) x 1` kernel followed by a vertical
//! `1 x (2r+1)` one. Weights are stored unnormalized; the convolution divides
//! by the sum of the weights it actually sampled.

use serde::{Deserialize, Serialize};

use crate::errors::BlurError;

/// A 2-D convolution kernel with odd dimensions, stored row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl Kernel {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Result<Self, BlurError> {
        let kernel = Self { width, height, data };
        kernel.validate()?;
        Ok(kernel)
    }

    /// A 1x1 pass that copies its input unchanged.
    pub fn identity() -> Self {
        Self {
            width: 1,
            height: 1,
            data: vec![1.0],
        }
    }

    pub fn validate(&self) -> Result<(), BlurError> {
        if self.width == 0 || self.height == 0 {
            return Err(BlurError::InvalidKernel("kernel is empty".into()));
        }
        if self.width % 2 == 0 || self.height % 2 == 0 {
            return Err(BlurError::InvalidKernel(format!(
                "dimensions must be odd, got {}x{}",
                self.width, self.height
            )));
        }
        if self.data.len() != self.width * self.height {
            return Err(BlurError::InvalidKernel(format!(
                "expected {} weights for a {}x{} kernel, got {}",
                self.width * self.height,
                self.width,
                self.height,
                self.data.len()
            )));
        }
        if self.data.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(BlurError::InvalidKernel("weights must be finite and non-negative".into()));
        }
        Ok(())
    }

    /// Weight at column `x`, row `y`.
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Distance from the center to the kernel's edge, horizontally and
    /// vertically.
    pub fn half_extents(&self) -> (i32, i32) {
        ((self.width / 2) as i32, (self.height / 2) as i32)
    }

    pub fn transposed(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        for x in 0..self.width {
            for y in 0..self.height {
                data.push(self.get(x, y));
            }
        }
        Self {
            width: self.height,
            height: self.width,
            data,
        }
    }
}

/// Horizontal and vertical passes of a box blur of the given radius.
pub fn box_kernels(radius: u32) -> [Kernel; 2] {
    let size = 2 * radius as usize + 1;
    let horizontal = Kernel {
        width: size,
        height: 1,
        data: vec![1.0; size],
    };
    let vertical = horizontal.transposed();
    [horizontal, vertical]
}

/// Horizontal and vertical passes of a gaussian blur of the given radius and
/// standard deviation.
pub fn gaussian_kernels(radius: u32, deviation: f64) -> [Kernel; 2] {
    let size = 2 * radius as usize + 1;
    let r = radius as f64;
    let scale = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * deviation);
    let data = (0..size)
        .map(|i| {
            let d = r - i as f64;
            scale * (-(d * d) / (2.0 * deviation * deviation)).exp()
        })
        .collect();

    let horizontal = Kernel {
        width: size,
        height: 1,
        data,
    };
    let vertical = horizontal.transposed();
    [horizontal, vertical]
}

/// A blur method with its parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum BlurMethod {
    Box { radius: u32 },
    Gaussian { radius: u32, deviation: f64 },
    /// User supplied kernels, applied in order.
    Kernel(Vec<Kernel>),
}

impl BlurMethod {
    /// The convolution passes this method runs. A lone kernel is followed
    /// by an identity pass so there are always at least two passes.
    pub fn passes(&self) -> Result<Vec<Kernel>, BlurError> {
        let mut passes = match self {
            BlurMethod::Box { radius } => box_kernels(*radius).to_vec(),
            BlurMethod::Gaussian { radius, deviation } => {
                if *deviation <= 0.0 || !deviation.is_finite() {
                    return Err(BlurError::InvalidKernel(format!("deviation {deviation} is not positive")));
                }
                gaussian_kernels(*radius, *deviation).to_vec()
            }
            BlurMethod::Kernel(kernels) => {
                if kernels.is_empty() {
                    return Err(BlurError::InvalidKernel("no kernels given".into()));
                }
                for k in kernels {
                    k.validate()?;
                }
                kernels.clone()
            }
        };

        if passes.len() == 1 {
            passes.push(Kernel::identity());
        }
        Ok(passes)
    }
}

/// Pixels outside a region that a chain of passes reads: the sum of the
/// half extents of every pass.
pub fn passes_margin(passes: &[Kernel]) -> (i32, i32) {
    passes.iter().fold((0, 0), |(w, h), k| {
        let (kw, kh) = k.half_extents();
        (w + kw, h + kh)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_symmetric(data: &[f64]) {
        let n = data.len();
        for i in 0..n / 2 {
            assert!((data[i] - data[n - 1 - i]).abs() < 1e-12, "asymmetric at {i}: {data:?}");
        }
    }

    #[test]
    fn box_kernels_have_expected_shape() {
        for radius in [0, 1, 3, 7] {
            let [h, v] = box_kernels(radius);
            let size = 2 * radius as usize + 1;
            assert_eq!((h.width, h.height), (size, 1));
            assert_eq!((v.width, v.height), (1, size));
            assert_symmetric(&h.data);
            assert!(h.data[size / 2] > 0.0);
        }
    }

    #[test]
    fn gaussian_kernels_are_symmetric_and_peak_at_center() {
        for radius in [1, 3, 5] {
            let [h, v] = gaussian_kernels(radius, 0.84089642);
            let size = 2 * radius as usize + 1;
            assert_eq!(h.data.len(), size);
            assert_eq!(v.data, h.data);
            assert_symmetric(&h.data);

            let center = h.data[size / 2];
            assert!(center > 0.0);
            assert!(h.data.iter().all(|w| *w <= center));
        }
    }

    #[test]
    fn gaussian_center_weight_matches_density() {
        let [h, _] = gaussian_kernels(2, 1.0);
        let expected = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
        assert!((h.data[2] - expected).abs() < 1e-12);
    }

    #[test]
    fn single_kernel_gets_identity_pass() {
        let k = Kernel::new(3, 3, vec![1.0; 9]).unwrap();
        let passes = BlurMethod::Kernel(vec![k.clone()]).passes().unwrap();
        assert_eq!(passes, vec![k, Kernel::identity()]);
        assert_eq!(passes_margin(&passes), (1, 1));
    }

    #[test]
    fn separable_margin_sums_both_passes() {
        let passes = BlurMethod::Box { radius: 3 }.passes().unwrap();
        assert_eq!(passes_margin(&passes), (3, 3));
    }

    #[test]
    fn invalid_kernels_are_rejected() {
        assert!(Kernel::new(2, 1, vec![1.0, 1.0]).is_err());
        assert!(Kernel::new(3, 1, vec![1.0]).is_err());
        assert!(BlurMethod::Kernel(vec![]).passes().is_err());
        assert!(BlurMethod::Gaussian { radius: 2, deviation: 0.0 }.passes().is_err());
    }
}
