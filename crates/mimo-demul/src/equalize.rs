//! Zero-forcing equalization kernels
//!
//! Each subcarrier's received antenna vector `x` (length `ant`) is multiplied
//! by that subcarrier's channel-inversion matrix `W` (`ue x ant`) to give the
//! per-UE estimate `y = W x`.
//!
//! Two interchangeable kernels compute the same product:
//!
//! - [`DirectKernel`]: straightforward strided loop, the reference.
//! - [`BatchedKernel`]: planned once for fixed dimensions, accumulates four
//!   antenna columns per step in split real/imaginary lanes so LLVM emits
//!   packed FMA. Results differ from the reference only by summation order.
//!
//! [`select_kernel`] picks one at worker construction.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::{DemulError, DemulResult};
use crate::matrix::CMatView;
use crate::types::{IQSample, ZERO};

/// Lanes accumulated per step by the batched kernel.
const BATCH_LANES: usize = 4;

/// Largest matrix dimension the batched kernel is planned for.
pub const MAX_PLAN_DIM: usize = 1024;

/// Kernel selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelChoice {
    /// Batched when it can be planned, direct otherwise
    Auto,
    /// Always use the reference loop
    Direct,
    /// Require the batched kernel; planning failure is fatal
    Batched,
}

impl Default for KernelChoice {
    fn default() -> Self {
        KernelChoice::Auto
    }
}

/// Complex matrix-vector product `y = a * x`.
pub trait MatVecKernel: Send + Sync + Debug {
    /// Kernel name for logs and benchmarks.
    fn name(&self) -> &'static str;

    /// Compute `y[r] = sum_c a(r, c) * x[c]` for every row of `a`.
    ///
    /// `x` must hold `a.cols()` samples and `y` at least `a.rows()`.
    fn gemv(&self, a: &CMatView<'_>, x: &[IQSample], y: &mut [IQSample]);
}

/// Reference kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectKernel;

impl MatVecKernel for DirectKernel {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn gemv(&self, a: &CMatView<'_>, x: &[IQSample], y: &mut [IQSample]) {
        debug_assert!(x.len() >= a.cols());
        debug_assert!(y.len() >= a.rows());

        for (r, out) in y.iter_mut().enumerate().take(a.rows()) {
            let mut acc = ZERO;
            for (c, &xc) in x.iter().enumerate().take(a.cols()) {
                acc += a.get(r, c) * xc;
            }
            *out = acc;
        }
    }
}

/// Kernel planned for one `rows x cols` shape.
#[derive(Debug, Clone, Copy)]
pub struct BatchedKernel {
    rows: usize,
    cols: usize,
    full_chunks: usize,
}

impl BatchedKernel {
    /// Prepare the kernel for a fixed shape.
    pub fn plan(rows: usize, cols: usize) -> DemulResult<Self> {
        let reason = if rows == 0 || cols == 0 {
            Some("empty shape")
        } else if rows > MAX_PLAN_DIM || cols > MAX_PLAN_DIM {
            Some("dimension exceeds plan limit")
        } else if cols < BATCH_LANES {
            Some("fewer columns than batch lanes")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(DemulError::KernelPlan {
                rows,
                cols,
                reason: reason.to_string(),
            });
        }

        Ok(Self {
            rows,
            cols,
            full_chunks: cols / BATCH_LANES,
        })
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    fn row_dot(&self, row: &[IQSample], x: &[IQSample]) -> IQSample {
        let mut re = [0.0f32; BATCH_LANES];
        let mut im = [0.0f32; BATCH_LANES];

        let split = self.full_chunks * BATCH_LANES;
        for (rc, xc) in row[..split]
            .chunks_exact(BATCH_LANES)
            .zip(x[..split].chunks_exact(BATCH_LANES))
        {
            for l in 0..BATCH_LANES {
                re[l] += rc[l].re * xc[l].re - rc[l].im * xc[l].im;
                im[l] += rc[l].re * xc[l].im + rc[l].im * xc[l].re;
            }
        }

        let mut acc = IQSample::new(
            (re[0] + re[1]) + (re[2] + re[3]),
            (im[0] + im[1]) + (im[2] + im[3]),
        );
        for c in split..self.cols {
            acc += row[c] * x[c];
        }
        acc
    }
}

impl MatVecKernel for BatchedKernel {
    fn name(&self) -> &'static str {
        "batched"
    }

    fn gemv(&self, a: &CMatView<'_>, x: &[IQSample], y: &mut [IQSample]) {
        debug_assert_eq!((a.rows(), a.cols()), (self.rows, self.cols));

        // Strided views fall back to the reference loop
        let Some(data) = a.as_row_major() else {
            DirectKernel.gemv(a, x, y);
            return;
        };

        for (row, out) in data.chunks_exact(self.cols).zip(y.iter_mut()) {
            *out = self.row_dot(row, &x[..self.cols]);
        }
    }
}

/// Choose the matrix-vector kernel for a `ue x ant` inversion matrix.
pub fn select_kernel(
    choice: KernelChoice,
    ue_num: usize,
    ant_num: usize,
) -> DemulResult<Box<dyn MatVecKernel>> {
    let kernel: Box<dyn MatVecKernel> = match choice {
        KernelChoice::Direct => Box::new(DirectKernel),
        KernelChoice::Batched => Box::new(BatchedKernel::plan(ue_num, ant_num)?),
        KernelChoice::Auto => match BatchedKernel::plan(ue_num, ant_num) {
            Ok(kernel) => Box::new(kernel),
            Err(e) => {
                tracing::debug!(error = %e, "batched kernel unavailable, using direct");
                Box::new(DirectKernel)
            }
        },
    };
    tracing::info!(
        kernel = kernel.name(),
        ue_num,
        ant_num,
        "equalization kernel selected"
    );
    Ok(kernel)
}
