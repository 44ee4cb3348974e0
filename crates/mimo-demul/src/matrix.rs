//! Borrowed complex matrix views
//!
//! The frame window and the per-worker scratch buffers are flat slices. These
//! views put a shape and strides on top of such a slice without copying, so
//! kernels can index `(row, col)` directly into pre-allocated memory.

use crate::error::{DemulError, DemulResult};
use crate::types::IQSample;

fn required_len(rows: usize, cols: usize, row_stride: usize, col_stride: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        (rows - 1) * row_stride + (cols - 1) * col_stride + 1
    }
}

fn check_len(what: &'static str, needed: usize, actual: usize) -> DemulResult<()> {
    if actual < needed {
        return Err(DemulError::DimensionMismatch {
            what,
            expected: needed,
            actual,
        });
    }
    Ok(())
}

/// Read-only strided view over a complex buffer.
#[derive(Debug, Clone, Copy)]
pub struct CMatView<'a> {
    data: &'a [IQSample],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> CMatView<'a> {
    /// View with explicit strides.
    pub fn new(
        data: &'a [IQSample],
        rows: usize,
        cols: usize,
        row_stride: usize,
        col_stride: usize,
    ) -> DemulResult<Self> {
        check_len(
            "matrix view",
            required_len(rows, cols, row_stride, col_stride),
            data.len(),
        )?;
        Ok(Self {
            data,
            rows,
            cols,
            row_stride,
            col_stride,
        })
    }

    /// Row-major view: element `(r, c)` at `r * cols + c`.
    pub fn row_major(data: &'a [IQSample], rows: usize, cols: usize) -> DemulResult<Self> {
        Self::new(data, rows, cols, cols, 1)
    }

    /// Column-major view: element `(r, c)` at `c * rows + r`.
    pub fn col_major(data: &'a [IQSample], rows: usize, cols: usize) -> DemulResult<Self> {
        Self::new(data, rows, cols, 1, rows)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> IQSample {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.row_stride + col * self.col_stride]
    }

    /// Contiguous row-major backing slice, if the view has that layout.
    pub fn as_row_major(&self) -> Option<&'a [IQSample]> {
        if self.col_stride == 1 && (self.row_stride == self.cols || self.rows <= 1) {
            Some(&self.data[..self.rows * self.cols])
        } else {
            None
        }
    }

    /// Copy column `col` into `dst`.
    pub fn copy_col(&self, col: usize, dst: &mut [IQSample]) {
        debug_assert!(dst.len() >= self.rows);
        for (r, out) in dst.iter_mut().enumerate().take(self.rows) {
            *out = self.get(r, col);
        }
    }
}
