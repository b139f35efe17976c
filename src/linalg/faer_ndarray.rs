use faer::linalg::solvers::{self, Solve};
pub use faer::linalg::solvers::Llt as FaerLlt;
use faer::{MatMut, MatRef, Side};
use ndarray::{ArrayBase, ArrayViewMut2, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Cholesky factor has a degenerate diagonal entry {value:e} at position {index}")]
    DegenerateDiagonal { index: usize, value: f64 },
    #[error("Inverse of the factored matrix contains non-finite entries")]
    NonFiniteInverse,
    #[error("Expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// ndarray reports stride 0 for axes sliced down to length 1; faer wants a
/// positive stride there, and any value is valid since it is never stepped.
#[inline]
fn axis_stride(len: usize, stride: isize) -> isize {
    if len <= 1 { 1 } else { stride }
}

/// Borrow an ndarray mutable view as a faer `MatMut` without copying.
#[inline]
pub fn view_mut_to_mat_mut<'a>(mut view: ArrayViewMut2<'a, f64>) -> MatMut<'a, f64> {
    let (rows, cols) = view.dim();
    let strides = view.strides();
    let (s0, s1) = (axis_stride(rows, strides[0]), axis_stride(cols, strides[1]));
    // SAFETY: pointer, shape and strides come from a live mutable view whose
    // lifetime `'a` is carried into the returned MatMut.
    unsafe { MatMut::from_raw_parts_mut(view.as_mut_ptr(), rows, cols, s0, s1) }
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<ndarray::Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        let (s0, s1) = (axis_stride(rows, strides[0]), axis_stride(cols, strides[1]));
        // Negative or zero strides can alias; hand faer a compact copy instead.
        if s0 <= 0 || s1 <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: axis_stride(rows, owned_strides[0]),
                col_stride: axis_stride(cols, owned_strides[1]),
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: s0,
            col_stride: s1,
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                axis_stride(owned.nrows(), strides[0]),
                axis_stride(owned.ncols(), strides[1]),
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from the owned compact copy held by
        // this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

/// Factor a symmetric positive-definite matrix and write its inverse into
/// `inverse`, returning half the log-determinant.
///
/// The returned value is `sum(log|L_ii|)`, i.e. `0.5 * log det(A)`; callers
/// double it where the full log-determinant is needed. Only the lower
/// triangle of `matrix` is read.
pub fn cholesky_half_log_det_and_inverse<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
    mut inverse: ArrayViewMut2<'_, f64>,
) -> Result<f64, FaerLinalgError> {
    let (rows, cols) = matrix.dim();
    if rows != cols || inverse.dim() != (rows, cols) {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }

    let view = FaerArrayView::new(matrix);
    let llt = FaerLlt::new(view.as_ref(), Side::Lower).map_err(FaerLinalgError::Cholesky)?;

    // Sum of logs rather than log of the product keeps large systems from
    // overflowing.
    let l = llt.L();
    let mut half_log_det = 0.0;
    for i in 0..rows {
        let d = l[(i, i)];
        if !(d.is_finite() && d != 0.0) {
            return Err(FaerLinalgError::DegenerateDiagonal { index: i, value: d });
        }
        half_log_det += d.abs().ln();
    }

    inverse.fill(0.0);
    inverse.diag_mut().fill(1.0);
    {
        let mut inv_mat = view_mut_to_mat_mut(inverse.view_mut());
        llt.solve_in_place(inv_mat.as_mut());
    }
    if !inverse.iter().all(|v| v.is_finite()) {
        return Err(FaerLinalgError::NonFiniteInverse);
    }

    // Triangular solves leave roundoff asymmetry; symmetric kernels downstream
    // read both halves.
    for i in 0..rows {
        for j in (i + 1)..cols {
            let avg = 0.5 * (inverse[[i, j]] + inverse[[j, i]]);
            inverse[[i, j]] = avg;
            inverse[[j, i]] = avg;
        }
    }
    Ok(half_log_det)
}
