use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};

const SYMMETRY_REL_TOL: f64 = 1e-12;
const SYMMETRY_ABS_TOL: f64 = 1e-12;

#[derive(Default, Clone, Copy)]
pub struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        // An infinite running sum stays infinite; the compensation would be NaN.
        self.c = if t.is_finite() { (t - self.sum) - y } else { 0.0 };
        self.sum = t;
    }

    pub fn sum(self) -> f64 {
        self.sum
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        let mut acc = KahanSum::default();
        for v in iter {
            acc.add(v);
        }
        acc
    }
}

pub fn is_symmetric(matrix: ArrayView2<'_, f64>) -> bool {
    let (nrows, ncols) = matrix.dim();
    if nrows != ncols {
        return false;
    }
    let scale = matrix.iter().fold(0.0f64, |acc, &x| acc.max(x.abs()));
    let tol = SYMMETRY_ABS_TOL + SYMMETRY_REL_TOL * scale.max(1.0);
    for i in 0..nrows {
        for j in i + 1..ncols {
            if (matrix[[i, j]] - matrix[[j, i]]).abs() > tol {
                return false;
            }
        }
    }
    true
}

/// Copy `full[rows, cols]` into the leading block of `out`.
pub fn gather_block(
    full: ArrayView2<'_, f64>,
    rows: &[usize],
    cols: &[usize],
    mut out: ArrayViewMut2<'_, f64>,
) {
    debug_assert_eq!(out.dim(), (rows.len(), cols.len()));
    for (i, &r) in rows.iter().enumerate() {
        for (j, &c) in cols.iter().enumerate() {
            out[[i, j]] = full[[r, c]];
        }
    }
}

pub fn gather_vector(full: ArrayView1<'_, f64>, idx: &[usize], mut out: ArrayViewMut1<'_, f64>) {
    debug_assert_eq!(out.len(), idx.len());
    for (k, &i) in idx.iter().enumerate() {
        out[k] = full[i];
    }
}
