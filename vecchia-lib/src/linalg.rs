//! Dense helpers on top of faer and a row-sparse matrix for the Vecchia factors.

use dyn_stack::{GlobalPodBuffer, PodStack};
use faer::{Faer, Mat};
use faer_core::Parallelism;
use rayon::prelude::*;

use crate::VecchiaError;

/// Added to the diagonal of covariance blocks that carry no nugget
pub(crate) const EPSILON_ADD_COVARIANCE_STABLE: f64 = 1e-10;

/// Below this many entries a solve is not worth spreading over threads
const SMALL_SOLVE: usize = 4096;

fn parallelism_for(size: usize) -> Parallelism {
    if size < SMALL_SOLVE {
        Parallelism::None
    } else {
        Parallelism::Rayon(0)
    }
}

/// Build a matrix entrywise, evaluating columns in parallel
pub(crate) fn par_mat_from_fn(
    nrows: usize,
    ncols: usize,
    f: impl Fn(usize, usize) -> f64 + Sync,
) -> Mat<f64> {
    let cols: Vec<Vec<f64>> = (0..ncols)
        .into_par_iter()
        .map(|j| (0..nrows).map(|i| f(i, j)).collect())
        .collect();
    Mat::from_fn(nrows, ncols, |i, j| cols[j][i])
}

/// Lower Cholesky factor $\bm{L}$ of an SPD matrix, $\bm{A} = \bm{L}\bm{L}^{\intercal}$
pub(crate) fn cholesky_lower(a: &Mat<f64>) -> Result<Mat<f64>, VecchiaError> {
    Ok(a.cholesky(faer::Side::Lower)?.compute_l())
}

/// find x, the solution to AX=B where a is positive definite
/// takes cholesky decomposition of A as an input
pub(crate) fn cholesky_solve(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    let mut b = b.clone();
    let i = a.nrows();
    let j = b.ncols();
    let par = parallelism_for(i * j);

    faer_cholesky::llt::solve::solve_in_place_with_conj(
        a.as_ref(),
        faer_core::Conj::No,
        b.as_mut(),
        par,
        PodStack::new(&mut GlobalPodBuffer::new(
            faer_cholesky::llt::solve::solve_in_place_req::<f64>(j, i, par)
                .expect("solve workspace size overflows usize"),
        )),
    );

    b
}

/// $\bm{L}^{-1}\bm{B}$ for lower triangular $\bm{L}$
pub(crate) fn solve_lower(l: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    let mut b = b.clone();
    let par = parallelism_for(l.nrows() * b.ncols());
    faer_core::solve::solve_lower_triangular_in_place(l.as_ref(), b.as_mut(), par);
    b
}

/// $\log|\bm{A}|$ from the Cholesky factor of $\bm{A}$
pub(crate) fn log_det_cholesky(l: &Mat<f64>) -> f64 {
    2. * (0..l.nrows()).map(|i| l.read(i, i).ln()).sum::<f64>()
}

/// A column vector
pub(crate) fn col_vec(v: &[f64]) -> Mat<f64> {
    Mat::from_fn(v.len(), 1, |i, _| v[i])
}

/// Column `j` of a matrix
pub(crate) fn col_to_vec(m: &Mat<f64>, j: usize) -> Vec<f64> {
    (0..m.nrows()).map(|i| m.read(i, j)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Result of [pcg]
#[derive(Clone, Debug)]
pub(crate) struct CgSolve {
    pub x: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Preconditioned conjugate gradients for $\bm{A}x = b$ with $\bm{A}$ SPD
///
/// `apply` computes $\bm{A}v$, `precond` applies $\bm{P}^{-1}$ for an SPD preconditioner
/// $\bm{P} \approx \bm{A}$. Stops once $\|r\| \le$ `tol` $\|b\|$.
pub(crate) fn pcg(
    apply: impl Fn(&[f64]) -> Vec<f64>,
    precond: impl Fn(&[f64]) -> Vec<f64>,
    b: &[f64],
    tol: f64,
    max_iter: usize,
) -> CgSolve {
    let mut x = vec![0.; b.len()];
    let target = tol * dot(b, b).sqrt();
    let mut r = b.to_vec();
    let mut iterations = 0;
    if dot(&r, &r).sqrt() > target {
        let mut z = precond(&r);
        let mut p = z.clone();
        let mut rz = dot(&r, &z);
        while iterations < max_iter {
            iterations += 1;
            let ap = apply(&p);
            let p_ap = dot(&p, &ap);
            if p_ap <= 0. {
                break;
            }
            let alpha = rz / p_ap;
            for ((xi, ri), (pi, api)) in x.iter_mut().zip(r.iter_mut()).zip(p.iter().zip(&ap)) {
                *xi += alpha * pi;
                *ri -= alpha * api;
            }
            if dot(&r, &r).sqrt() <= target {
                break;
            }
            z = precond(&r);
            let rz_new = dot(&r, &z);
            let beta = rz_new / rz;
            rz = rz_new;
            for (pi, zi) in p.iter_mut().zip(&z) {
                *pi = zi + beta * *pi;
            }
        }
    }
    let converged = dot(&r, &r).sqrt() <= target;
    CgSolve {
        x,
        iterations,
        converged,
    }
}

/// Sparse matrix stored by rows
///
/// Every row owns its column indices and values, so rows can be filled
/// independently by different threads. For the Vecchia factor $\bm{B}$ each row $i$ holds
/// the neighbours $N(i)$ followed by the diagonal entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseRows {
    ncols: usize,
    cols: Vec<Vec<usize>>,
    vals: Vec<Vec<f64>>,
}

impl SparseRows {
    /// Zero matrix with the given per-row pattern
    ///
    /// With `diag_offset = Some(o)` row `r` additionally stores column `r + o` with value 1
    #[must_use]
    pub fn with_pattern(ncols: usize, pattern: &[Vec<usize>], diag_offset: Option<usize>) -> Self {
        let mut cols = Vec::with_capacity(pattern.len());
        let mut vals = Vec::with_capacity(pattern.len());
        for (r, p) in pattern.iter().enumerate() {
            let mut c = p.clone();
            let mut v = vec![0.; p.len()];
            if let Some(o) = diag_offset {
                c.push(r + o);
                v.push(1.);
            }
            cols.push(c);
            vals.push(v);
        }
        SparseRows { ncols, cols, vals }
    }

    /// Assemble from complete rows
    pub(crate) fn from_rows(ncols: usize, rows: Vec<(Vec<usize>, Vec<f64>)>) -> Self {
        let (cols, vals) = rows.into_iter().unzip();
        SparseRows { ncols, cols, vals }
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        self.cols.len()
    }

    #[must_use]
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored entries
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.cols.iter().map(Vec::len).sum()
    }

    /// Column indices and values of row `i`
    #[must_use]
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        (&self.cols[i], &self.vals[i])
    }

    /// Entry `(i, j)`, zero when not stored
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.cols[i]
            .iter()
            .zip(&self.vals[i])
            .filter(|(&c, _)| c == j)
            .map(|(_, &v)| v)
            .sum()
    }

    /// Stored entries as `(row, col, value)` triplets
    #[must_use]
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        self.cols
            .iter()
            .zip(&self.vals)
            .enumerate()
            .flat_map(|(i, (c, v))| c.iter().zip(v).map(move |(&j, &x)| (i, j, x)))
            .collect()
    }

    /// $\bm{M}x$
    #[must_use]
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.ncols);
        self.cols
            .par_iter()
            .zip(&self.vals)
            .map(|(c, v)| c.iter().zip(v).map(|(&j, &a)| a * x[j]).sum())
            .collect()
    }

    /// $\bm{M}^{\intercal}x$
    #[must_use]
    pub fn t_mul_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.nrows());
        let mut out = vec![0.; self.ncols];
        for ((c, v), &xi) in self.cols.iter().zip(&self.vals).zip(x) {
            for (&j, &a) in c.iter().zip(v) {
                out[j] += a * xi;
            }
        }
        out
    }

    fn diagonal(&self, i: usize) -> f64 {
        self.cols[i]
            .iter()
            .position(|&c| c == i)
            .map_or(1., |p| self.vals[i][p])
    }

    /// Solve $\bm{M}x = b$ for square lower triangular $\bm{M}$
    #[must_use]
    pub fn solve_lower(&self, b: &[f64]) -> Vec<f64> {
        let mut x = b.to_vec();
        for i in 0..self.nrows() {
            let mut s = x[i];
            for (&j, &a) in self.cols[i].iter().zip(&self.vals[i]) {
                if j != i {
                    s -= a * x[j];
                }
            }
            x[i] = s / self.diagonal(i);
        }
        x
    }

    /// Solve $\bm{M}^{\intercal}x = b$ for square lower triangular $\bm{M}$
    #[must_use]
    pub fn solve_lower_t(&self, b: &[f64]) -> Vec<f64> {
        let mut x = b.to_vec();
        for i in (0..self.nrows()).rev() {
            x[i] /= self.diagonal(i);
            let xi = x[i];
            for (&j, &a) in self.cols[i].iter().zip(&self.vals[i]) {
                if j != i {
                    x[j] -= a * xi;
                }
            }
        }
        x
    }

    /// Split into the columns before `at` and the columns from `at` on (re-indexed from 0)
    #[must_use]
    pub fn split_columns(&self, at: usize) -> (SparseRows, SparseRows) {
        let mut left = Vec::with_capacity(self.nrows());
        let mut right = Vec::with_capacity(self.nrows());
        for (c, v) in self.cols.iter().zip(&self.vals) {
            let (mut lc, mut lv, mut rc, mut rv) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
            for (&j, &a) in c.iter().zip(v) {
                if j < at {
                    lc.push(j);
                    lv.push(a);
                } else {
                    rc.push(j - at);
                    rv.push(a);
                }
            }
            left.push((lc, lv));
            right.push((rc, rv));
        }
        (
            SparseRows::from_rows(at, left),
            SparseRows::from_rows(self.ncols - at, right),
        )
    }

    /// The rows `range`, keeping all columns
    #[must_use]
    pub fn slice_rows(&self, range: std::ops::Range<usize>) -> SparseRows {
        SparseRows {
            ncols: self.ncols,
            cols: self.cols[range.clone()].to_vec(),
            vals: self.vals[range].to_vec(),
        }
    }

    /// `out += M^T diag(w) M`
    pub(crate) fn add_gram(&self, w: &[f64], out: &mut Mat<f64>) {
        for ((c, v), &wi) in self.cols.iter().zip(&self.vals).zip(w) {
            for (&ja, &a) in c.iter().zip(v) {
                for (&jb, &b) in c.iter().zip(v) {
                    out.write(ja, jb, out.read(ja, jb) + wi * a * b);
                }
            }
        }
    }

    /// Dense copy
    #[must_use]
    pub fn to_dense(&self) -> Mat<f64> {
        let mut m = Mat::<f64>::zeros(self.nrows(), self.ncols);
        for (i, (c, v)) in self.cols.iter().zip(&self.vals).enumerate() {
            for (&j, &a) in c.iter().zip(v) {
                m.write(i, j, m.read(i, j) + a);
            }
        }
        m
    }
}
