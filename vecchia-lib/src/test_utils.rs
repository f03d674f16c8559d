//! Dense reference computations shared by the unit tests.

use faer::Mat;
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

use crate::{
    coords::Coords,
    covariance::{cov_matrix, CovFunction, Params},
    factor::VecchiaFactors,
    linalg::{cholesky_lower, cholesky_solve},
};

/// Uniform points in the unit cube
pub fn cloud(n: usize, dim: usize, seed: u64) -> Coords {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Coords::from_fn(n, dim, |_, _| rng.gen::<f64>())
}

/// `nx` by `ny` grid with the given spacing
pub fn grid(nx: usize, ny: usize, spacing: f64) -> Coords {
    let rows: Vec<Vec<f64>> = (0..nx)
        .cartesian_product(0..ny)
        .map(|(a, b)| vec![a as f64 * spacing, b as f64 * spacing])
        .collect();
    Coords::from_rows(&rows).unwrap()
}

/// Standard normal draws
pub fn normal_draws(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0., 1.).unwrap();
    (0..n).map(|_| rng.sample(normal)).collect()
}

/// $\bm{K} + \tau^{2}\bm{I}$ of the main GP
pub fn dense_cov<C: CovFunction + ?Sized>(cov: &C, params: &Params, coords: &Coords) -> Mat<f64> {
    let mut k = cov_matrix(cov, params.gp(0, cov.num_pars()), coords, coords);
    for i in 0..coords.len() {
        k.write(i, i, k.read(i, i) + params.nugget);
    }
    k
}

/// $\bm{B}^{-1}\bm{D}\bm{B}^{-\intercal}$ for square factors
pub fn approx_covariance(f: &VecchiaFactors) -> Mat<f64> {
    let n = f.b.nrows();
    let mut b_inv = Mat::<f64>::zeros(n, n);
    for j in 0..n {
        let mut e = vec![0.; n];
        e[j] = 1.;
        let col = f.b.solve_lower(&e);
        for (i, v) in col.into_iter().enumerate() {
            b_inv.write(i, j, v);
        }
    }
    Mat::from_fn(n, n, |a, b| (0..n).map(|l| b_inv.read(a, l) * f.d[l] * b_inv.read(b, l)).sum())
}

/// Largest absolute entrywise difference
pub fn max_abs_diff(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    assert_eq!((a.nrows(), a.ncols()), (b.nrows(), b.ncols()));
    (0..a.nrows())
        .cartesian_product(0..a.ncols())
        .map(|(i, j)| (a.read(i, j) - b.read(i, j)).abs())
        .fold(0., f64::max)
}

pub fn assert_mat_close(a: &Mat<f64>, b: &Mat<f64>, tol: f64) {
    let diff = max_abs_diff(a, b);
    assert!(diff < tol, "matrices differ by {diff}");
}

/// $-\frac{1}{2}(y^{\intercal}\bm{\Sigma}^{-1}y + \log\det\bm{\Sigma} + n\log 2\pi)$
pub fn dense_log_likelihood(sigma: &Mat<f64>, y: &[f64]) -> f64 {
    let n = y.len();
    let l = cholesky_lower(sigma).unwrap();
    let yv = Mat::from_fn(n, 1, |i, _| y[i]);
    let alpha = cholesky_solve(&l, &yv);
    let quad: f64 = (0..n).map(|i| y[i] * alpha.read(i, 0)).sum();
    let logdet: f64 = (0..n).map(|i| 2. * l.read(i, i).ln()).sum();
    -0.5 * (quad + logdet + n as f64 * (2. * std::f64::consts::PI).ln())
}

/// Exact conditional mean and covariance of `pred` given `obs`:
/// $\bm{\Sigma}_{po}\bm{\Sigma}_{oo}^{-1}y$ and $\bm{\Sigma}_{pp} - \bm{\Sigma}_{po}\bm{\Sigma}_{oo}^{-1}\bm{\Sigma}_{op}$
pub fn exact_conditional(
    sigma_oo: &Mat<f64>,
    sigma_po: &Mat<f64>,
    sigma_pp: &Mat<f64>,
    y: &[f64],
) -> (Vec<f64>, Mat<f64>) {
    let l = cholesky_lower(sigma_oo).unwrap();
    let yv = Mat::from_fn(y.len(), 1, |i, _| y[i]);
    let alpha = cholesky_solve(&l, &yv);
    let mean = sigma_po.as_ref() * alpha.as_ref();
    let w = cholesky_solve(&l, &sigma_po.transpose().to_owned());
    let cov = sigma_pp.clone() - sigma_po.as_ref() * w.as_ref();
    ((0..mean.nrows()).map(|i| mean.read(i, 0)).collect(), cov)
}
