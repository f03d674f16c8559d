//! Inducing point factors of the full-scale approximation.
//!
//! With inducing points $u_{1}, \dots, u_{m}$ the covariance is split into the predictive
//! process part and a residual,
//!
//! $ \bm{\Sigma} = \bm{\Sigma}_{cross}^{\intercal}\bm{\Sigma}_{ip}^{-1}\bm{\Sigma}_{cross} + \bm{R} $,
//! $\quad \bm{R}_{ij} = c(x_{i}, x_{j}) - Q_{i}^{\intercal}Q_{j}$, $\quad \bm{Q} = \bm{L}_{ip}^{-1}\bm{\Sigma}_{cross}$.

use faer::Mat;
use rayon::prelude::*;

use crate::{
    coords::Coords,
    covariance::{cov_matrix, cov_matrix_grad, CovFunction, GradScale},
    linalg::{cholesky_lower, cholesky_solve, solve_lower, EPSILON_ADD_COVARIANCE_STABLE},
    VecchiaError,
};

/// Factorisation of the inducing point covariance and its cross covariance with the data
#[derive(Clone, Debug)]
pub struct InducingFactors {
    inducing: Coords,
    /// $\bm{\Sigma}_{ip}$, $m \times m$ (stabilised diagonal)
    pub sigma_ip: Mat<f64>,
    /// $\bm{L}_{ip}$
    pub chol_ip: Mat<f64>,
    /// $\bm{\Sigma}_{cross}$, $m \times n$
    pub sigma_cross: Mat<f64>,
    /// $\bm{Q} = \bm{L}_{ip}^{-1}\bm{\Sigma}_{cross}$, $m \times n$
    pub chol_ip_cross_cov: Mat<f64>,
}

/// Helpers for the gradient of the residual covariance
#[derive(Clone, Debug)]
pub struct InducingGradients {
    /// $\bm{\Sigma}_{ip}^{-1}\bm{\Sigma}_{cross}$
    pub sigma_ip_inv_cross_cov: Mat<f64>,
    /// $\partial\bm{\Sigma}_{cross}/\partial\theta_{p}$
    pub cross_cov_grad: Vec<Mat<f64>>,
    /// $\partial\bm{\Sigma}_{ip}/\partial\theta_{p} \, \bm{\Sigma}_{ip}^{-1}\bm{\Sigma}_{cross}$
    pub ip_grad_inv_cross_cov: Vec<Mat<f64>>,
}

impl InducingFactors {
    /// Factorise for the main GP with parameters `pars`
    ///
    /// # Errors
    ///
    /// Returns an error if the dimensions disagree or $\bm{\Sigma}_{ip}$ is not positive definite
    pub fn new<C: CovFunction + ?Sized>(
        cov: &C,
        pars: &[f64],
        inducing: Coords,
        coords: &Coords,
    ) -> Result<Self, VecchiaError> {
        if inducing.dim() != coords.dim() {
            return Err(VecchiaError::MismatchedInputs(format!(
                "inducing points have dimension {}, data {}",
                inducing.dim(),
                coords.dim()
            )));
        }
        let mut sigma_ip = cov_matrix(cov, pars, &inducing, &inducing);
        for i in 0..sigma_ip.nrows() {
            sigma_ip.write(i, i, sigma_ip.read(i, i) + EPSILON_ADD_COVARIANCE_STABLE);
        }
        let chol_ip = cholesky_lower(&sigma_ip)?;
        let sigma_cross = cov_matrix(cov, pars, &inducing, coords);
        let chol_ip_cross_cov = solve_lower(&chol_ip, &sigma_cross);
        Ok(InducingFactors {
            inducing,
            sigma_ip,
            chol_ip,
            sigma_cross,
            chol_ip_cross_cov,
        })
    }

    /// Number of inducing points $m$
    #[must_use]
    pub fn num_inducing(&self) -> usize {
        self.inducing.len()
    }

    #[must_use]
    pub fn inducing(&self) -> &Coords {
        &self.inducing
    }

    /// $\bm{\Sigma}_{cross}$ and $\bm{Q}$ for other points
    #[must_use]
    pub fn cross_for<C: CovFunction + ?Sized>(
        &self,
        cov: &C,
        pars: &[f64],
        coords: &Coords,
    ) -> (Mat<f64>, Mat<f64>) {
        let cross = cov_matrix(cov, pars, &self.inducing, coords);
        let q = solve_lower(&self.chol_ip, &cross);
        (cross, q)
    }

    /// Gradient helpers for the points `coords` (the ones `sigma_cross` was built for)
    #[must_use]
    pub fn gradients<C: CovFunction + ?Sized>(
        &self,
        cov: &C,
        pars: &[f64],
        coords: &Coords,
        scale: GradScale,
    ) -> InducingGradients {
        let sigma_ip_inv_cross_cov = cholesky_solve(&self.chol_ip, &self.sigma_cross);
        let cross_cov_grad = cov_matrix_grad(cov, pars, &self.inducing, coords, scale);
        let ip_grad_inv_cross_cov =
            cov_matrix_grad(cov, pars, &self.inducing, &self.inducing, scale)
                .iter()
                .map(|g| g.as_ref() * sigma_ip_inv_cross_cov.as_ref())
                .collect();
        InducingGradients {
            sigma_ip_inv_cross_cov,
            cross_cov_grad,
            ip_grad_inv_cross_cov,
        }
    }
}

/// Prior variance of the (residual) process at every point,
/// $c(x_{i}, x_{i}) - \|Q_{i}\|^{2}$, or $c(x_{i}, x_{i})$ without inducing points
#[must_use]
pub fn residual_variances<C: CovFunction + ?Sized>(
    cov: &C,
    pars: &[f64],
    coords: &Coords,
    q: Option<&Mat<f64>>,
) -> Vec<f64> {
    (0..coords.len())
        .into_par_iter()
        .map(|i| {
            let x = coords.row(i);
            let k = cov.covariance(x, x, Some(0.), pars);
            k - q.map_or(0., |q| col_dot(q, i, q, i))
        })
        .collect()
}

/// $a_{:,i}^{\intercal} b_{:,j}$
pub(crate) fn col_dot(a: &Mat<f64>, i: usize, b: &Mat<f64>, j: usize) -> f64 {
    (0..a.nrows()).map(|r| a.read(r, i) * b.read(r, j)).sum()
}
