//! A Vecchia approximated GP over a fixed set of training points.
//!
//! The model owns the ordered coordinates, the conditioning sets and the factors;
//! an optimiser owns the parameters and hands them in with [VecchiaModel::set_params].
//!
//! For a Gaussian likelihood the log-likelihood is
//!
//! $ \log p(y) = -\frac{1}{2}\left(y^{\intercal}\bm{\Sigma}^{-1}y + \log|\bm{\Sigma}| + n\log 2\pi\right) $
//!
//! with $\bm{\Sigma}^{-1} = \bm{B}^{\intercal}\bm{D}^{-1}\bm{B}$. With inducing points
//! $\bm{\Sigma} = \bm{\Sigma}_{cross}^{\intercal}\bm{\Sigma}_{ip}^{-1}\bm{\Sigma}_{cross} + \bm{R}$ and, writing
//! $\bm{\Pi} = \bm{B}^{\intercal}\bm{D}^{-1}\bm{B} \approx \bm{R}^{-1}$,
//!
//! $ \bm{\Sigma}^{-1} = \bm{\Pi} - \bm{\Pi}\bm{\Sigma}_{cross}^{\intercal}\bm{\Sigma}_{wb}^{-1}\bm{\Sigma}_{cross}\bm{\Pi},
//! \quad \bm{\Sigma}_{wb} = \bm{\Sigma}_{ip} + \bm{\Sigma}_{cross}\bm{\Pi}\bm{\Sigma}_{cross}^{\intercal} $
//!
//! $ \log|\bm{\Sigma}| = \log|\bm{\Sigma}_{wb}| - \log|\bm{\Sigma}_{ip}| + \sum_{i}\log\bm{D}_{ii} $

use std::f64::consts::PI;

use faer::Mat;
use rayon::prelude::*;

use crate::{
    config::{NeighborSelection, VecchiaConfig},
    coords::Coords,
    covariance::{CovFunction, GradScale, Params},
    distance::ResidualCorrelation,
    factor::{build_factors, FactorInputs, FactorOptions, VecchiaFactors},
    inducing::{residual_variances, InducingFactors},
    linalg::{cholesky_lower, cholesky_solve, col_to_vec, col_vec, log_det_cholesky, SparseRows},
    neighbors::{find_neighbors_euclidean, find_neighbors_residual, NeighborQuery, Neighborhoods},
    ordering::{ordering_permutation, permute, unpermute},
    VecchiaError,
};

/// Hook for an optimiser: called once it has converged
pub trait ConvergenceCallback {
    /// Returns `true` if the model changed and the optimisation should continue
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be updated
    fn on_convergence(&mut self) -> Result<bool, VecchiaError>;
}

/// Vecchia (or full-scale Vecchia) GP over the training points
#[derive(Debug)]
pub struct VecchiaModel<C: CovFunction> {
    cov: C,
    config: VecchiaConfig,
    /// internal order
    coords: Coords,
    perm: Vec<usize>,
    /// random coefficient covariates in internal order
    rand_coef: Option<Mat<f64>>,
    params: Params,
    inducing: Option<InducingFactors>,
    neighborhoods: Neighborhoods,
    /// parameters the conditioning sets were found with
    neighbor_params: Params,
    factors: Option<VecchiaFactors>,
}

/// $\bm{\Pi}v = \bm{B}^{\intercal}\bm{D}^{-1}\bm{B}v$
pub(crate) fn apply_precision(f: &VecchiaFactors, v: &[f64]) -> Vec<f64> {
    let bv: Vec<f64> = f.b.mul_vec(v).iter().zip(&f.d_inv).map(|(a, w)| a * w).collect();
    f.b.t_mul_vec(&bv)
}

/// $\bm{\Pi}\bm{X}$ column by column
pub(crate) fn apply_precision_mat(f: &VecchiaFactors, x: &Mat<f64>) -> Mat<f64> {
    let cols: Vec<Vec<f64>> = (0..x.ncols())
        .into_par_iter()
        .map(|j| apply_precision(f, &col_to_vec(x, j)))
        .collect();
    Mat::from_fn(x.nrows(), x.ncols(), |i, j| cols[j][i])
}

/// The Woodbury system of the full-scale approximation
pub(crate) struct Woodbury {
    /// $\bm{\Pi}\bm{\Sigma}_{cross}^{\intercal}$, $n \times m$
    pub pi_cross: Mat<f64>,
    /// Cholesky factor of $\bm{\Sigma}_{wb}$
    pub chol_wb: Mat<f64>,
}

impl Woodbury {
    pub(crate) fn new(f: &VecchiaFactors, ip: &InducingFactors) -> Result<Self, VecchiaError> {
        let pi_cross = apply_precision_mat(f, &ip.sigma_cross.transpose().to_owned());
        let sigma_wb = ip.sigma_ip.clone() + ip.sigma_cross.as_ref() * pi_cross.as_ref();
        let chol_wb = cholesky_lower(&sigma_wb)?;
        Ok(Woodbury { pi_cross, chol_wb })
    }

    /// $\bm{\Sigma}^{-1}y$ given $y$ and $\bm{\Pi}y$
    pub(crate) fn solve(&self, y: &[f64], pi_y: &[f64]) -> Vec<f64> {
        let cpy = self.pi_cross.transpose() * col_vec(y).as_ref();
        let u = cholesky_solve(&self.chol_wb, &cpy);
        let corr = self.pi_cross.as_ref() * u.as_ref();
        pi_y.iter().enumerate().map(|(i, v)| v - corr.read(i, 0)).collect()
    }
}

impl<C: CovFunction> VecchiaModel<C> {
    /// Set up the model: order the points, factorise the inducing points and find
    /// the conditioning sets
    ///
    /// `coords` and the rows of `rand_coef` are in user order. Without inducing points (or with
    /// an empty set) the plain Vecchia approximation is used.
    ///
    /// # Errors
    ///
    /// Returns an error for inconsistent inputs, unsupported combinations, duplicate
    /// coordinates under a non-Gaussian likelihood, or a failed factorisation
    pub fn new(
        cov: C,
        coords: Coords,
        inducing: Option<Coords>,
        rand_coef: Option<Mat<f64>>,
        params: Params,
        config: VecchiaConfig,
    ) -> Result<Self, VecchiaError> {
        config.validate()?;
        let n = coords.len();
        if n == 0 {
            return Err(VecchiaError::MismatchedInputs("no training points".to_string()));
        }
        let inducing = if config.uses_inducing_points() {
            inducing.filter(|u| !u.is_empty())
        } else {
            None
        };
        if config.uses_inducing_points() && inducing.is_none() {
            log::info!("no inducing points given, using the plain Vecchia approximation");
        }
        let rand_coef = rand_coef.filter(|z| z.ncols() > 0);
        if let Some(z) = &rand_coef {
            if z.nrows() != n {
                return Err(VecchiaError::MismatchedInputs(format!(
                    "{} random coefficient rows for {n} points",
                    z.nrows()
                )));
            }
            if inducing.is_some() {
                return Err(VecchiaError::Unsupported(
                    "random coefficients with inducing points".to_string(),
                ));
            }
            if !cov.should_save_distances() {
                return Err(VecchiaError::Unsupported(
                    "random coefficients with a covariance function that scales coordinates"
                        .to_string(),
                ));
            }
        }
        let num_gp = 1 + rand_coef.as_ref().map_or(0, Mat::ncols);
        params.validate(cov.num_pars(), num_gp)?;

        let perm = ordering_permutation(
            config.ordering,
            &coords,
            cov.is_space_time(),
            inducing.is_none(),
            config.seed,
        )?;
        let coords = coords.select(&perm);
        let rand_coef = rand_coef.map(|z| Mat::from_fn(n, z.ncols(), |i, j| z.read(perm[i], j)));
        let inducing = inducing
            .map(|u| InducingFactors::new(&cov, params.gp(0, cov.num_pars()), u, &coords))
            .transpose()?;

        let mut model = VecchiaModel {
            cov,
            config,
            coords,
            perm,
            rand_coef,
            neighbor_params: params.clone(),
            params,
            inducing,
            neighborhoods: Neighborhoods::default(),
            factors: None,
        };
        model.neighborhoods = model.search_training()?;
        Ok(model)
    }

    fn search_training(&self) -> Result<Neighborhoods, VecchiaError> {
        let query = NeighborQuery::training(
            self.config.num_neighbors,
            self.cov.should_save_distances(),
            self.config.check_duplicates,
        );
        let q = self.inducing.as_ref().map(|ip| &ip.chol_ip_cross_cov);
        let nb = search_neighbors(&self.cov, &self.params, &self.config, &self.coords, q, &query);
        if nb.has_duplicates {
            if self.config.is_gaussian() {
                log::info!("duplicate coordinates among the conditioning sets");
            } else {
                return Err(VecchiaError::DuplicateCoordinates(
                    "the Vecchia approximation of a non-Gaussian likelihood needs distinct points"
                        .to_string(),
                ));
            }
        }
        Ok(nb)
    }

    #[must_use]
    pub fn cov(&self) -> &C {
        &self.cov
    }

    #[must_use]
    pub fn config(&self) -> &VecchiaConfig {
        &self.config
    }

    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Number of training points
    #[must_use]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Training points in internal order
    #[must_use]
    pub fn coords(&self) -> &Coords {
        &self.coords
    }

    /// Internal point `r` is user point `ordering()[r]`
    #[must_use]
    pub fn ordering(&self) -> &[usize] {
        &self.perm
    }

    /// Random coefficient covariates in internal order
    #[must_use]
    pub fn rand_coef(&self) -> Option<&Mat<f64>> {
        self.rand_coef.as_ref()
    }

    /// Inducing point factors for the current parameters
    #[must_use]
    pub fn inducing(&self) -> Option<&InducingFactors> {
        self.inducing.as_ref()
    }

    #[must_use]
    pub fn neighborhoods(&self) -> &Neighborhoods {
        &self.neighborhoods
    }

    /// Factors from the last [VecchiaModel::build_factors]
    #[must_use]
    pub fn factors(&self) -> Option<&VecchiaFactors> {
        self.factors.as_ref()
    }

    /// Sparsity pattern of $\bm{B}$ for the current conditioning sets, values zero and unit diagonal
    #[must_use]
    pub fn factor_pattern(&self) -> SparseRows {
        SparseRows::with_pattern(self.len(), &self.neighborhoods.neighbors, Some(0))
    }

    /// Whether the conditioning sets depend on the covariance parameters
    #[must_use]
    pub fn neighbors_depend_on_params(&self) -> bool {
        self.config.neighbor_selection == NeighborSelection::ResidualCorrelation
            || !self.cov.should_save_distances()
    }

    /// Replace the parameters; the conditioning sets are kept
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid parameter vector or if the inducing points
    /// cannot be factorised
    pub fn set_params(&mut self, params: Params) -> Result<(), VecchiaError> {
        params.validate(self.cov.num_pars(), self.num_gp())?;
        if let Some(ip) = &self.inducing {
            let inducing = ip.inducing().clone();
            self.inducing = Some(InducingFactors::new(
                &self.cov,
                params.gp(0, self.cov.num_pars()),
                inducing,
                &self.coords,
            )?);
        }
        self.params = params;
        self.factors = None;
        Ok(())
    }

    /// Number of GPs (1 plus the number of random coefficients)
    #[must_use]
    pub fn num_gp(&self) -> usize {
        1 + self.rand_coef.as_ref().map_or(0, Mat::ncols)
    }

    /// Search the conditioning sets again under the current parameters
    ///
    /// Only done when the sets depend on the parameters and the parameters changed since
    /// the last search. Returns whether the sets changed.
    ///
    /// # Errors
    ///
    /// Returns an error if duplicates appear under a non-Gaussian likelihood
    pub fn redetermine_neighbors(&mut self) -> Result<bool, VecchiaError> {
        if !self.neighbors_depend_on_params() || self.params == self.neighbor_params {
            return Ok(false);
        }
        let nb = self.search_training()?;
        let changed = !nb.same_sets(&self.neighborhoods);
        log::info!(
            "conditioning sets redetermined, {}",
            if changed { "some sets changed" } else { "no set changed" }
        );
        self.neighborhoods = nb;
        self.neighbor_params = self.params.clone();
        if changed {
            self.factors = None;
        }
        Ok(changed)
    }

    pub(crate) fn factor_inputs(&self) -> FactorInputs<'_, C> {
        FactorInputs {
            cov: &self.cov,
            params: &self.params,
            coords: &self.coords,
            nugget: self.config.is_gaussian().then_some(self.params.nugget),
            likelihood: self.config.likelihood,
            chol_ip_cross_cov: self.inducing.as_ref().map(|ip| &ip.chol_ip_cross_cov),
            inducing_grads: None,
            rand_coef: self.rand_coef.as_ref(),
        }
    }

    /// Build $\bm{B}$, $\bm{D}$ (and gradients) for the current parameters
    ///
    /// # Errors
    ///
    /// See [crate::factor::build_factors]
    pub fn build_factors(&mut self, opts: FactorOptions) -> Result<&VecchiaFactors, VecchiaError> {
        let grads = match (&self.inducing, opts.calc_grad) {
            (Some(ip), true) => Some(ip.gradients(
                &self.cov,
                self.params.gp(0, self.cov.num_pars()),
                &self.coords,
                opts.scale,
            )),
            _ => None,
        };
        let inputs = FactorInputs {
            inducing_grads: grads.as_ref(),
            ..self.factor_inputs()
        };
        let factors = build_factors(&inputs, &self.neighborhoods, opts)?;
        Ok(self.factors.insert(factors))
    }

    /// The current factors (built without gradients if missing) and inducing factors
    pub(crate) fn current_factors(
        &mut self,
    ) -> Result<(&VecchiaFactors, Option<&InducingFactors>), VecchiaError> {
        let factors = match self.factors.take() {
            Some(f) => f,
            None => build_factors(
                &self.factor_inputs(),
                &self.neighborhoods,
                FactorOptions::default(),
            )?,
        };
        let f = self.factors.insert(factors);
        Ok((f, self.inducing.as_ref()))
    }

    pub(crate) fn check_response(&self, y: &[f64]) -> Result<(), VecchiaError> {
        if y.len() != self.len() {
            return Err(VecchiaError::MismatchedInputs(format!(
                "{} responses for {} points",
                y.len(),
                self.len()
            )));
        }
        if !self.config.is_gaussian() {
            return Err(VecchiaError::Unsupported(
                "Gaussian computations under a non-Gaussian likelihood".to_string(),
            ));
        }
        Ok(())
    }

    /// $\bm{\Sigma}^{-1}y$ in internal order, `y` in internal order
    pub(crate) fn solve_internal(&mut self, y: &[f64]) -> Result<Vec<f64>, VecchiaError> {
        let (f, inducing) = self.current_factors()?;
        let pi_y = apply_precision(f, y);
        match inducing {
            Some(ip) => Ok(Woodbury::new(f, ip)?.solve(y, &pi_y)),
            None => Ok(pi_y),
        }
    }

    /// $\bm{\Sigma}^{-1}y$, both in user order
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong response length, a non-Gaussian likelihood or a failed factorisation
    pub fn y_aux(&mut self, y: &[f64]) -> Result<Vec<f64>, VecchiaError> {
        self.check_response(y)?;
        let y_int = permute(y, &self.perm);
        Ok(unpermute(&self.solve_internal(&y_int)?, &self.perm))
    }

    /// Gaussian log-likelihood of the responses `y` (user order)
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong response length, a non-Gaussian likelihood or a failed factorisation
    pub fn log_likelihood(&mut self, y: &[f64]) -> Result<f64, VecchiaError> {
        self.check_response(y)?;
        let y = permute(y, &self.perm);
        let (f, inducing) = self.current_factors()?;
        let by = f.b.mul_vec(&y);
        let mut quad: f64 = by.iter().zip(&f.d_inv).map(|(v, w)| v * v * w).sum();
        let mut logdet: f64 = f.d.iter().map(|d| d.ln()).sum();
        if let Some(ip) = inducing {
            let wb = Woodbury::new(f, ip)?;
            let cpy = wb.pi_cross.transpose() * col_vec(&y).as_ref();
            let u = cholesky_solve(&wb.chol_wb, &cpy);
            quad -= (0..cpy.nrows()).map(|k| cpy.read(k, 0) * u.read(k, 0)).sum::<f64>();
            logdet += log_det_cholesky(&wb.chol_wb) - log_det_cholesky(&ip.chol_ip);
        }
        #[allow(clippy::cast_precision_loss)]
        let n = y.len() as f64;
        Ok(-0.5 * (quad + logdet + n * (2. * PI).ln()))
    }

    /// Gradient of [VecchiaModel::log_likelihood] with respect to the covariance parameters
    /// (GP blocks in order) followed by the nugget
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong response length, a non-Gaussian likelihood, inducing points
    /// or a failed factorisation
    pub fn log_likelihood_gradient(
        &mut self,
        y: &[f64],
        scale: GradScale,
    ) -> Result<Vec<f64>, VecchiaError> {
        self.check_response(y)?;
        if self.inducing.is_some() {
            return Err(VecchiaError::Unsupported(
                "the likelihood gradient with inducing points".to_string(),
            ));
        }
        let y = permute(y, &self.perm);
        let f = self.build_factors(FactorOptions::with_gradients(scale))?;
        let by = f.b.mul_vec(&y);
        Ok(f.grads
            .par_iter()
            .map(|g| {
                g.as_ref().map_or(0., |g| {
                    let dby = g.b.mul_vec(&y);
                    -0.5 * (0..by.len())
                        .map(|i| {
                            let w = f.d_inv[i];
                            2. * by[i] * dby[i] * w - by[i] * by[i] * g.d[i] * w * w + g.d[i] * w
                        })
                        .sum::<f64>()
                })
            })
            .collect())
    }
}

impl<C: CovFunction> ConvergenceCallback for VecchiaModel<C> {
    fn on_convergence(&mut self) -> Result<bool, VecchiaError> {
        self.redetermine_neighbors()
    }
}

/// Conditioning sets under the configured selection rule
pub(crate) fn search_neighbors<C: CovFunction + ?Sized>(
    cov: &C,
    params: &Params,
    config: &VecchiaConfig,
    coords: &Coords,
    chol_ip_cross_cov: Option<&Mat<f64>>,
    query: &NeighborQuery,
) -> Neighborhoods {
    let pars = params.gp(0, cov.num_pars());
    match config.neighbor_selection {
        NeighborSelection::Euclidean if cov.should_save_distances() => {
            find_neighbors_euclidean(coords, query)
        }
        NeighborSelection::Euclidean => {
            find_neighbors_euclidean(&cov.scale_coordinates(pars, coords), query)
        }
        NeighborSelection::ResidualCorrelation => {
            let diag = residual_variances(cov, pars, coords, chol_ip_cross_cov);
            let metric = ResidualCorrelation::new(
                cov,
                pars,
                coords,
                chol_ip_cross_cov,
                &diag,
                config.distance_power,
            );
            find_neighbors_residual(
                &metric,
                coords,
                query,
                config.cover_tree_base,
                config.brute_force_threshold,
            )
        }
    }
}
