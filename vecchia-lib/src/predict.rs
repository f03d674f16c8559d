//! Prediction at new points.
//!
//! Training and prediction points are stacked and factorised jointly. Three orderings
//! are supported for the response:
//!
//! * observed first, prediction points conditioning on observed points only
//! * observed first, prediction points conditioning on observed and earlier prediction points
//! * predicted first, where the prediction side precision is
//!   $\bm{B}_{p}^{\intercal}\bm{D}_{p}^{-1}\bm{B}_{p} + \bm{B}_{op}^{\intercal}\bm{D}_{o}^{-1}\bm{B}_{op}$
//!
//! and a latent ordering that approximates the covariance of the latent field over the
//! unique locations and integrates the nugget out by Woodbury.
//!
//! In the observed first orderings
//!
//! $ \mu_{p} = -\bm{B}_{p}^{-1}\bm{B}_{po}y, \quad \bm{\Sigma}_{p} = \bm{B}_{p}^{-1}\bm{D}_{p}\bm{B}_{p}^{-\intercal} $
//!
//! With inducing points, $\bm{W} = \bm{\Sigma}_{cross,p}^{\intercal} + \bm{B}_{p}^{-1}\bm{B}_{po}\bm{\Sigma}_{cross,o}^{\intercal}$
//! adds $\bm{W}\bm{\Sigma}_{wb}^{-1}\bm{\Sigma}_{cross,o}\bm{B}^{\intercal}\bm{D}^{-1}\bm{B}y$ to the mean and
//! $\bm{W}\bm{\Sigma}_{wb}^{-1}\bm{W}^{\intercal}$ to the covariance.

use faer::Mat;
use rayon::prelude::*;

use crate::{
    config::{Likelihood, PredictionMode},
    coords::{unique_coords, Coords},
    covariance::CovFunction,
    factor::{build_factors, FactorInputs, FactorOptions},
    linalg::{cholesky_lower, cholesky_solve, col_to_vec, col_vec, pcg, SparseRows},
    model::{apply_precision_mat, search_neighbors, VecchiaModel, Woodbury},
    neighbors::NeighborQuery,
    ordering::permute,
    VecchiaError,
};

/// Relative residual at which the latent solves stop
const CG_TOLERANCE: f64 = 1e-12;
/// Iteration cap of the latent solves, raised to the number of unique locations
const CG_MAX_ITERATIONS: usize = 1000;

/// What to predict
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredictOptions {
    /// neighbours of the prediction points, the configured value if `None`
    pub num_neighbors: Option<usize>,
    /// full predictive covariance
    pub calc_cov: bool,
    /// predictive variances
    pub calc_var: bool,
    /// include the nugget, i.e. predict new observations instead of the latent field
    pub predict_response: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        PredictOptions {
            num_neighbors: None,
            calc_cov: false,
            calc_var: true,
            predict_response: true,
        }
    }
}

/// Predictive distribution at the prediction points (in the order they were given)
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub mean: Vec<f64>,
    pub cov: Option<Mat<f64>>,
    pub var: Option<Vec<f64>>,
}

/// Observed first factors of the latent field at the prediction points
///
/// Columns of `b_po` follow the internal order of the training points
/// (see [VecchiaModel::ordering]).
#[derive(Clone, Debug, PartialEq)]
pub struct PredictionFactors {
    /// $\bm{B}_{po}$, $n_{p} \times n_{o}$
    pub b_po: SparseRows,
    /// $\bm{B}_{p}$, unit lower triangular $n_{p} \times n_{p}$
    pub b_p: SparseRows,
    /// $\bm{D}_{p}$
    pub d_p: Vec<f64>,
}

/// Stack the rows of two optional matrices
fn stack_rows(a: Option<&Mat<f64>>, b: Option<&Mat<f64>>) -> Option<Mat<f64>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Mat::from_fn(a.nrows() + b.nrows(), a.ncols(), |i, j| {
            if i < a.nrows() {
                a.read(i, j)
            } else {
                b.read(i - a.nrows(), j)
            }
        })),
        _ => None,
    }
}

/// Stack the columns of two matrices with the same number of rows
fn stack_cols(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols() + b.ncols(), |i, j| {
        if j < a.ncols() {
            a.read(i, j)
        } else {
            b.read(i, j - a.ncols())
        }
    })
}

/// $\bm{B}^{-1}$ of a unit lower triangular matrix, dense
fn inverse_lower(b: &SparseRows) -> Mat<f64> {
    let n = b.nrows();
    let cols: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|j| {
            let mut e = vec![0.; n];
            e[j] = 1.;
            b.solve_lower(&e)
        })
        .collect();
    Mat::from_fn(n, n, |i, j| cols[j][i])
}

/// $\bm{B}^{-1}\bm{D}\bm{B}^{-\intercal}$
fn sandwich(b: &SparseRows, d: &[f64]) -> Mat<f64> {
    let x = inverse_lower(b);
    let xd = Mat::from_fn(x.nrows(), x.ncols(), |i, l| x.read(i, l) * d[l]);
    xd.as_ref() * x.transpose()
}

/// Diagonal of $\bm{B}^{-1}\bm{D}\bm{B}^{-\intercal}$ without forming it
fn sandwich_diag(b: &SparseRows, d: &[f64]) -> Vec<f64> {
    let n = b.nrows();
    if b.nnz() == n {
        return d.to_vec();
    }
    (0..n)
        .into_par_iter()
        .map(|l| {
            let mut e = vec![0.; n];
            e[l] = 1.;
            b.solve_lower(&e).into_iter().map(|x| x * x * d[l]).collect::<Vec<f64>>()
        })
        .reduce(
            || vec![0.; n],
            |acc, part| acc.iter().zip(&part).map(|(x, y)| x + y).collect(),
        )
}

fn diagonal(m: &Mat<f64>) -> Vec<f64> {
    (0..m.nrows()).map(|i| m.read(i, i)).collect()
}

fn identity(n: usize) -> Mat<f64> {
    Mat::from_fn(n, n, |i, j| if i == j { 1. } else { 0. })
}

/// Observed first joint factor rows of the prediction points
struct ObservedFirst {
    factors: PredictionFactors,
    /// $\bm{\Sigma}_{cross}$ of the prediction points, $m \times n_{p}$
    cross_pred: Option<Mat<f64>>,
}

impl<C: CovFunction> VecchiaModel<C> {
    fn check_prediction_inputs(
        &self,
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
    ) -> Result<(), VecchiaError> {
        if pred.dim() != self.coords().dim() {
            return Err(VecchiaError::MismatchedInputs(format!(
                "prediction points have dimension {}, training points {}",
                pred.dim(),
                self.coords().dim()
            )));
        }
        match (self.rand_coef(), pred_rand_coef) {
            (Some(z), Some(zp)) if zp.nrows() == pred.len() && zp.ncols() == z.ncols() => Ok(()),
            (None, None) => Ok(()),
            (None, Some(zp)) if zp.ncols() == 0 => Ok(()),
            _ => Err(VecchiaError::MismatchedInputs(
                "random coefficient covariates of the prediction points do not match the model"
                    .to_string(),
            )),
        }
    }

    fn observed_first(
        &self,
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        cond_all: bool,
        k: usize,
        nugget: Option<f64>,
    ) -> Result<ObservedFirst, VecchiaError> {
        let n_o = self.len();
        let all = self.coords().concat(pred)?;
        let pars = self.params().gp(0, self.cov().num_pars());
        let (cross_pred, q_all) = match self.inducing() {
            Some(ip) => {
                let (cross, q) = ip.cross_for(self.cov(), pars, pred);
                let q_all = stack_cols(&ip.chol_ip_cross_cov, &q);
                (Some(cross), Some(q_all))
            }
            None => (None, None),
        };
        let query = NeighborQuery {
            num_neighbors: k,
            start_at: n_o,
            end_search_at: (!cond_all).then(|| n_o - 1),
            save_distances: self.cov().should_save_distances(),
            check_duplicates: self.config().check_duplicates,
            prediction: true,
        };
        let nb = search_neighbors(
            self.cov(),
            self.params(),
            self.config(),
            &all,
            q_all.as_ref(),
            &query,
        );
        if nb.has_duplicates {
            if cond_all && !self.config().is_gaussian() {
                return Err(VecchiaError::DuplicateCoordinates(
                    "prediction points coincide with other points under a non-Gaussian likelihood"
                        .to_string(),
                ));
            }
            log::info!("duplicate coordinates among the prediction conditioning sets");
        }
        let rand_coef = stack_rows(self.rand_coef(), pred_rand_coef);
        let inputs = FactorInputs {
            cov: self.cov(),
            params: self.params(),
            coords: &all,
            nugget,
            likelihood: self.config().likelihood,
            chol_ip_cross_cov: q_all.as_ref(),
            inducing_grads: None,
            rand_coef: rand_coef.as_ref(),
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default())?;
        let (b_po, b_p) = f.b.split_columns(n_o);
        Ok(ObservedFirst {
            factors: PredictionFactors { b_po, b_p, d_p: f.d },
            cross_pred,
        })
    }

    /// $\bm{B}_{po}$, $\bm{B}_{p}$ and $\bm{D}_{p}$ of the latent field, for callers handling
    /// non-Gaussian likelihoods themselves
    ///
    /// # Errors
    ///
    /// Returns an error for mismatched inputs, duplicates between training and prediction
    /// points (with `cond_all` under a non-Gaussian likelihood) or a failed factorisation
    pub fn prediction_factors(
        &self,
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        cond_all: bool,
        num_neighbors: Option<usize>,
    ) -> Result<PredictionFactors, VecchiaError> {
        self.check_prediction_inputs(pred, pred_rand_coef)?;
        let k = num_neighbors.unwrap_or(self.config().num_neighbors_pred());
        Ok(self.observed_first(pred, pred_rand_coef, cond_all, k, None)?.factors)
    }

    /// Predict the response (or latent field) at `pred` given the responses `y` (user order)
    ///
    /// # Errors
    ///
    /// Returns an error for mismatched inputs, a non-Gaussian likelihood, unsupported
    /// combinations or a failed factorisation
    pub fn predict(
        &mut self,
        y: &[f64],
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        mode: PredictionMode,
        opts: &PredictOptions,
    ) -> Result<Prediction, VecchiaError> {
        self.check_response(y)?;
        self.check_prediction_inputs(pred, pred_rand_coef)?;
        if pred.is_empty() {
            return Ok(Prediction {
                mean: Vec::new(),
                cov: opts.calc_cov.then(|| Mat::zeros(0, 0)),
                var: opts.calc_var.then(Vec::new),
            });
        }
        let y = permute(y, self.ordering());
        let k = opts.num_neighbors.unwrap_or(self.config().num_neighbors_pred());
        let mut out = match mode {
            PredictionMode::ObservedFirstCondObsOnly => {
                self.predict_observed_first(&y, pred, pred_rand_coef, false, k, opts)?
            }
            PredictionMode::ObservedFirstCondAll => {
                self.predict_observed_first(&y, pred, pred_rand_coef, true, k, opts)?
            }
            PredictionMode::PredictedFirst => {
                self.predict_predicted_first(&y, pred, pred_rand_coef, k, opts)?
            }
            PredictionMode::LatentCondObsOnly => {
                return self.predict_latent(&y, pred, pred_rand_coef, false, k, opts)
            }
            PredictionMode::LatentCondAll => {
                return self.predict_latent(&y, pred, pred_rand_coef, true, k, opts)
            }
        };
        if !opts.predict_response {
            let nugget = self.params().nugget;
            if let Some(cov) = &mut out.cov {
                for i in 0..cov.nrows() {
                    cov.write(i, i, cov.read(i, i) - nugget);
                }
            }
            if let Some(var) = &mut out.var {
                for v in var {
                    *v -= nugget;
                }
            }
        }
        Ok(out)
    }

    fn predict_observed_first(
        &mut self,
        y: &[f64],
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        cond_all: bool,
        k: usize,
        opts: &PredictOptions,
    ) -> Result<Prediction, VecchiaError> {
        let nugget = self.params().nugget;
        let ObservedFirst { factors, cross_pred } =
            self.observed_first(pred, pred_rand_coef, cond_all, k, Some(nugget))?;
        let PredictionFactors { b_po, b_p, d_p } = factors;
        let n_p = pred.len();

        let mut mean: Vec<f64> = b_p.solve_lower(&b_po.mul_vec(y)).iter().map(|v| -v).collect();
        let mut cov = opts.calc_cov.then(|| sandwich(&b_p, &d_p));
        let mut var = opts.calc_var.then(|| sandwich_diag(&b_p, &d_p));

        let Some(cross_pred) = cross_pred else {
            return Ok(Prediction { mean, cov, var });
        };
        if let (f, Some(ip)) = self.current_factors()? {
            let wb = Woodbury::new(f, ip)?;
            let m = ip.num_inducing();
            // W = C_p + B_p^{-1} B_po C_o, one column per inducing point
            let w_cols: Vec<Vec<f64>> = (0..m)
                .into_par_iter()
                .map(|l| {
                    let c_o: Vec<f64> = (0..ip.sigma_cross.ncols())
                        .map(|i| ip.sigma_cross.read(l, i))
                        .collect();
                    let mut col = b_p.solve_lower(&b_po.mul_vec(&c_o));
                    for (r, v) in col.iter_mut().enumerate() {
                        *v += cross_pred.read(l, r);
                    }
                    col
                })
                .collect();
            let w = Mat::from_fn(n_p, m, |r, l| w_cols[l][r]);
            // Sigma_wb^{-1} Sigma_cross Pi y
            let cpy = wb.pi_cross.transpose() * col_vec(y).as_ref();
            let v = cholesky_solve(&wb.chol_wb, &cpy);
            let wv = w.as_ref() * v.as_ref();
            for (r, mu) in mean.iter_mut().enumerate() {
                *mu += wv.read(r, 0);
            }
            if opts.calc_cov || opts.calc_var {
                let wt = cholesky_solve(&wb.chol_wb, &w.transpose().to_owned());
                if let Some(cov) = &mut cov {
                    *cov = cov.clone() + w.as_ref() * wt.as_ref();
                }
                if let Some(var) = &mut var {
                    for (r, v) in var.iter_mut().enumerate() {
                        *v += (0..m).map(|l| w.read(r, l) * wt.read(l, r)).sum::<f64>();
                    }
                }
            }
        }
        Ok(Prediction { mean, cov, var })
    }

    fn predict_predicted_first(
        &mut self,
        y: &[f64],
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        k: usize,
        opts: &PredictOptions,
    ) -> Result<Prediction, VecchiaError> {
        let n_p = pred.len();
        let all = pred.concat(self.coords())?;
        let n = all.len();
        let pars = self.params().gp(0, self.cov().num_pars());
        let fsa = self.inducing().map(|ip| {
            let (cross_pred, q_pred) = ip.cross_for(self.cov(), pars, pred);
            (
                ip.sigma_ip.clone(),
                stack_cols(&cross_pred, &ip.sigma_cross),
                stack_cols(&q_pred, &ip.chol_ip_cross_cov),
            )
        });
        let query = NeighborQuery::training(
            k,
            self.cov().should_save_distances(),
            self.config().check_duplicates,
        );
        let nb = search_neighbors(
            self.cov(),
            self.params(),
            self.config(),
            &all,
            fsa.as_ref().map(|(_, _, q)| q),
            &query,
        );
        if nb.has_duplicates {
            log::info!("duplicate coordinates among the predicted first conditioning sets");
        }
        let rand_coef = stack_rows(pred_rand_coef, self.rand_coef());
        let inputs = FactorInputs {
            cov: self.cov(),
            params: self.params(),
            coords: &all,
            nugget: Some(self.params().nugget),
            likelihood: Likelihood::Gaussian,
            chol_ip_cross_cov: fsa.as_ref().map(|(_, _, q)| q),
            inducing_grads: None,
            rand_coef: rand_coef.as_ref(),
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default())?;

        let (b_p, _) = f.b.slice_rows(0..n_p).split_columns(n_p);
        let (b_op, b_o) = f.b.slice_rows(n_p..n).split_columns(n_p);
        let (d_inv_p, d_inv_o) = f.d_inv.split_at(n_p);
        let mut precision = Mat::<f64>::zeros(n_p, n_p);
        b_p.add_gram(d_inv_p, &mut precision);
        b_op.add_gram(d_inv_o, &mut precision);
        let bo_y: Vec<f64> = b_o.mul_vec(y).iter().zip(d_inv_o).map(|(a, w)| a * w).collect();
        let mut rhs = b_op.t_mul_vec(&bo_y);

        if let Some((sigma_ip, cross_all, _)) = &fsa {
            // U = Pi C, W = Sigma_ip + C^T U over all points
            let u = apply_precision_mat(&f, &cross_all.transpose().to_owned());
            let w = sigma_ip.clone() + cross_all.as_ref() * u.as_ref();
            let chol_w = cholesky_lower(&w)?;
            let m = w.nrows();
            let u_p = Mat::from_fn(n_p, m, |r, l| u.read(r, l));
            let u_o = Mat::from_fn(n - n_p, m, |r, l| u.read(n_p + r, l));
            let w_inv_upt = cholesky_solve(&chol_w, &u_p.transpose().to_owned());
            precision = precision - u_p.as_ref() * w_inv_upt.as_ref();
            let uo_y = u_o.transpose() * col_vec(y).as_ref();
            let corr = u_p.as_ref() * cholesky_solve(&chol_w, &uo_y).as_ref();
            for (r, v) in rhs.iter_mut().enumerate() {
                *v -= corr.read(r, 0);
            }
        }

        let chol = cholesky_lower(&precision)?;
        let mu = cholesky_solve(&chol, &col_vec(&rhs));
        let mean = col_to_vec(&mu, 0).into_iter().map(|v| -v).collect();
        let cov = (opts.calc_cov || opts.calc_var).then(|| cholesky_solve(&chol, &identity(n_p)));
        Ok(Prediction {
            mean,
            var: if opts.calc_var { cov.as_ref().map(diagonal) } else { None },
            cov: if opts.calc_cov { cov } else { None },
        })
    }

    #[allow(clippy::too_many_lines)]
    fn predict_latent(
        &mut self,
        y: &[f64],
        pred: &Coords,
        pred_rand_coef: Option<&Mat<f64>>,
        cond_all: bool,
        k: usize,
        opts: &PredictOptions,
    ) -> Result<Prediction, VecchiaError> {
        if self.inducing().is_some() {
            return Err(VecchiaError::Unsupported(
                "latent prediction with inducing points".to_string(),
            ));
        }
        if self.rand_coef().is_some() || pred_rand_coef.is_some_and(|z| z.ncols() > 0) {
            return Err(VecchiaError::Unsupported(
                "latent prediction with random coefficients".to_string(),
            ));
        }
        let tau2 = self.params().nugget;
        if tau2 <= 0. {
            return Err(VecchiaError::Unsupported(
                "latent prediction needs a positive nugget".to_string(),
            ));
        }
        let n_o = self.len();
        let n_p = pred.len();
        let all = self.coords().concat(pred)?;
        let uc = unique_coords(&all);
        let n_u = uc.num_unique();
        // first appearance order puts the observed locations first
        let n_uo = uc.unique_idx[..n_o].iter().max().map_or(0, |m| m + 1);
        let query = NeighborQuery {
            num_neighbors: k,
            start_at: 0,
            end_search_at: (!cond_all).then(|| n_uo - 1),
            save_distances: self.cov().should_save_distances(),
            check_duplicates: true,
            prediction: false,
        };
        let nb = search_neighbors(
            self.cov(),
            self.params(),
            self.config(),
            &uc.unique,
            None,
            &query,
        );
        if nb.has_duplicates {
            return Err(VecchiaError::DuplicateCoordinates(
                "distinct but numerically coincident locations in latent prediction".to_string(),
            ));
        }
        let inputs = FactorInputs {
            cov: self.cov(),
            params: self.params(),
            coords: &uc.unique,
            nugget: None,
            likelihood: Likelihood::Gaussian,
            chol_ip_cross_cov: None,
            inducing_grads: None,
            rand_coef: None,
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default())?;
        let obs_idx = &uc.unique_idx[..n_o];
        let pred_idx = &uc.unique_idx[n_o..];

        // with Sigma_u^{-1} = B^T D^{-1} B the latent posterior over the unique locations is
        // N(M^{-1} Z_o^T y, tau^2 M^{-1}) for M = tau^2 B^T D^{-1} B + Z_o^T Z_o
        let mut counts = vec![0.; n_u];
        for &u in obs_idx {
            counts[u] += 1.;
        }
        let scaled: Vec<f64> = f.d_inv.iter().map(|w| w * tau2).collect();
        let apply_m = |v: &[f64]| -> Vec<f64> {
            let bv: Vec<f64> = f.b.mul_vec(v).iter().zip(&scaled).map(|(a, w)| a * w).collect();
            let mut out = f.b.t_mul_vec(&bv);
            for ((o, c), x) in out.iter_mut().zip(&counts).zip(v) {
                *o += c * x;
            }
            out
        };
        // P = B^T (tau^2 D^{-1} + diag(Z_o^T Z_o)) B
        let precond_diag: Vec<f64> = scaled.iter().zip(&counts).map(|(w, c)| w + c).collect();
        let precond = |v: &[f64]| -> Vec<f64> {
            let t: Vec<f64> = f
                .b
                .solve_lower_t(v)
                .iter()
                .zip(&precond_diag)
                .map(|(a, p)| a / p)
                .collect();
            f.b.solve_lower(&t)
        };
        let solve_m = |rhs: &[f64]| -> Vec<f64> {
            let sol = pcg(&apply_m, &precond, rhs, CG_TOLERANCE, CG_MAX_ITERATIONS.max(n_u));
            if !sol.converged {
                log::warn!("conjugate gradients did not converge in {} iterations", sol.iterations);
            }
            sol.x
        };

        let mut zt_y = vec![0.; n_u];
        for (&u, v) in obs_idx.iter().zip(y) {
            zt_y[u] += v;
        }
        let post_mean = solve_m(&zt_y);
        let mean = pred_idx.iter().map(|&u| post_mean[u]).collect();

        let nugget = if opts.predict_response { tau2 } else { 0. };
        // column j: tau^2 M^{-1} e_{u_j} at the prediction locations, or only its j-th entry
        let cols: Vec<Vec<f64>> = if opts.calc_cov || opts.calc_var {
            pred_idx
                .par_iter()
                .map(|&u| {
                    let mut e = vec![0.; n_u];
                    e[u] = 1.;
                    let col = solve_m(&e);
                    if opts.calc_cov {
                        pred_idx.iter().map(|&w| tau2 * col[w]).collect()
                    } else {
                        vec![tau2 * col[u]]
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        let var = opts.calc_var.then(|| {
            (0..n_p)
                .map(|j| (if opts.calc_cov { cols[j][j] } else { cols[j][0] }) + nugget)
                .collect()
        });
        let cov = opts.calc_cov.then(|| {
            Mat::from_fn(n_p, n_p, |a, b| {
                0.5 * (cols[a][b] + cols[b][a]) + if a == b { nugget } else { 0. }
            })
        });
        Ok(Prediction { mean, cov, var })
    }
}
