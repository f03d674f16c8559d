//! Construction of the Vecchia factors $\bm{B}$, $\bm{D}$ and their parameter derivatives.
//!
//! For point $i$ with neighbours $N = N(i)$ let $\bm{C}_{NN}$ be the covariance of the
//! neighbours (plus nugget) and $c_{iN}$ the covariance between $i$ and its neighbours. Then
//!
//! $A_{i} = \bm{C}_{NN}^{-1}c_{iN}, \quad \bm{B}_{i,N} = -A_{i}^{\intercal}, \quad \bm{D}_{ii} = \sigma^{2} + \tau^{2} - A_{i}^{\intercal}c_{iN}$
//!
//! and for a parameter $\theta_{p}$
//!
//! $\partial A_{i} = \bm{C}_{NN}^{-1}(\partial c_{iN} - \partial\bm{C}_{NN}A_{i}), \quad
//! \partial\bm{D}_{ii} = \partial\sigma^{2} - \partial A_{i}^{\intercal}c_{iN} - A_{i}^{\intercal}\partial c_{iN}$.
//!
//! With inducing points every covariance is replaced by the residual covariance
//! $c(x, y) - Q_{x}^{\intercal}Q_{y}$. Random coefficient GPs $j \ge 1$ contribute
//! $z_{x}^{(j)}z_{y}^{(j)}c_{j}(x, y)$.
//!
//! Rows are independent and built in parallel.

use faer::Mat;
use rayon::prelude::*;

use crate::{
    config::Likelihood,
    coords::Coords,
    covariance::{cov_block, CovFunction, GradScale, Params},
    inducing::{col_dot, InducingGradients},
    linalg::{cholesky_lower, cholesky_solve, SparseRows, EPSILON_ADD_COVARIANCE_STABLE},
    neighbors::Neighborhoods,
    VecchiaError,
};

/// What to compute besides $\bm{B}$ and $\bm{D}$
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactorOptions {
    /// compute $\partial\bm{B}$ and $\partial\bm{D}$ for every covariance parameter
    pub calc_grad: bool,
    pub scale: GradScale,
    /// also differentiate with respect to the nugget
    pub nugget_grad: bool,
}

impl FactorOptions {
    /// Gradients for every covariance parameter and the nugget
    #[must_use]
    pub fn with_gradients(scale: GradScale) -> Self {
        FactorOptions {
            calc_grad: true,
            scale,
            nugget_grad: true,
        }
    }
}

/// Derivative of the factors with respect to one parameter
#[derive(Clone, Debug, PartialEq)]
pub struct ParamGradient {
    /// $\partial\bm{B}$, same pattern as $\bm{B}$ without the diagonal
    pub b: SparseRows,
    /// $\partial\bm{D}$
    pub d: Vec<f64>,
}

/// The factors $\bm{B}$, $\bm{D}$ of $\bm{\Sigma}^{-1} \approx \bm{B}^{\intercal}\bm{D}^{-1}\bm{B}$
#[derive(Clone, Debug, PartialEq)]
pub struct VecchiaFactors {
    /// rows for the points `start_at..`, columns for all points
    pub b: SparseRows,
    pub d: Vec<f64>,
    pub d_inv: Vec<f64>,
    /// one entry per covariance parameter (GP blocks in order), then the nugget;
    /// `None` where the derivative is skipped
    pub grads: Vec<Option<ParamGradient>>,
}

/// Everything the factor builder reads
pub struct FactorInputs<'a, C: ?Sized> {
    pub cov: &'a C,
    pub params: &'a Params,
    pub coords: &'a Coords,
    /// nugget added to the diagonal; `None` stabilises the latent covariance instead
    pub nugget: Option<f64>,
    pub likelihood: Likelihood,
    /// $\bm{Q}$ for all points of `coords` when inducing points are used
    pub chol_ip_cross_cov: Option<&'a Mat<f64>>,
    /// required for gradients with inducing points
    pub inducing_grads: Option<&'a InducingGradients>,
    /// covariates of the random coefficients, one column per coefficient
    pub rand_coef: Option<&'a Mat<f64>>,
}

struct RowFactor {
    b: Vec<f64>,
    d: f64,
    b_grad: Vec<Vec<f64>>,
    d_grad: Vec<f64>,
}

impl<C: CovFunction + ?Sized> FactorInputs<'_, C> {
    fn num_gp(&self) -> usize {
        1 + self.rand_coef.map_or(0, Mat::ncols)
    }

    /// Weight $z^{(j)}_{x}$ of GP `j` at point `x`
    fn z(&self, j: usize, x: usize) -> f64 {
        match (j, self.rand_coef) {
            (0, _) | (_, None) => 1.,
            (j, Some(z)) => z.read(x, j - 1),
        }
    }

    /// The marginal variance derivative is not needed for a single latent GP
    fn skips_variance_grad(&self) -> bool {
        self.likelihood == Likelihood::NonGaussian
            && self.num_gp() == 1
            && self.chol_ip_cross_cov.is_none()
    }

    #[allow(clippy::too_many_lines)]
    fn row(
        &self,
        i: usize,
        nbrs: &[usize],
        dist_obs: Option<&Mat<f64>>,
        dist_between: Option<&Mat<f64>>,
        opts: FactorOptions,
    ) -> Result<RowFactor, VecchiaError> {
        let np = self.cov.num_pars();
        let num_gp = self.num_gp();
        let num_cov_par = np * num_gp;
        let nugget_grad = opts.calc_grad && opts.nugget_grad && self.nugget.is_some();
        let num_grad = if opts.calc_grad {
            num_cov_par + usize::from(nugget_grad)
        } else {
            0
        };
        let skip0 = self.skips_variance_grad();
        let nn = nbrs.len();

        let mut d = self.nugget.unwrap_or(0.);
        let mut d_grad = vec![0.; num_grad];
        for j in 0..num_gp {
            let w = self.z(j, i).powi(2);
            let var = self.params.gp(j, np)[0];
            d += var * w;
            if opts.calc_grad {
                d_grad[j * np] = match opts.scale {
                    GradScale::Log => var * w,
                    GradScale::Original => w,
                };
            }
        }
        if let Some(q) = self.chol_ip_cross_cov {
            d -= col_dot(q, i, q, i);
        }
        if nugget_grad {
            d_grad[num_cov_par] = 1.;
        }

        let mut b = Vec::new();
        let mut b_grad = vec![vec![0.; nn]; num_grad];
        if nn > 0 {
            let mut c_in = Mat::<f64>::zeros(nn, 1);
            let mut c_nn = Mat::<f64>::zeros(nn, nn);
            let mut g_in = Vec::with_capacity(num_grad);
            let mut g_nn = Vec::with_capacity(num_grad);
            for j in 0..num_gp {
                let pars = self.params.gp(j, np);
                let blk_in = cov_block(
                    self.cov,
                    pars,
                    self.coords,
                    nbrs,
                    &[i],
                    dist_obs,
                    opts.calc_grad,
                    opts.scale,
                    false,
                );
                let blk_nn = cov_block(
                    self.cov,
                    pars,
                    self.coords,
                    nbrs,
                    nbrs,
                    dist_between,
                    opts.calc_grad,
                    opts.scale,
                    true,
                );
                let w_in = |a: usize| self.z(j, nbrs[a]) * self.z(j, i);
                let w_nn = |a: usize, b: usize| self.z(j, nbrs[a]) * self.z(j, nbrs[b]);
                for a in 0..nn {
                    c_in.write(a, 0, c_in.read(a, 0) + w_in(a) * blk_in.cov.read(a, 0));
                    for bb in 0..nn {
                        c_nn.write(a, bb, c_nn.read(a, bb) + w_nn(a, bb) * blk_nn.cov.read(a, bb));
                    }
                }
                for (gi, gn) in blk_in.grads.iter().zip(&blk_nn.grads) {
                    g_in.push(Mat::from_fn(nn, 1, |a, _| w_in(a) * gi.read(a, 0)));
                    g_nn.push(Mat::from_fn(nn, nn, |a, bb| w_nn(a, bb) * gn.read(a, bb)));
                }
            }

            if let Some(q) = self.chol_ip_cross_cov {
                for a in 0..nn {
                    c_in.write(a, 0, c_in.read(a, 0) - col_dot(q, nbrs[a], q, i));
                    for bb in 0..nn {
                        c_nn.write(a, bb, c_nn.read(a, bb) - col_dot(q, nbrs[a], q, nbrs[bb]));
                    }
                }
                if opts.calc_grad {
                    let h = self.inducing_grads.ok_or_else(|| {
                        VecchiaError::MismatchedInputs(
                            "gradients with inducing points need the inducing gradient helpers"
                                .to_string(),
                        )
                    })?;
                    // d(Q_x'Q_y) = dC_x'V_y + V_x'dC_y - V_x' dSigma_ip V_y
                    let low_rank_grad = |p: usize, x: usize, y: usize| {
                        let v = &h.sigma_ip_inv_cross_cov;
                        let dc = &h.cross_cov_grad[p];
                        let g = &h.ip_grad_inv_cross_cov[p];
                        col_dot(dc, x, v, y) + col_dot(v, x, dc, y) - col_dot(v, x, g, y)
                    };
                    for (p, (gi, gn)) in g_in.iter_mut().zip(g_nn.iter_mut()).take(np).enumerate() {
                        for a in 0..nn {
                            let v = gi.read(a, 0) - low_rank_grad(p, nbrs[a], i);
                            gi.write(a, 0, v);
                            for bb in 0..nn {
                                let v = gn.read(a, bb) - low_rank_grad(p, nbrs[a], nbrs[bb]);
                                gn.write(a, bb, v);
                            }
                        }
                    }
                }
            }

            let jitter = self.nugget.unwrap_or(EPSILON_ADD_COVARIANCE_STABLE);
            for a in 0..nn {
                c_nn.write(a, a, c_nn.read(a, a) + jitter);
            }
            let l = cholesky_lower(&c_nn)?;
            let a_i = cholesky_solve(&l, &c_in);
            b = (0..nn).map(|a| -a_i.read(a, 0)).collect();
            d -= (0..nn).map(|a| a_i.read(a, 0) * c_in.read(a, 0)).sum::<f64>();

            if opts.calc_grad {
                for p in 0..num_cov_par {
                    if p == 0 && skip0 {
                        continue;
                    }
                    let ga = g_nn[p].as_ref() * a_i.as_ref();
                    let rhs = Mat::from_fn(nn, 1, |a, _| g_in[p].read(a, 0) - ga.read(a, 0));
                    let da = cholesky_solve(&l, &rhs);
                    b_grad[p] = (0..nn).map(|a| -da.read(a, 0)).collect();
                    let delta: f64 = (0..nn)
                        .map(|a| {
                            da.read(a, 0) * c_in.read(a, 0) + a_i.read(a, 0) * g_in[p].read(a, 0)
                        })
                        .sum();
                    if p % np == 0 {
                        d_grad[p] -= delta;
                    } else {
                        d_grad[p] = -delta;
                    }
                }
                if nugget_grad {
                    // dA = -C_NN^{-1} A
                    let da = cholesky_solve(&l, &a_i);
                    b_grad[num_cov_par] = (0..nn).map(|a| da.read(a, 0)).collect();
                    d_grad[num_cov_par] += (0..nn)
                        .map(|a| da.read(a, 0) * c_in.read(a, 0))
                        .sum::<f64>();
                }
            }
        }

        if opts.calc_grad {
            if let (Some(_), Some(h)) = (self.chol_ip_cross_cov, self.inducing_grads) {
                let v = &h.sigma_ip_inv_cross_cov;
                for p in 0..np {
                    d_grad[p] -= 2. * col_dot(&h.cross_cov_grad[p], i, v, i)
                        - col_dot(v, i, &h.ip_grad_inv_cross_cov[p], i);
                }
            }
        }
        if nugget_grad && opts.scale == GradScale::Log {
            let tau2 = self.nugget.unwrap_or(0.);
            d_grad[num_cov_par] *= tau2;
            for v in &mut b_grad[num_cov_par] {
                *v *= tau2;
            }
        }

        Ok(RowFactor {
            b,
            d,
            b_grad,
            d_grad,
        })
    }
}

/// Build $\bm{B}$, $\bm{D}$ (and derivatives) for every point with a conditioning set
///
/// # Errors
///
/// Returns an error if a neighbour covariance is not positive definite, or a conditional
/// variance is non-positive under a non-Gaussian likelihood (only logged when Gaussian)
pub fn build_factors<C: CovFunction + ?Sized>(
    inputs: &FactorInputs<'_, C>,
    neighborhoods: &Neighborhoods,
    opts: FactorOptions,
) -> Result<VecchiaFactors, VecchiaError> {
    let n_all = inputs.coords.len();
    let start = neighborhoods.start_at;
    if start + neighborhoods.len() != n_all {
        return Err(VecchiaError::MismatchedInputs(format!(
            "{} conditioning sets from {start} do not cover {n_all} points",
            neighborhoods.len()
        )));
    }
    if let Some(z) = inputs.rand_coef {
        if z.nrows() != n_all {
            return Err(VecchiaError::MismatchedInputs(format!(
                "{} random coefficient rows for {n_all} points",
                z.nrows()
            )));
        }
    }
    let saved = neighborhoods.saves_distances();
    let rows: Vec<RowFactor> = (0..neighborhoods.len())
        .into_par_iter()
        .map(|r| {
            inputs.row(
                start + r,
                &neighborhoods.neighbors[r],
                saved.then(|| &neighborhoods.dist_obs_neighbors[r]),
                saved.then(|| &neighborhoods.dist_between_neighbors[r]),
                opts,
            )
        })
        .collect::<Result<_, _>>()?;

    let mut non_positive = 0;
    for (r, row) in rows.iter().enumerate() {
        if row.d <= 0. {
            if inputs.likelihood == Likelihood::NonGaussian {
                return Err(VecchiaError::NonPositiveD {
                    index: start + r,
                    value: row.d,
                });
            }
            non_positive += 1;
        }
    }
    if non_positive > 0 {
        log::warn!("{non_positive} entries of the Vecchia diagonal D are not positive");
    }

    let num_grad = rows.first().map_or(0, |r| r.d_grad.len());
    let skip0 = opts.calc_grad && inputs.skips_variance_grad();
    let grads = (0..num_grad)
        .map(|p| {
            (!(p == 0 && skip0)).then(|| ParamGradient {
                b: SparseRows::from_rows(
                    n_all,
                    rows.iter()
                        .zip(&neighborhoods.neighbors)
                        .map(|(row, nb)| (nb.clone(), row.b_grad[p].clone()))
                        .collect(),
                ),
                d: rows.iter().map(|row| row.d_grad[p]).collect(),
            })
        })
        .collect();

    let d: Vec<f64> = rows.iter().map(|row| row.d).collect();
    let b = SparseRows::from_rows(
        n_all,
        rows.into_iter()
            .zip(&neighborhoods.neighbors)
            .enumerate()
            .map(|(r, (row, nb))| {
                let mut cols = nb.clone();
                cols.push(start + r);
                let mut vals = row.b;
                vals.push(1.);
                (cols, vals)
            })
            .collect(),
    );
    Ok(VecchiaFactors {
        b,
        d_inv: d.iter().map(|v| 1. / v).collect(),
        d,
        grads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        covariance::Covariance,
        inducing::InducingFactors,
        neighbors::{find_neighbors_euclidean, NeighborQuery},
        test_utils::{approx_covariance, assert_mat_close, cloud, dense_cov, grid},
    };
    use assert_approx_eq::assert_approx_eq;

    fn plain<'a>(
        cov: &'a Covariance,
        params: &'a Params,
        coords: &'a Coords,
        likelihood: Likelihood,
    ) -> FactorInputs<'a, Covariance> {
        FactorInputs {
            cov,
            params,
            coords,
            nugget: (likelihood == Likelihood::Gaussian).then_some(params.nugget),
            likelihood,
            chol_ip_cross_cov: None,
            inducing_grads: None,
            rand_coef: None,
        }
    }

    #[test]
    fn exhaustive_neighbours_are_exact() {
        let coords = grid(2, 5, 0.3);
        let cov = Covariance::Exponential;
        let params = Params::new(vec![1., 1.], 0.);
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(9, true, true));
        let inputs = plain(&cov, &params, &coords, Likelihood::Gaussian);
        let f = build_factors(&inputs, &nb, FactorOptions::default()).unwrap();
        assert_mat_close(&approx_covariance(&f), &dense_cov(&cov, &params, &coords), 1e-10);
        assert!(f.grads.is_empty());
    }

    #[test]
    fn structure_of_b() {
        let coords = cloud(40, 2, 3);
        let cov = Covariance::Matern52;
        let params = Params::new(vec![1.5, 0.3], 0.2);
        for k in [1, 4] {
            let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(k, true, true));
            let f = build_factors(
                &plain(&cov, &params, &coords, Likelihood::Gaussian),
                &nb,
                FactorOptions::with_gradients(GradScale::Log),
            )
            .unwrap();
            for i in 0..40 {
                assert_approx_eq!(f.b.get(i, i), 1.);
                let (cols, _) = f.b.row(i);
                assert_eq!(cols.len(), k.min(i) + 1);
                assert!(cols.iter().all(|&j| j <= i));
                assert!(f.d[i] > 0.);
                assert_approx_eq!(f.d_inv[i] * f.d[i], 1., 1e-14);
                for g in f.grads.iter().flatten() {
                    assert_eq!(g.b.row(i).0, nb.of(i));
                }
            }
            assert_eq!(f.grads.len(), 3);
        }
    }

    #[test]
    fn single_point() {
        let coords = cloud(1, 2, 1);
        let cov = Covariance::Exponential;
        let params = Params::new(vec![2., 0.5], 0.3);
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(5, true, true));
        let f = build_factors(
            &plain(&cov, &params, &coords, Likelihood::Gaussian),
            &nb,
            FactorOptions::with_gradients(GradScale::Original),
        )
        .unwrap();
        assert_eq!(f.b.triplets(), vec![(0, 0, 1.)]);
        assert_approx_eq!(f.d[0], 2.3);
        let g: Vec<f64> = f.grads.iter().map(|g| g.as_ref().unwrap().d[0]).collect();
        assert_eq!(g, vec![1., 0., 1.]);
    }

    #[test]
    fn variance_gradient_skipped_for_latent_gp() {
        let coords = cloud(12, 2, 5);
        let cov = Covariance::Exponential;
        let params = Params::new(vec![1., 0.4], 0.);
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(3, true, true));
        let f = build_factors(
            &plain(&cov, &params, &coords, Likelihood::NonGaussian),
            &nb,
            FactorOptions::with_gradients(GradScale::Log),
        )
        .unwrap();
        // no nugget gradient without a nugget
        assert_eq!(f.grads.len(), 2);
        assert!(f.grads[0].is_none());
        assert!(f.grads[1].is_some());
        assert_approx_eq!(f.d[0], 1.);
    }

    /// Covariance larger between distinct points than at a point
    struct BadKernel;

    impl CovFunction for BadKernel {
        fn num_pars(&self) -> usize {
            2
        }
        fn covariance(&self, x: &[f64], y: &[f64], _dist: Option<f64>, _pars: &[f64]) -> f64 {
            if x == y {
                1.
            } else {
                2.
            }
        }
        fn gradient(
            &self,
            _x: &[f64],
            _y: &[f64],
            _d: Option<f64>,
            _p: &[f64],
            _s: GradScale,
            out: &mut [f64],
        ) {
            out.fill(0.);
        }
    }

    #[test]
    fn non_positive_d() {
        let coords = cloud(2, 1, 2);
        let params = Params::new(vec![1., 1.], 0.);
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(1, true, true));
        let mut inputs = FactorInputs {
            cov: &BadKernel,
            params: &params,
            coords: &coords,
            nugget: Some(0.),
            likelihood: Likelihood::Gaussian,
            chol_ip_cross_cov: None,
            inducing_grads: None,
            rand_coef: None,
        };
        // only logged for a Gaussian likelihood
        let f = build_factors(&inputs, &nb, FactorOptions::default()).unwrap();
        assert!(f.d[1] < 0.);
        inputs.likelihood = Likelihood::NonGaussian;
        inputs.nugget = None;
        assert!(matches!(
            build_factors(&inputs, &nb, FactorOptions::default()),
            Err(VecchiaError::NonPositiveD { index: 1, .. })
        ));
    }

    #[test]
    fn inducing_points_at_the_data_are_exact() {
        let coords = grid(2, 5, 0.3);
        let cov = Covariance::Exponential;
        let params = Params::new(vec![1., 1.], 0.1);
        let ip = InducingFactors::new(&cov, params.gp(0, 2), coords.clone(), &coords).unwrap();
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(9, true, true));
        let inputs = FactorInputs {
            chol_ip_cross_cov: Some(&ip.chol_ip_cross_cov),
            ..plain(&cov, &params, &coords, Likelihood::Gaussian)
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default()).unwrap();
        let q = &ip.chol_ip_cross_cov;
        let low_rank = q.transpose() * q.as_ref();
        let total = low_rank + approx_covariance(&f);
        assert_mat_close(&total, &dense_cov(&cov, &params, &coords), 1e-8);
    }

    #[test]
    fn inducing_points_with_exhaustive_residual_are_exact() {
        let coords = cloud(15, 2, 8);
        let cov = Covariance::Matern32;
        let params = Params::new(vec![1.2, 0.4], 0.05);
        let ip = InducingFactors::new(&cov, params.gp(0, 2), coords.select(&[2, 9, 13]), &coords)
            .unwrap();
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(14, true, true));
        let inputs = FactorInputs {
            chol_ip_cross_cov: Some(&ip.chol_ip_cross_cov),
            ..plain(&cov, &params, &coords, Likelihood::Gaussian)
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default()).unwrap();
        let q = &ip.chol_ip_cross_cov;
        let total = q.transpose() * q.as_ref() + approx_covariance(&f);
        assert_mat_close(&total, &dense_cov(&cov, &params, &coords), 1e-8);
    }

    /// Analytic derivatives of every entry of B and D against central differences in log-parameters
    fn check_gradients(
        cov: &Covariance,
        params: &Params,
        coords: &Coords,
        inducing: Option<&Coords>,
        rand_coef: Option<&Mat<f64>>,
        likelihood: Likelihood,
    ) {
        let nb = find_neighbors_euclidean(coords, &NeighborQuery::training(4, true, false));
        let build = |params: &Params, calc_grad: bool| {
            let pars = params.gp(0, 2);
            let ip = inducing.map(|u| InducingFactors::new(cov, pars, u.clone(), coords).unwrap());
            let h = ip.as_ref().map(|ip| ip.gradients(cov, pars, coords, GradScale::Log));
            let inputs = FactorInputs {
                cov,
                params,
                coords,
                nugget: (likelihood == Likelihood::Gaussian).then_some(params.nugget),
                likelihood,
                chol_ip_cross_cov: ip.as_ref().map(|ip| &ip.chol_ip_cross_cov),
                inducing_grads: h.as_ref(),
                rand_coef,
            };
            let opts = FactorOptions {
                calc_grad,
                ..FactorOptions::with_gradients(GradScale::Log)
            };
            build_factors(&inputs, &nb, opts).unwrap()
        };
        let f = build(params, true);
        let eps = 1e-5;
        for (p, g) in f.grads.iter().enumerate() {
            let Some(g) = g else { continue };
            let shift = |s: f64| {
                let mut q = params.clone();
                if p < q.cov.len() {
                    q.cov[p] *= s.exp();
                } else {
                    q.nugget *= s.exp();
                }
                build(&q, false)
            };
            let (up, down) = (shift(eps), shift(-eps));
            for i in 0..coords.len() {
                let fd = (up.d[i] - down.d[i]) / (2. * eps);
                assert!(
                    (g.d[i] - fd).abs() < 1e-6 * (1. + fd.abs()),
                    "dD[{i}] wrt {p}: {} vs {fd}",
                    g.d[i]
                );
                for &j in nb.of(i) {
                    let fd = (up.b.get(i, j) - down.b.get(i, j)) / (2. * eps);
                    let an = g.b.get(i, j);
                    assert!(
                        (an - fd).abs() < 1e-6 * (1. + fd.abs()),
                        "dB[{i},{j}] wrt {p}: {an} vs {fd}"
                    );
                }
            }
        }
    }

    #[test]
    fn gradients_vecchia() {
        let coords = cloud(25, 2, 11);
        let params = Params::new(vec![1.3, 0.35], 0.2);
        for (cov, likelihood) in [
            (Covariance::Exponential, Likelihood::Gaussian),
            (Covariance::Matern52, Likelihood::Gaussian),
            (Covariance::Matern32, Likelihood::NonGaussian),
        ] {
            check_gradients(&cov, &params, &coords, None, None, likelihood);
        }
    }

    #[test]
    fn gradients_with_inducing_points() {
        let coords = cloud(25, 2, 12);
        let inducing = cloud(5, 2, 13);
        let params = Params::new(vec![0.9, 0.5], 0.15);
        for (cov, likelihood) in [
            (Covariance::Matern32, Likelihood::Gaussian),
            (Covariance::Exponential, Likelihood::NonGaussian),
        ] {
            check_gradients(&cov, &params, &coords, Some(&inducing), None, likelihood);
        }
    }

    #[test]
    fn gradients_with_random_coefficients() {
        let coords = cloud(25, 2, 14);
        let z = Mat::from_fn(25, 1, |i, _| 0.5 + (i as f64 * 0.37).sin());
        let params = Params::new(vec![1.1, 0.3, 0.6, 0.5], 0.1);
        let cov = Covariance::Exponential;
        check_gradients(&cov, &params, &coords, None, Some(&z), Likelihood::Gaussian);
    }

    #[test]
    fn random_coefficients_add_weighted_variance() {
        let coords = cloud(6, 2, 15);
        let z = Mat::from_fn(6, 1, |i, _| i as f64 - 2.);
        let cov = Covariance::Exponential;
        let params = Params::new(vec![1., 0.3, 0.5, 0.2], 0.1);
        let nb = find_neighbors_euclidean(&coords, &NeighborQuery::training(5, true, true));
        let inputs = FactorInputs {
            rand_coef: Some(&z),
            ..plain(&cov, &params, &coords, Likelihood::Gaussian)
        };
        let f = build_factors(&inputs, &nb, FactorOptions::default()).unwrap();
        assert_approx_eq!(f.d[0], 1. + 0.5 * 4. + 0.1, 1e-14);
        // exhaustive neighbours: exact covariance of the sum of both GPs
        let k0 = dense_cov(&cov, &Params::new(vec![1., 0.3], 0.1), &coords);
        let k1 = dense_cov(&cov, &Params::new(vec![0.5, 0.2], 0.), &coords);
        let exact = Mat::from_fn(6, 6, |a, b| {
            k0.read(a, b) + z.read(a, 0) * z.read(b, 0) * k1.read(a, b)
        });
        assert_mat_close(&approx_covariance(&f), &exact, 1e-10);
    }
}
