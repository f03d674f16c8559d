//! Covariance functions consumed by the Vecchia engine.
//!
//! Every covariance function has parameters $\theta$ with $\theta_{0} = \sigma^{2}$
//! the marginal variance. Gradients are returned either on the original scale,
//! $\partial c / \partial \theta_{p}$, or on the log scale, $\partial c / \partial \log\theta_{p}$,
//! which is what an optimiser working on log-parameters needs.

use faer::Mat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    coords::{euclidean, Coords},
    linalg::par_mat_from_fn,
    VecchiaError,
};

/// Scale on which parameter derivatives are taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradScale {
    /// $\partial / \partial \log\theta$
    #[default]
    Log,
    /// $\partial / \partial \theta$
    Original,
}

/// Parameters of all GPs plus the nugget (error variance)
///
/// `cov` holds one block of [CovFunction::num_pars] values per GP:
/// first the main GP, then one block per random coefficient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub cov: Vec<f64>,
    pub nugget: f64,
}

impl Params {
    #[must_use]
    pub fn new(cov: Vec<f64>, nugget: f64) -> Self {
        Params { cov, nugget }
    }

    /// The parameters of GP `j`
    #[must_use]
    pub fn gp(&self, j: usize, num_pars: usize) -> &[f64] {
        &self.cov[j * num_pars..(j + 1) * num_pars]
    }

    /// Check the layout against a covariance function and `num_gp` GPs
    ///
    /// # Errors
    ///
    /// Returns an error if the length is wrong or a value is non-positive
    pub fn validate(&self, num_pars: usize, num_gp: usize) -> Result<(), VecchiaError> {
        if self.cov.len() != num_pars * num_gp {
            return Err(VecchiaError::MismatchedInputs(format!(
                "expected {} covariance parameters, got {}",
                num_pars * num_gp,
                self.cov.len()
            )));
        }
        if self.cov.iter().any(|&p| !(p > 0. && p.is_finite())) {
            return Err(VecchiaError::Config(
                "covariance parameters must be positive and finite".to_string(),
            ));
        }
        if !(self.nugget >= 0. && self.nugget.is_finite()) {
            return Err(VecchiaError::Config(
                "the nugget must be non-negative and finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// A stationary covariance function $c(x, y; \theta)$
///
/// Implementors take the marginal variance as their first parameter.
pub trait CovFunction: Send + Sync {
    /// Number of parameters $\theta$ (including the marginal variance)
    fn num_pars(&self) -> usize;

    /// Whether the covariance depends on the points only through their Euclidean
    /// distance, in which case neighbour distances are cached.
    /// Otherwise coordinates are warped by [CovFunction::scale_coordinates].
    fn should_save_distances(&self) -> bool {
        true
    }

    /// Whether the first coordinate is time
    fn is_space_time(&self) -> bool {
        false
    }

    /// $c(x, y; \theta)$, `dist` is $\|x - y\|$ when known
    fn covariance(&self, x: &[f64], y: &[f64], dist: Option<f64>, pars: &[f64]) -> f64;

    /// Writes the derivative with respect to every parameter into `out`
    fn gradient(
        &self,
        x: &[f64],
        y: &[f64],
        dist: Option<f64>,
        pars: &[f64],
        scale: GradScale,
        out: &mut [f64],
    );

    /// Parameter aware warp of the coordinates used for neighbour search
    fn scale_coordinates(&self, _pars: &[f64], coords: &Coords) -> Coords {
        coords.clone()
    }
}

/// Provided covariance functions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariance {
    /// $\sigma^{2}\exp(-h)$, $h = d / \rho$
    Exponential,
    /// $\sigma^{2}\exp(-h^{2})$
    Gaussian,
    /// $\sigma^{2}(1 + \sqrt{3}h)\exp(-\sqrt{3}h)$
    Matern32,
    /// $\sigma^{2}(1 + \sqrt{5}h + 5h^{2}/3)\exp(-\sqrt{5}h)$
    Matern52,
    /// Exponential in $h^{2} = (\Delta t/\rho_{t})^{2} + \|\Delta s\|^{2}/\rho_{s}^{2}$,
    /// parameters $[\sigma^{2}, \rho_{t}, \rho_{s}]$
    ExponentialSpaceTime,
}

impl Covariance {
    /// Correlation at scaled distance `h` and $-h \, \partial r/\partial h$
    fn corr_and_dlog(self, h: f64) -> (f64, f64) {
        match self {
            Covariance::Exponential | Covariance::ExponentialSpaceTime => {
                let c = (-h).exp();
                (c, h * c)
            }
            Covariance::Gaussian => {
                let c = (-h * h).exp();
                (c, 2. * h * h * c)
            }
            Covariance::Matern32 => {
                let s = 3_f64.sqrt() * h;
                let e = (-s).exp();
                ((1. + s) * e, s * s * e)
            }
            Covariance::Matern52 => {
                let s = 5_f64.sqrt() * h;
                let e = (-s).exp();
                ((1. + s + s * s / 3.) * e, s * s * (1. + s) * e / 3.)
            }
        }
    }

    /// Scaled time and space separation
    fn space_time_sep(x: &[f64], y: &[f64], pars: &[f64]) -> (f64, f64) {
        let t = ((x[0] - y[0]) / pars[1]).powi(2);
        let s = euclidean(&x[1..], &y[1..]).powi(2) / pars[2].powi(2);
        (t, s)
    }
}

impl CovFunction for Covariance {
    fn num_pars(&self) -> usize {
        match self {
            Covariance::ExponentialSpaceTime => 3,
            _ => 2,
        }
    }

    fn should_save_distances(&self) -> bool {
        !self.is_space_time()
    }

    fn is_space_time(&self) -> bool {
        matches!(self, Covariance::ExponentialSpaceTime)
    }

    fn covariance(&self, x: &[f64], y: &[f64], dist: Option<f64>, pars: &[f64]) -> f64 {
        let h = if self.is_space_time() {
            let (t, s) = Covariance::space_time_sep(x, y, pars);
            (t + s).sqrt()
        } else {
            dist.unwrap_or_else(|| euclidean(x, y)) / pars[1]
        };
        pars[0] * self.corr_and_dlog(h).0
    }

    fn gradient(
        &self,
        x: &[f64],
        y: &[f64],
        dist: Option<f64>,
        pars: &[f64],
        scale: GradScale,
        out: &mut [f64],
    ) {
        if self.is_space_time() {
            let (t, s) = Covariance::space_time_sep(x, y, pars);
            let h = (t + s).sqrt();
            let c = (-h).exp();
            // d c / d log rho_t = c t / h, zero at the origin
            let (dt, ds) = if h > 0. {
                (pars[0] * c * t / h, pars[0] * c * s / h)
            } else {
                (0., 0.)
            };
            match scale {
                GradScale::Log => {
                    out[0] = pars[0] * c;
                    out[1] = dt;
                    out[2] = ds;
                }
                GradScale::Original => {
                    out[0] = c;
                    out[1] = dt / pars[1];
                    out[2] = ds / pars[2];
                }
            }
        } else {
            let h = dist.unwrap_or_else(|| euclidean(x, y)) / pars[1];
            let (c, dlog) = self.corr_and_dlog(h);
            match scale {
                GradScale::Log => {
                    out[0] = pars[0] * c;
                    out[1] = pars[0] * dlog;
                }
                GradScale::Original => {
                    out[0] = c;
                    out[1] = pars[0] * dlog / pars[1];
                }
            }
        }
    }

    fn scale_coordinates(&self, pars: &[f64], coords: &Coords) -> Coords {
        if self.is_space_time() {
            Coords::from_fn(coords.len(), coords.dim(), |i, d| {
                coords.get(i, d) / if d == 0 { pars[1] } else { pars[2] }
            })
        } else {
            coords.clone()
        }
    }
}

/// A covariance block and optionally its derivatives
#[derive(Clone, Debug)]
pub struct CovBlock {
    pub cov: Mat<f64>,
    pub grads: Vec<Mat<f64>>,
}

/// Covariance between the points `rows` and `cols` of `coords`
///
/// `dists` holds $\|x_{r} - x_{c}\|$ with the block's shape when distances are cached.
/// With `is_symmetric` (`rows == cols`) only the upper triangle is evaluated.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn cov_block<C: CovFunction + ?Sized>(
    cov: &C,
    pars: &[f64],
    coords: &Coords,
    rows: &[usize],
    cols: &[usize],
    dists: Option<&Mat<f64>>,
    calc_grad: bool,
    scale: GradScale,
    is_symmetric: bool,
) -> CovBlock {
    let (nr, nc) = (rows.len(), cols.len());
    let np = cov.num_pars();
    let mut out = Mat::<f64>::zeros(nr, nc);
    let mut grads = if calc_grad {
        vec![Mat::<f64>::zeros(nr, nc); np]
    } else {
        Vec::new()
    };
    let mut g = vec![0.; np];
    for (a, &r) in rows.iter().enumerate() {
        let start = if is_symmetric { a } else { 0 };
        for (b, &c) in cols.iter().enumerate().skip(start) {
            let x = coords.row(r);
            let y = coords.row(c);
            let dist = dists.map(|d| d.read(a, b));
            let v = cov.covariance(x, y, dist, pars);
            out.write(a, b, v);
            if is_symmetric {
                out.write(b, a, v);
            }
            if calc_grad {
                cov.gradient(x, y, dist, pars, scale, &mut g);
                for (p, gm) in grads.iter_mut().enumerate() {
                    gm.write(a, b, g[p]);
                    if is_symmetric {
                        gm.write(b, a, g[p]);
                    }
                }
            }
        }
    }
    CovBlock { cov: out, grads }
}

/// Covariance matrix between the point sets `a` and `b`
#[must_use]
pub fn cov_matrix<C: CovFunction + ?Sized>(
    cov: &C,
    pars: &[f64],
    a: &Coords,
    b: &Coords,
) -> Mat<f64> {
    par_mat_from_fn(a.len(), b.len(), |i, j| {
        cov.covariance(a.row(i), b.row(j), None, pars)
    })
}

/// Derivatives of [cov_matrix], one matrix per parameter
#[must_use]
pub fn cov_matrix_grad<C: CovFunction + ?Sized>(
    cov: &C,
    pars: &[f64],
    a: &Coords,
    b: &Coords,
    scale: GradScale,
) -> Vec<Mat<f64>> {
    let (nr, nc) = (a.len(), b.len());
    let np = cov.num_pars();
    // column j holds the gradients of entry (i, j) at i * np..(i + 1) * np
    let cols: Vec<Vec<f64>> = (0..nc)
        .into_par_iter()
        .map(|j| {
            let mut col = vec![0.; nr * np];
            for (i, g) in col.chunks_exact_mut(np).enumerate() {
                cov.gradient(a.row(i), b.row(j), None, pars, scale, g);
            }
            col
        })
        .collect();
    (0..np)
        .map(|p| Mat::from_fn(nr, nc, |i, j| cols[j][i * np + p]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALL: [Covariance; 5] = [
        Covariance::Exponential,
        Covariance::Gaussian,
        Covariance::Matern32,
        Covariance::Matern52,
        Covariance::ExponentialSpaceTime,
    ];

    fn pars_for(c: Covariance) -> Vec<f64> {
        if c.is_space_time() {
            vec![1.7, 0.6, 0.35]
        } else {
            vec![1.7, 0.4]
        }
    }

    #[test]
    fn variance_at_origin() {
        let x = [0.3, 0.1, 0.2];
        for c in ALL {
            let pars = pars_for(c);
            assert_approx_eq!(c.covariance(&x, &x, None, &pars), 1.7, 1e-14);
            let mut g = vec![0.; c.num_pars()];
            c.gradient(&x, &x, None, &pars, GradScale::Original, &mut g);
            assert_approx_eq!(g[0], 1., 1e-14);
            for v in &g[1..] {
                assert_approx_eq!(*v, 0., 1e-14);
            }
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let x = [0.3, 0.1, 0.2];
        let y = [0.5, -0.2, 0.4];
        let h = 1e-6;
        for c in ALL {
            let pars = pars_for(c);
            let mut g_log = vec![0.; c.num_pars()];
            let mut g_orig = vec![0.; c.num_pars()];
            c.gradient(&x, &y, None, &pars, GradScale::Log, &mut g_log);
            c.gradient(&x, &y, None, &pars, GradScale::Original, &mut g_orig);
            for p in 0..c.num_pars() {
                let mut up = pars.clone();
                let mut down = pars.clone();
                up[p] += h;
                down[p] -= h;
                let fd = (c.covariance(&x, &y, None, &up) - c.covariance(&x, &y, None, &down))
                    / (2. * h);
                assert_approx_eq!(g_orig[p], fd, 1e-7);
                assert_approx_eq!(g_log[p], fd * pars[p], 1e-7);
            }
        }
    }

    #[test]
    fn saved_distance_is_used() {
        let c = Covariance::Exponential;
        let pars = [2., 0.5];
        // coordinates are ignored when the distance is supplied
        let v = c.covariance(&[0.], &[0.], Some(0.5), &pars);
        assert_approx_eq!(v, 2. * (-1_f64).exp(), 1e-15);
    }

    #[test]
    fn symmetric_block_matches_full() {
        let coords = Coords::from_fn(5, 2, |i, d| (i * 3 + d) as f64 / 7.);
        let idx = [4, 0, 2, 3];
        let c = Covariance::Matern32;
        let pars = [1.2, 0.8];
        let sym = cov_block(&c, &pars, &coords, &idx, &idx, None, true, GradScale::Log, true);
        let full = cov_block(&c, &pars, &coords, &idx, &idx, None, true, GradScale::Log, false);
        for a in 0..4 {
            for b in 0..4 {
                assert_approx_eq!(sym.cov.read(a, b), full.cov.read(a, b), 1e-15);
                assert_approx_eq!(sym.grads[1].read(a, b), full.grads[1].read(a, b), 1e-15);
            }
        }
        let m = cov_matrix(&c, &pars, &coords.select(&idx), &coords.select(&idx));
        assert_approx_eq!(m.read(1, 3), full.cov.read(1, 3), 1e-15);
        let mg = cov_matrix_grad(&c, &pars, &coords.select(&idx), &coords, GradScale::Log);
        assert_eq!(mg.len(), 2);
        assert_approx_eq!(mg[1].read(0, 2), full.grads[1].read(0, 2), 1e-15);
    }

    #[test]
    fn gradient_matrices_evaluate_each_entry_once() {
        struct Counted(AtomicUsize);

        impl CovFunction for Counted {
            fn num_pars(&self) -> usize {
                2
            }
            fn covariance(&self, x: &[f64], y: &[f64], dist: Option<f64>, pars: &[f64]) -> f64 {
                Covariance::Exponential.covariance(x, y, dist, pars)
            }
            fn gradient(
                &self,
                x: &[f64],
                y: &[f64],
                dist: Option<f64>,
                pars: &[f64],
                scale: GradScale,
                out: &mut [f64],
            ) {
                self.0.fetch_add(1, Ordering::Relaxed);
                Covariance::Exponential.gradient(x, y, dist, pars, scale, out);
            }
        }

        let coords = Coords::from_fn(7, 2, |i, d| (i * 2 + d) as f64 / 5.);
        let pars = [1.3, 0.6];
        let counted = Counted(AtomicUsize::new(0));
        let rows = coords.select(&[1, 5, 6]);
        let mg = cov_matrix_grad(&counted, &pars, &rows, &coords, GradScale::Log);
        assert_eq!(counted.0.load(Ordering::Relaxed), 3 * 7);
        let reference =
            cov_matrix_grad(&Covariance::Exponential, &pars, &rows, &coords, GradScale::Log);
        for (m, r) in mg.iter().zip(&reference) {
            for (i, j) in (0..3).flat_map(|i| (0..7).map(move |j| (i, j))) {
                assert_eq!(m.read(i, j).to_bits(), r.read(i, j).to_bits());
            }
        }
        let mut g = [0.; 2];
        let (x, y) = (coords.row(5), coords.row(2));
        Covariance::Exponential.gradient(x, y, None, &pars, GradScale::Log, &mut g);
        assert_approx_eq!(mg[0].read(1, 2), g[0], 1e-15);
        assert_approx_eq!(mg[1].read(1, 2), g[1], 1e-15);
    }

    #[test]
    fn space_time_warps_coordinates() {
        let c = Covariance::ExponentialSpaceTime;
        let coords = Coords::from_rows(&[vec![1., 2., 4.]]).unwrap();
        let scaled = c.scale_coordinates(&[1., 0.5, 2.], &coords);
        assert_eq!(scaled.row(0), &[2., 1., 2.]);
        assert!(!c.should_save_distances());
        assert!(Covariance::Exponential.should_save_distances());
    }

    #[test]
    fn params_layout() {
        let p = Params::new(vec![1., 0.5, 2., 0.3], 0.1);
        assert_eq!(p.gp(1, 2), &[2., 0.3]);
        assert!(p.validate(2, 2).is_ok());
        assert!(matches!(
            p.validate(2, 1),
            Err(VecchiaError::MismatchedInputs(_))
        ));
        assert!(matches!(
            Params::new(vec![1., -0.5], 0.).validate(2, 1),
            Err(VecchiaError::Config(_))
        ));
    }
}
