//! Correlation based distance used to pick conditioning sets.
//!
//! For points $i$, $j$ the correlation of the residual process is
//!
//! $ \rho_{ij} = \frac{c(x_{i}, x_{j}) - Q_{i}^{\intercal}Q_{j}}{\sqrt{r_{i} r_{j}}} $
//!
//! with $r_{i}$ the residual variance, and the distance is $\sqrt{1 - |\rho_{ij}|^{\alpha}}$.
//! Distances lie in $[0, 1]$ whenever $|\rho_{ij}| \le 1$.

use faer::Mat;
use rayon::prelude::*;

use crate::{coords::Coords, covariance::CovFunction, inducing::col_dot};

/// Candidate lists longer than this are evaluated in parallel
const PAR_DISTANCES: usize = 256;

/// A distance between points addressed by their (global) index
pub trait IndexMetric: Sync {
    fn distance(&self, i: usize, j: usize) -> f64;

    /// Distances from `i` to every point of `js`
    fn distances(&self, i: usize, js: &[usize]) -> Vec<f64> {
        if js.len() > PAR_DISTANCES {
            js.par_iter().map(|&j| self.distance(i, j)).collect()
        } else {
            js.iter().map(|&j| self.distance(i, j)).collect()
        }
    }
}

/// Residual correlation distance under the current parameters
pub struct ResidualCorrelation<'a, C: ?Sized> {
    cov: &'a C,
    pars: &'a [f64],
    coords: &'a Coords,
    chol_ip_cross_cov: Option<&'a Mat<f64>>,
    corr_diag: &'a [f64],
    power: f64,
}

impl<'a, C: CovFunction + ?Sized> ResidualCorrelation<'a, C> {
    /// `corr_diag` are the residual variances of all points of `coords`
    /// (see [crate::inducing::residual_variances]); `chol_ip_cross_cov` is $\bm{Q}$ when
    /// inducing points are used
    #[must_use]
    pub fn new(
        cov: &'a C,
        pars: &'a [f64],
        coords: &'a Coords,
        chol_ip_cross_cov: Option<&'a Mat<f64>>,
        corr_diag: &'a [f64],
        power: f64,
    ) -> Self {
        ResidualCorrelation {
            cov,
            pars,
            coords,
            chol_ip_cross_cov,
            corr_diag,
            power,
        }
    }

    /// $\rho_{ij}$
    #[must_use]
    pub fn correlation(&self, i: usize, j: usize) -> f64 {
        let (x, y) = (self.coords.row(i), self.coords.row(j));
        let mut c = self.cov.covariance(x, y, None, self.pars);
        if let Some(q) = self.chol_ip_cross_cov {
            c -= col_dot(q, i, q, j);
        }
        c / (self.corr_diag[i] * self.corr_diag[j]).sqrt()
    }
}

impl<C: CovFunction + ?Sized> IndexMetric for ResidualCorrelation<'_, C> {
    fn distance(&self, i: usize, j: usize) -> f64 {
        // not a number when the residual variances understate |rho|
        (1. - self.correlation(i, j).abs().powf(self.power)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{covariance::Covariance, inducing::{residual_variances, InducingFactors}};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn plain_correlation_distance() {
        let coords = Coords::from_fn(3, 1, |i, _| i as f64 * 0.5);
        let cov = Covariance::Exponential;
        let pars = [2., 1.];
        let diag = residual_variances(&cov, &pars, &coords, None);
        let m = ResidualCorrelation::new(&cov, &pars, &coords, None, &diag, 0.1);
        assert_approx_eq!(m.correlation(0, 2), (-1_f64).exp(), 1e-14);
        assert_approx_eq!(m.distance(0, 2), (1. - (-0.1_f64).exp()).sqrt(), 1e-14);
        assert_approx_eq!(m.distance(1, 1), 0., 1e-7);
        // monotone in the Euclidean distance
        assert!(m.distance(0, 1) < m.distance(0, 2));
        let ds = m.distances(0, &[1, 2]);
        assert_approx_eq!(ds[1], m.distance(0, 2));
    }

    #[test]
    fn residual_correlation_with_inducing_points() {
        let coords = Coords::from_fn(6, 1, |i, _| i as f64 * 0.3);
        let cov = Covariance::Exponential;
        let pars = [1., 0.8];
        let f = InducingFactors::new(&cov, &pars, coords.select(&[0, 5]), &coords).unwrap();
        let q = &f.chol_ip_cross_cov;
        let diag = residual_variances(&cov, &pars, &coords, Some(q));
        let m = ResidualCorrelation::new(&cov, &pars, &coords, Some(q), &diag, 0.1);
        let (x, y) = (coords.row(2), coords.row(3));
        let expected = (cov.covariance(x, y, None, &pars) - col_dot(q, 2, q, 3))
            / (diag[2] * diag[3]).sqrt();
        assert_approx_eq!(m.correlation(2, 3), expected, 1e-14);
        let d = m.distance(2, 3);
        assert!((0. ..=1.).contains(&d));
    }

    #[test]
    fn correlations_above_one_are_not_clamped() {
        let coords = Coords::from_fn(3, 1, |i, _| i as f64 * 0.5);
        let cov = Covariance::Exponential;
        let pars = [2., 1.];
        let diag = [0.5; 3];
        let m = ResidualCorrelation::new(&cov, &pars, &coords, None, &diag, 0.1);
        assert_approx_eq!(m.correlation(1, 1), 4., 1e-14);
        assert!(m.distance(1, 1).is_nan());
    }
}
