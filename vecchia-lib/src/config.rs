//! Configuration of the Vecchia engine, loadable from TOML.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::VecchiaError;

/// Pre-permutation applied to the points before building the approximation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VecchiaOrdering {
    /// keep the user order
    #[default]
    None,
    /// uniformly random order
    Random,
    /// sorted by time (first coordinate)
    Time,
    /// sorted by time, random within equal times
    TimeRandomSpace,
}

impl fmt::Display for VecchiaOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VecchiaOrdering::None => "none",
            VecchiaOrdering::Random => "random",
            VecchiaOrdering::Time => "time",
            VecchiaOrdering::TimeRandomSpace => "time_random_space",
        };
        f.write_str(name)
    }
}

/// How conditioning sets are chosen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSelection {
    /// nearest in (possibly parameter scaled) Euclidean distance
    #[default]
    Euclidean,
    /// most correlated under the residual process
    ResidualCorrelation,
}

/// Which approximation is used
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpApprox {
    #[default]
    Vecchia,
    /// inducing points plus a Vecchia-approximated residual
    FullScaleVecchia,
}

/// Likelihood of the response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    /// Gaussian response, the nugget is part of the covariance
    #[default]
    Gaussian,
    /// any other likelihood; the factor approximates the latent field
    NonGaussian,
}

/// Ordering of observed and prediction points when predicting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    /// observed points first, prediction points condition only on observed points
    #[default]
    ObservedFirstCondObsOnly,
    /// observed points first, prediction points may condition on earlier prediction points
    ObservedFirstCondAll,
    /// prediction points first
    PredictedFirst,
    /// latent process on unique locations, conditioning on observed locations only
    LatentCondObsOnly,
    /// latent process on unique locations, conditioning on all earlier locations
    LatentCondAll,
}

/// Settings of the Vecchia approximation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VecchiaConfig {
    /// number of neighbours $k$ when fitting
    pub num_neighbors: usize,
    /// number of neighbours when predicting, `num_neighbors` if unset
    pub num_neighbors_pred: Option<usize>,
    pub ordering: VecchiaOrdering,
    pub neighbor_selection: NeighborSelection,
    pub gp_approx: GpApprox,
    pub likelihood: Likelihood,
    /// ratio between covering radii of consecutive cover tree levels
    pub cover_tree_base: f64,
    /// exponent $\alpha$ of the residual correlation distance
    pub distance_power: f64,
    /// prefix length below which neighbours are found by brute force
    pub brute_force_threshold: usize,
    /// detect duplicate coordinates during neighbour search
    pub check_duplicates: bool,
    /// seed for random orderings
    pub seed: u64,
}

impl Default for VecchiaConfig {
    fn default() -> Self {
        VecchiaConfig {
            num_neighbors: 20,
            num_neighbors_pred: None,
            ordering: VecchiaOrdering::None,
            neighbor_selection: NeighborSelection::Euclidean,
            gp_approx: GpApprox::Vecchia,
            likelihood: Likelihood::Gaussian,
            cover_tree_base: 2.,
            distance_power: 0.1,
            brute_force_threshold: 1000,
            check_duplicates: true,
            seed: 0,
        }
    }
}

impl VecchiaConfig {
    /// Parse from a TOML document; missing keys take their defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or holds invalid values
    pub fn from_toml_str(s: &str) -> Result<Self, VecchiaError> {
        let config: VecchiaConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, VecchiaError> {
        VecchiaConfig::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [VecchiaError::Config] on the first invalid value
    pub fn validate(&self) -> Result<(), VecchiaError> {
        if !(self.cover_tree_base > 1.) {
            return Err(VecchiaError::Config(format!(
                "cover_tree_base must exceed 1, got {}",
                self.cover_tree_base
            )));
        }
        if !(self.distance_power > 0.) {
            return Err(VecchiaError::Config(format!(
                "distance_power must be positive, got {}",
                self.distance_power
            )));
        }
        Ok(())
    }

    /// Number of neighbours used for prediction
    #[must_use]
    pub fn num_neighbors_pred(&self) -> usize {
        self.num_neighbors_pred.unwrap_or(self.num_neighbors)
    }

    #[must_use]
    pub fn is_gaussian(&self) -> bool {
        self.likelihood == Likelihood::Gaussian
    }

    #[must_use]
    pub fn uses_inducing_points(&self) -> bool {
        self.gp_approx == GpApprox::FullScaleVecchia
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let c = VecchiaConfig::from_toml_str(
            r#"
            num_neighbors = 5
            ordering = "time_random_space"
            neighbor_selection = "residual_correlation"
            gp_approx = "full_scale_vecchia"
            "#,
        )
        .unwrap();
        assert_eq!(c.num_neighbors, 5);
        assert_eq!(c.num_neighbors_pred(), 5);
        assert_eq!(c.ordering, VecchiaOrdering::TimeRandomSpace);
        assert_eq!(c.neighbor_selection, NeighborSelection::ResidualCorrelation);
        assert!(c.uses_inducing_points());
        assert!(c.is_gaussian());
        assert_eq!(c.cover_tree_base, 2.);
        assert_eq!(c.brute_force_threshold, 1000);
        assert_eq!(c.ordering.to_string(), "time_random_space");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            VecchiaConfig::from_toml_str("cover_tree_base = 1.0"),
            Err(VecchiaError::Config(_))
        ));
        assert!(matches!(
            VecchiaConfig::from_toml_str("distance_power = 0.0"),
            Err(VecchiaError::Config(_))
        ));
        assert!(matches!(
            VecchiaConfig::from_toml_str("ordering = \"sideways\""),
            Err(VecchiaError::Toml(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let c = VecchiaConfig {
            num_neighbors_pred: Some(7),
            likelihood: Likelihood::NonGaussian,
            ..VecchiaConfig::default()
        };
        let s = toml::to_string(&c).unwrap();
        assert_eq!(VecchiaConfig::from_toml_str(&s).unwrap(), c);
    }
}
