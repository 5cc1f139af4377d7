//! Anomaly and forecast model interfaces and the bundled model kinds.
//!
//! Models are opaque to the rest of the crate: a classifier with a
//! decision function (negative = outlier) and a regressor predicting the
//! next battery current and AC voltage. Both are loaded from JSON files.

use serde::{Deserialize, Serialize};

use crate::types::{Features, Forecast, FEATURE_COUNT};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("feature vector contains non-finite values")]
    NonFinite,
    #[error("invalid model parameters: {0}")]
    InvalidParameters(String),
    #[error("model produced a non-finite output")]
    NonFiniteOutput,
}

/// Outlier classifier.
pub trait AnomalyModel: Send + Sync {
    /// `-1` for an outlier, `1` for an inlier.
    fn predict(&self, features: &Features) -> Result<i8, ModelError> {
        Ok(if self.decision_function(features)? < 0.0 { -1 } else { 1 })
    }

    /// Raw score; more negative is more anomalous.
    fn decision_function(&self, features: &Features) -> Result<f64, ModelError>;

    /// Per-feature dataset means, used to neutralise one feature at a time.
    fn feature_means(&self) -> Features;
}

/// Next-interval regressor.
pub trait ForecastModel: Send + Sync {
    fn predict(&self, features: &Features) -> Result<Forecast, ModelError>;
}

// ============================================================================
// Gaussian anomaly model
// ============================================================================

/// Per-feature normal distribution; the distance is the Euclidean norm of
/// the z-scores and the decision function is `0.5 * (1 - d / threshold)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianAnomalyModel {
    pub means: [f64; FEATURE_COUNT],
    pub std_devs: [f64; FEATURE_COUNT],
    /// z-distance at which a sample becomes an outlier
    pub threshold: f64,
}

impl GaussianAnomalyModel {
    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.means.iter().all(|m| m.is_finite()) {
            return Err(ModelError::InvalidParameters("means must be finite".to_string()));
        }
        if !self.std_devs.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(ModelError::InvalidParameters(
                "std_devs must be finite and positive".to_string(),
            ));
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ModelError::InvalidParameters(
                "threshold must be finite and positive".to_string(),
            ));
        }
        Ok(())
    }

    fn distance(&self, features: &Features) -> f64 {
        features
            .0
            .iter()
            .zip(self.means.iter().zip(&self.std_devs))
            .map(|(x, (mean, std))| ((x - mean) / std).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl Default for GaussianAnomalyModel {
    /// Parameters of the simulated inverter's normal operating regime.
    fn default() -> Self {
        Self {
            means: [230.0, 24.0, 10.0, 1000.0, 35.0],
            std_devs: [3.0, 0.5, 1.0, 200.0, 1.0],
            threshold: 4.5,
        }
    }
}

impl AnomalyModel for GaussianAnomalyModel {
    fn decision_function(&self, features: &Features) -> Result<f64, ModelError> {
        if !features.is_finite() {
            return Err(ModelError::NonFinite);
        }
        let score = 0.5 * (1.0 - self.distance(features) / self.threshold);
        if score.is_finite() {
            Ok(score)
        } else {
            Err(ModelError::NonFiniteOutput)
        }
    }

    fn feature_means(&self) -> Features {
        Features(self.means)
    }
}

// ============================================================================
// Linear forecast model
// ============================================================================

/// One linear output: `weights · features + intercept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearOutput {
    pub weights: [f64; FEATURE_COUNT],
    pub intercept: f64,
}

impl LinearOutput {
    fn apply(&self, features: &Features) -> f64 {
        self.weights
            .iter()
            .zip(features.0.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.intercept
    }

    fn is_finite(&self) -> bool {
        self.intercept.is_finite() && self.weights.iter().all(|w| w.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearForecastModel {
    pub dc_battery_current: LinearOutput,
    pub ac_output_voltage: LinearOutput,
}

impl LinearForecastModel {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.dc_battery_current.is_finite() && self.ac_output_voltage.is_finite() {
            Ok(())
        } else {
            Err(ModelError::InvalidParameters(
                "forecast weights must be finite".to_string(),
            ))
        }
    }
}

impl Default for LinearForecastModel {
    fn default() -> Self {
        Self {
            dc_battery_current: LinearOutput {
                weights: [0.0, 0.0, 0.3, 0.01, 0.0],
                intercept: -3.0,
            },
            ac_output_voltage: LinearOutput {
                weights: [0.8, 1.5, 0.0, 0.0, 0.0],
                intercept: 10.0,
            },
        }
    }
}

impl ForecastModel for LinearForecastModel {
    fn predict(&self, features: &Features) -> Result<Forecast, ModelError> {
        if !features.is_finite() {
            return Err(ModelError::NonFinite);
        }
        let forecast = Forecast {
            dc_battery_current: self.dc_battery_current.apply(features),
            ac_output_voltage: self.ac_output_voltage.apply(features),
        };
        if forecast.dc_battery_current.is_finite() && forecast.ac_output_voltage.is_finite() {
            Ok(forecast)
        } else {
            Err(ModelError::NonFiniteOutput)
        }
    }
}

// ============================================================================
// Model files
// ============================================================================

/// On-disk anomaly model, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyModelFile {
    Gaussian(GaussianAnomalyModel),
}

/// On-disk forecast model, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForecastModelFile {
    Linear(LinearForecastModel),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_features() -> Features {
        Features([230.0, 24.0, 10.0, 1000.0, 35.0])
    }

    #[test]
    fn test_mean_point_is_inlier() {
        let model = GaussianAnomalyModel::default();
        let score = model.decision_function(&normal_features()).unwrap();
        assert!((score - 0.5).abs() < 1e-12);
        assert_eq!(model.predict(&normal_features()).unwrap(), 1);
    }

    #[test]
    fn test_far_point_is_outlier() {
        let model = GaussianAnomalyModel::default();
        let features = Features([150.0, 18.0, 10.0, 3500.0, 55.0]);
        assert!(model.decision_function(&features).unwrap() < -0.5);
        assert_eq!(model.predict(&features).unwrap(), -1);
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let model = GaussianAnomalyModel::default();
        let features = normal_features().with(crate::types::Feature::LoadPower, f64::NAN);
        assert!(matches!(model.decision_function(&features), Err(ModelError::NonFinite)));
    }

    #[test]
    fn test_default_forecast_centred_in_bounds() {
        let forecast = LinearForecastModel::default().predict(&normal_features()).unwrap();
        assert!((forecast.dc_battery_current - 10.0).abs() < 1e-9);
        assert!((forecast.ac_output_voltage - 230.0).abs() < 1e-9);
    }

    #[test]
    fn test_model_file_parsing() {
        let json = r#"{"kind":"gaussian","means":[1,2,3,4,5],"std_devs":[1,1,1,1,1],"threshold":3}"#;
        let AnomalyModelFile::Gaussian(model) = serde_json::from_str(json).unwrap();
        assert!(model.validate().is_ok());

        let bad = GaussianAnomalyModel { std_devs: [1.0, 0.0, 1.0, 1.0, 1.0], ..model };
        assert!(bad.validate().is_err());
    }
}
