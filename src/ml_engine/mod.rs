//! Anomaly scoring and next-interval forecasting.
//!
//! ## Architecture
//! - `models`: model traits and the bundled Gaussian / linear model kinds
//! - `loader`: lazy, cached loading of model files
//! - `explain`: leave-one-feature-out reasons for anomalous readings
//! - `scoring`: `ScoringEngine`, which persists results and triggers the backup check

pub mod explain;
pub mod loader;
pub mod models;
pub mod scoring;

pub use loader::{ModelConfigError, ModelLoader};
pub use models::{
    AnomalyModel, AnomalyModelFile, ForecastModel, ForecastModelFile, GaussianAnomalyModel,
    LinearForecastModel, ModelError,
};
pub use scoring::{evaluate, BatchScoreReport, ForceFlags, ScoreOutcome, ScoringEngine, ScoringError};
