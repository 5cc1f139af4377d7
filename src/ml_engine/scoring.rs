//! ScoringEngine: anomaly score, explanation and forecast for one reading.
//!
//! Scoring writes every annotation onto the reading at once and then hands
//! the reading to the backup coordinator, so an anomalous or abnormally
//! forecast reading always gets a backup opportunity.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::explain::explain;
use super::loader::{ModelConfigError, ModelLoader};
use super::models::{AnomalyModel, ForecastModel, ModelError};
use crate::backup::{BackupCoordinator, BackupError};
use crate::storage::{SettingsStore, Store, StoreError};
use crate::types::{AnomalyReason, Features, ForecastBounds, Reading, ScoreResult};

/// Subtracted from `min(score, 0)` when an anomaly is forced.
const FORCED_ANOMALY_MARGIN: f64 = 0.55;

/// Fraction of the current band added above the upper bound when an
/// abnormal forecast is forced.
const FORCED_FORECAST_OVERSHOOT: f64 = 0.25;

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error(transparent)]
    ModelConfig(#[from] ModelConfigError),
    #[error("model evaluation failed: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("backup check failed: {0}")]
    Backup(#[from] BackupError),
    #[error("reading {0} is already scored")]
    AlreadyScored(u64),
}

impl ScoringError {
    pub fn is_transient(&self) -> bool {
        match self {
            ScoringError::Store(e) => e.is_transient(),
            ScoringError::Backup(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Test/demo hooks that guarantee a flag regardless of the models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceFlags {
    pub anomaly: bool,
    pub abnormal_forecast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    /// The reading as stored after scoring (and backup, if any).
    pub reading: Reading,
    pub backup_performed: bool,
}

impl ScoreOutcome {
    pub fn result(&self) -> Option<&ScoreResult> {
        self.reading.scoring.as_ref()
    }
}

/// Totals of a [`ScoringEngine::score_unscored`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchScoreReport {
    pub scored: usize,
    pub anomalies: usize,
    pub abnormal_forecasts: usize,
    pub backups: usize,
}

/// Score one feature vector. Pure apart from `rng`, which only breaks
/// ties between equally significant features.
pub fn evaluate<R: Rng + ?Sized>(
    anomaly: &dyn AnomalyModel,
    forecaster: &dyn ForecastModel,
    bounds: &ForecastBounds,
    features: &Features,
    force: ForceFlags,
    rng: &mut R,
) -> Result<ScoreResult, ModelError> {
    let natural_score = anomaly.decision_function(features)?;
    let (is_anomaly, anomaly_score) = if force.anomaly {
        (true, natural_score.min(0.0) - FORCED_ANOMALY_MARGIN)
    } else {
        (anomaly.predict(features)? == -1, natural_score)
    };

    let reasons = if is_anomaly {
        explain(anomaly, features, rng).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Anomaly explanation failed");
            vec![AnomalyReason::Unexplained]
        })
    } else {
        Vec::new()
    };

    let mut forecast = forecaster.predict(features)?;
    let mut is_abnormal_prediction = !bounds.contains(&forecast);
    if force.abnormal_forecast && !is_abnormal_prediction {
        let band = bounds.max_current - bounds.min_current;
        forecast.dc_battery_current = bounds.max_current + band * FORCED_FORECAST_OVERSHOOT;
        is_abnormal_prediction = true;
    }

    Ok(ScoreResult {
        is_anomaly,
        anomaly_score,
        reasons,
        forecast,
        is_abnormal_prediction,
    })
}

pub struct ScoringEngine {
    store: Store,
    settings: Arc<SettingsStore>,
    models: Arc<ModelLoader>,
    backup: Arc<BackupCoordinator>,
    rng: Mutex<StdRng>,
}

impl ScoringEngine {
    pub fn new(
        store: Store,
        settings: Arc<SettingsStore>,
        models: Arc<ModelLoader>,
        backup: Arc<BackupCoordinator>,
        seed: Option<u64>,
    ) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            store,
            settings,
            models,
            backup,
            rng: Mutex::new(rng),
        }
    }

    /// Score a stored reading, persist the result and run the backup check.
    pub async fn score(&self, reading_id: u64, force: ForceFlags) -> Result<ScoreOutcome, ScoringError> {
        let anomaly = self.models.anomaly().await?;
        let forecaster = self.models.forecast().await?;

        let reading = self.store.require_reading(reading_id)?;
        if reading.scoring.is_some() {
            return Err(ScoringError::AlreadyScored(reading_id));
        }
        let features = reading.measurements.features();
        let bounds = self.settings.get().forecast_bounds();

        let result = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            evaluate(&*anomaly, &*forecaster, &bounds, &features, force, &mut *rng)?
        };
        // a concurrent scorer may have won since the read above
        let scored = self
            .store
            .apply_scoring(reading_id, &result)
            .map_err(|e| match e {
                StoreError::AlreadyScored(id) => ScoringError::AlreadyScored(id),
                other => ScoringError::Store(other),
            })?;
        tracing::info!(
            reading_id,
            is_anomaly = result.is_anomaly,
            anomaly_score = result.anomaly_score,
            is_abnormal_prediction = result.is_abnormal_prediction,
            predicted_current = result.forecast.dc_battery_current,
            predicted_voltage = result.forecast.ac_output_voltage,
            "Reading scored"
        );

        let backup_performed = self.backup.check_and_backup_if_needed(reading_id).await?;
        let reading = if backup_performed {
            self.store.require_reading(reading_id)?
        } else {
            scored
        };
        Ok(ScoreOutcome {
            reading,
            backup_performed,
        })
    }

    /// Score every stored reading that has no scoring yet, oldest first,
    /// each through [`Self::score`] so the backup check runs per reading.
    /// Readings scored concurrently by someone else are skipped.
    pub async fn score_unscored(&self) -> Result<BatchScoreReport, ScoringError> {
        let mut pending: Vec<Reading> = self
            .store
            .list_readings()?
            .into_iter()
            .filter(|r| r.scoring.is_none())
            .collect();
        pending.sort_by_key(|r| (r.timestamp, r.id));

        let mut report = BatchScoreReport::default();
        for reading in pending {
            let outcome = match self.score(reading.id, ForceFlags::default()).await {
                Ok(outcome) => outcome,
                // scored or purged since the listing
                Err(ScoringError::AlreadyScored(_) | ScoringError::Store(StoreError::ReadingNotFound(_))) => continue,
                Err(e) => return Err(e),
            };
            report.scored += 1;
            if outcome.reading.is_anomaly() {
                report.anomalies += 1;
            }
            if outcome.reading.is_abnormal_prediction() {
                report.abnormal_forecasts += 1;
            }
            if outcome.backup_performed {
                report.backups += 1;
            }
        }
        tracing::info!(
            scored = report.scored,
            anomalies = report.anomalies,
            abnormal_forecasts = report.abnormal_forecasts,
            backups = report.backups,
            "Unscored readings scored"
        );
        Ok(report)
    }
}
