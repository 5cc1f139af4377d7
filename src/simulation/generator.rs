//! Simulated inverter readings.
//!
//! Three profiles: normal operation (with an occasional organic
//! single-quantity excursion), a multi-quantity anomaly, and readings that
//! stay individually normal while pushing the forecast out of bounds.
//! The last profile is checked against the loaded models rather than
//! trusted blindly.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::{defaults, SimulationConfig};
use crate::ml_engine::{AnomalyModel, ForecastModel, ModelConfigError, ModelError, ModelLoader};
use crate::storage::{SettingsStore, Store, StoreError};
use crate::types::{
    Feature, Features, ForecastBounds, Measurements, NewReading, Reading, ReadingProfile,
};

/// (mean, std dev) of each quantity in normal operation, in feature order.
pub const NORMAL_REGIME: [(f64, f64); 5] = [
    (230.0, 3.0),
    (24.0, 0.5),
    (10.0, 1.0),
    (1000.0, 200.0),
    (35.0, 1.0),
];

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("invalid distribution: {0}")]
    Distribution(String),
    #[error(transparent)]
    ModelConfig(#[from] ModelConfigError),
    #[error("model evaluation failed: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid history request: {0}")]
    History(String),
}

/// Result of [`ReadingGenerator::seed_history`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededHistory {
    pub readings: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

fn sample<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> Result<f64, GeneratorError> {
    let dist = Normal::new(mean, std_dev).map_err(|e| GeneratorError::Distribution(e.to_string()))?;
    Ok(dist.sample(rng))
}

/// Either of two modes with equal probability.
fn sample_either<R: Rng + ?Sized>(
    rng: &mut R,
    a: (f64, f64),
    b: (f64, f64),
) -> Result<f64, GeneratorError> {
    let (mean, std_dev) = if rng.gen_bool(0.5) { a } else { b };
    sample(rng, mean, std_dev)
}

/// Values drawn from the normal operating regime.
pub fn normal_measurements<R: Rng + ?Sized>(rng: &mut R) -> Result<Measurements, GeneratorError> {
    let mut features = Features([0.0; 5]);
    for (slot, (mean, std_dev)) in features.0.iter_mut().zip(NORMAL_REGIME) {
        *slot = sample(rng, mean, std_dev)?;
    }
    Ok(Measurements::from_features(&features))
}

/// Push one randomly chosen quantity 4 to 6 standard deviations away.
pub fn organic_excursion<R: Rng + ?Sized>(base: &Measurements, rng: &mut R) -> (Feature, Measurements) {
    let feature = Feature::ALL[rng.gen_range(0..Feature::ALL.len())];
    let (mean, std_dev) = NORMAL_REGIME[feature.index()];
    let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    let value = mean + direction * rng.gen_range(4.0..6.0) * std_dev;
    let features = base.features().with(feature, value);
    (feature, Measurements::from_features(&features))
}

/// Several quantities far outside normal operation at once.
pub fn anomaly_measurements<R: Rng + ?Sized>(rng: &mut R) -> Result<Measurements, GeneratorError> {
    Ok(Measurements {
        ac_output_voltage: sample_either(rng, (150.0, 10.0), (280.0, 10.0))?,
        dc_battery_voltage: sample_either(rng, (18.0, 1.0), (30.0, 2.0))?,
        dc_battery_current: sample(rng, 10.0, 8.0)?,
        load_power: sample_either(rng, (3500.0, 300.0), (10.0, 5.0))?.max(0.0),
        temperature: sample(rng, 55.0, 5.0)?,
    })
}

/// One candidate near the 3-sigma edge of two quantities that the forecast
/// depends on, with everything else close to its mean.
fn abnormal_forecast_candidate<R: Rng + ?Sized>(rng: &mut R) -> Measurements {
    let mut features = Features([0.0; 5]);
    for (slot, (mean, std_dev)) in features.0.iter_mut().zip(NORMAL_REGIME) {
        *slot = mean + rng.gen_range(-0.5..0.5) * std_dev;
    }
    let features = if rng.gen_bool(0.5) {
        // high current forecast
        features
            .with(Feature::DcBatteryCurrent, rng.gen_range(12.8..13.0))
            .with(Feature::LoadPower, rng.gen_range(1560.0..1600.0))
    } else {
        // low voltage forecast
        features
            .with(Feature::AcOutputVoltage, rng.gen_range(221.2..222.0))
            .with(Feature::DcBatteryVoltage, rng.gen_range(22.5..22.7))
    };
    Measurements::from_features(&features)
}

/// Individually normal values whose forecast falls outside `bounds` and
/// which the anomaly model does not flag. Falls back to the last
/// out-of-bounds candidate (or the last candidate) after
/// `ABNORMAL_FORECAST_ATTEMPTS` tries.
pub fn abnormal_forecast_measurements<R: Rng + ?Sized>(
    rng: &mut R,
    anomaly: &dyn AnomalyModel,
    forecaster: &dyn ForecastModel,
    bounds: &ForecastBounds,
) -> Result<Measurements, GeneratorError> {
    let mut fallback = None;
    for _ in 0..defaults::ABNORMAL_FORECAST_ATTEMPTS {
        let candidate = abnormal_forecast_candidate(rng);
        let features = candidate.features();
        if bounds.contains(&forecaster.predict(&features)?) {
            fallback = fallback.or(Some(candidate));
            continue;
        }
        if anomaly.predict(&features)? == 1 {
            return Ok(candidate);
        }
        fallback = Some(candidate);
    }
    tracing::warn!(
        attempts = defaults::ABNORMAL_FORECAST_ATTEMPTS,
        "No candidate met both forecast and anomaly constraints, using closest"
    );
    match fallback {
        Some(candidate) => Ok(candidate),
        None => Ok(abnormal_forecast_candidate(rng)),
    }
}

pub struct ReadingGenerator {
    store: Store,
    settings: Arc<SettingsStore>,
    models: Arc<ModelLoader>,
    clock: Arc<dyn Clock>,
    organic_probability: f64,
    rng: Mutex<StdRng>,
}

impl ReadingGenerator {
    pub fn new(
        config: &SimulationConfig,
        store: Store,
        settings: Arc<SettingsStore>,
        models: Arc<ModelLoader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            store,
            settings,
            models,
            clock,
            organic_probability: config.organic_anomaly_probability,
            rng: Mutex::new(rng),
        }
    }

    /// Draw values for `profile` and persist exactly one new reading.
    pub async fn create_reading(
        &self,
        profile: ReadingProfile,
        is_manual: bool,
        actor: Option<&str>,
    ) -> Result<Reading, GeneratorError> {
        let measurements = match profile {
            ReadingProfile::AbnormalForecast => {
                let anomaly = self.models.anomaly().await?;
                let forecaster = self.models.forecast().await?;
                let bounds = self.settings.get().forecast_bounds();
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                abnormal_forecast_measurements(&mut *rng, &*anomaly, &*forecaster, &bounds)?
            }
            ReadingProfile::Anomaly => {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                anomaly_measurements(&mut *rng)?
            }
            ReadingProfile::Normal => {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                self.normal_profile(&mut *rng)?
            }
        };

        let reading = self.store.insert_reading(
            NewReading {
                measurements,
                is_manual,
                created_by: actor.map(str::to_string),
            },
            self.clock.now(),
        )?;
        tracing::info!(reading_id = reading.id, %profile, manual = is_manual, "Reading created");
        Ok(reading)
    }

    /// Normal regime with the configured chance of an organic excursion.
    fn normal_profile(&self, rng: &mut StdRng) -> Result<Measurements, GeneratorError> {
        let base = normal_measurements(rng)?;
        if rng.gen_bool(self.organic_probability.clamp(0.0, 1.0)) {
            let (feature, excursion) = organic_excursion(&base, rng);
            tracing::debug!(%feature, "Injecting organic excursion");
            Ok(excursion)
        } else {
            Ok(base)
        }
    }

    /// Backfill `days` of normal-profile readings ending now, one every
    /// `interval` (the collection interval when `None`). Readings are added
    /// alongside existing ones, left unscored, and stamped in the past;
    /// [`crate::ml_engine::ScoringEngine::score_unscored`] scores them.
    pub fn seed_history(
        &self,
        days: u32,
        interval: Option<Duration>,
    ) -> Result<SeededHistory, GeneratorError> {
        if days == 0 || days > defaults::MAX_HISTORY_DAYS {
            return Err(GeneratorError::History(format!(
                "days must be between 1 and {}, got {days}",
                defaults::MAX_HISTORY_DAYS
            )));
        }
        let interval = interval.unwrap_or_else(|| self.settings.get().collection_interval());
        if interval <= Duration::zero() {
            return Err(GeneratorError::History(format!(
                "interval must be positive, got {interval}"
            )));
        }

        let now = self.clock.now();
        let span = Duration::try_days(i64::from(days))
            .ok_or_else(|| GeneratorError::History(format!("{days} days is out of range")))?;
        let mut at = now
            .checked_sub_signed(span)
            .ok_or_else(|| GeneratorError::History(format!("{days} days before {now} is out of range")))?;

        let mut seeded = SeededHistory {
            readings: 0,
            first: None,
            last: None,
        };
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        while at < now {
            let measurements = self.normal_profile(&mut rng)?;
            self.store.insert_reading(
                NewReading {
                    measurements,
                    is_manual: false,
                    created_by: None,
                },
                at,
            )?;
            seeded.first.get_or_insert(at);
            seeded.last = Some(at);
            seeded.readings += 1;
            at = match at.checked_add_signed(interval) {
                Some(next) => next,
                None => break,
            };
        }
        tracing::info!(
            readings = seeded.readings,
            days,
            interval_minutes = interval.num_minutes(),
            "History seeded"
        );
        Ok(seeded)
    }
}
