//! Inverter readings and their scoring annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Features
// ============================================================================

/// Number of measured quantities fed to the models.
pub const FEATURE_COUNT: usize = 5;

/// One measured quantity of the inverter system.
///
/// The declaration order is the fixed feature-vector order the models expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AcOutputVoltage,
    DcBatteryVoltage,
    DcBatteryCurrent,
    LoadPower,
    Temperature,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::AcOutputVoltage,
        Feature::DcBatteryVoltage,
        Feature::DcBatteryCurrent,
        Feature::LoadPower,
        Feature::Temperature,
    ];

    /// Position in the feature vector.
    pub fn index(self) -> usize {
        match self {
            Feature::AcOutputVoltage => 0,
            Feature::DcBatteryVoltage => 1,
            Feature::DcBatteryCurrent => 2,
            Feature::LoadPower => 3,
            Feature::Temperature => 4,
        }
    }

    /// Column name used in dumps.
    pub fn column(self) -> &'static str {
        match self {
            Feature::AcOutputVoltage => "ac_output_voltage",
            Feature::DcBatteryVoltage => "dc_battery_voltage",
            Feature::DcBatteryCurrent => "dc_battery_current",
            Feature::LoadPower => "load_power",
            Feature::Temperature => "temperature",
        }
    }

    pub fn from_column(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.column() == column)
    }

    pub fn unit(self) -> &'static str {
        match self {
            Feature::AcOutputVoltage | Feature::DcBatteryVoltage => "V",
            Feature::DcBatteryCurrent => "A",
            Feature::LoadPower => "W",
            Feature::Temperature => "°C",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Feature::AcOutputVoltage => "AC output voltage",
            Feature::DcBatteryVoltage => "battery voltage",
            Feature::DcBatteryCurrent => "battery current",
            Feature::LoadPower => "load power",
            Feature::Temperature => "battery temperature",
        };
        write!(f, "{label}")
    }
}

/// Fixed-order feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features(pub [f64; FEATURE_COUNT]);

impl Features {
    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature.index()]
    }

    /// Copy of this vector with one feature replaced.
    #[must_use]
    pub fn with(mut self, feature: Feature, value: f64) -> Self {
        self.0[feature.index()] = value;
        self
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

// ============================================================================
// Measurements
// ============================================================================

/// Raw measured quantities of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Inverter AC output voltage (V)
    pub ac_output_voltage: f64,
    /// Battery bank voltage (V)
    pub dc_battery_voltage: f64,
    /// Battery current (A)
    pub dc_battery_current: f64,
    /// Load power (W)
    pub load_power: f64,
    /// Battery temperature (°C)
    pub temperature: f64,
}

impl Measurements {
    pub fn features(&self) -> Features {
        Features([
            self.ac_output_voltage,
            self.dc_battery_voltage,
            self.dc_battery_current,
            self.load_power,
            self.temperature,
        ])
    }

    pub fn from_features(features: &Features) -> Self {
        Self {
            ac_output_voltage: features.get(Feature::AcOutputVoltage),
            dc_battery_voltage: features.get(Feature::DcBatteryVoltage),
            dc_battery_current: features.get(Feature::DcBatteryCurrent),
            load_power: features.get(Feature::LoadPower),
            temperature: features.get(Feature::Temperature),
        }
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.features().get(feature)
    }
}

// ============================================================================
// Forecast
// ============================================================================

/// Predicted values for the next collection interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// Predicted battery current (A)
    pub dc_battery_current: f64,
    /// Predicted AC output voltage (V)
    pub ac_output_voltage: f64,
}

/// Acceptable range for forecast values. Outside ⇒ abnormal prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastBounds {
    pub min_current: f64,
    pub max_current: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
}

impl ForecastBounds {
    pub fn contains(&self, forecast: &Forecast) -> bool {
        let current_ok = (self.min_current..=self.max_current).contains(&forecast.dc_battery_current);
        let voltage_ok = (self.min_voltage..=self.max_voltage).contains(&forecast.ac_output_voltage);
        current_ok && voltage_ok
    }

    pub fn is_valid(&self) -> bool {
        [self.min_current, self.max_current, self.min_voltage, self.max_voltage]
            .iter()
            .all(|v| v.is_finite())
            && self.min_current < self.max_current
            && self.min_voltage < self.max_voltage
    }
}

// ============================================================================
// Anomaly reasons
// ============================================================================

/// Why a reading was flagged as anomalous.
///
/// Stored as an ordered list of codes on the reading; the most significant
/// reason comes first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AnomalyReason {
    LowAcVoltage,
    HighAcVoltage,
    LowBatteryVoltage,
    HighBatteryVoltage,
    LowBatteryCurrent,
    HighBatteryCurrent,
    Overload,
    LowLoad,
    Overheating,
    LowTemperature,
    /// A feature contributed most to the score without crossing a domain threshold.
    Deviation(Feature),
    /// Explanation could not be produced.
    Unexplained,
    /// Free text, e.g. from a restored legacy dump.
    Other(String),
}

impl AnomalyReason {
    pub fn code(&self) -> String {
        match self {
            AnomalyReason::LowAcVoltage => "low_ac_voltage".to_string(),
            AnomalyReason::HighAcVoltage => "high_ac_voltage".to_string(),
            AnomalyReason::LowBatteryVoltage => "low_battery_voltage".to_string(),
            AnomalyReason::HighBatteryVoltage => "high_battery_voltage".to_string(),
            AnomalyReason::LowBatteryCurrent => "low_battery_current".to_string(),
            AnomalyReason::HighBatteryCurrent => "high_battery_current".to_string(),
            AnomalyReason::Overload => "overload".to_string(),
            AnomalyReason::LowLoad => "low_load".to_string(),
            AnomalyReason::Overheating => "overheating".to_string(),
            AnomalyReason::LowTemperature => "low_temperature".to_string(),
            AnomalyReason::Deviation(feature) => format!("deviation:{}", feature.column()),
            AnomalyReason::Unexplained => "unexplained".to_string(),
            AnomalyReason::Other(text) => text.clone(),
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "low_ac_voltage" => AnomalyReason::LowAcVoltage,
            "high_ac_voltage" => AnomalyReason::HighAcVoltage,
            "low_battery_voltage" => AnomalyReason::LowBatteryVoltage,
            "high_battery_voltage" => AnomalyReason::HighBatteryVoltage,
            "low_battery_current" => AnomalyReason::LowBatteryCurrent,
            "high_battery_current" => AnomalyReason::HighBatteryCurrent,
            "overload" => AnomalyReason::Overload,
            "low_load" => AnomalyReason::LowLoad,
            "overheating" => AnomalyReason::Overheating,
            "low_temperature" => AnomalyReason::LowTemperature,
            "unexplained" => AnomalyReason::Unexplained,
            other => match other.strip_prefix("deviation:").and_then(Feature::from_column) {
                Some(feature) => AnomalyReason::Deviation(feature),
                None => AnomalyReason::Other(other.to_string()),
            },
        }
    }
}

impl From<AnomalyReason> for String {
    fn from(reason: AnomalyReason) -> Self {
        reason.code()
    }
}

impl From<String> for AnomalyReason {
    fn from(code: String) -> Self {
        AnomalyReason::from_code(&code)
    }
}

impl fmt::Display for AnomalyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyReason::LowAcVoltage => write!(f, "AC output voltage too low"),
            AnomalyReason::HighAcVoltage => write!(f, "AC output voltage too high"),
            AnomalyReason::LowBatteryVoltage => write!(f, "battery voltage too low"),
            AnomalyReason::HighBatteryVoltage => write!(f, "battery overcharge"),
            AnomalyReason::LowBatteryCurrent => write!(f, "battery current drop"),
            AnomalyReason::HighBatteryCurrent => write!(f, "battery current spike"),
            AnomalyReason::Overload => write!(f, "inverter overload"),
            AnomalyReason::LowLoad => write!(f, "load almost absent"),
            AnomalyReason::Overheating => write!(f, "battery overheating"),
            AnomalyReason::LowTemperature => write!(f, "battery temperature too low"),
            AnomalyReason::Deviation(feature) => write!(f, "unusual {feature}"),
            AnomalyReason::Unexplained => write!(f, "anomalous combination of readings"),
            AnomalyReason::Other(text) => write!(f, "{text}"),
        }
    }
}

// ============================================================================
// Scoring result
// ============================================================================

/// Qualitative interpretation of an anomaly score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyLevel {
    Normal,
    Low,
    Medium,
    High,
}

impl AnomalyLevel {
    /// More negative scores are more anomalous.
    pub fn from_score(score: f64) -> Self {
        if score < -0.5 {
            AnomalyLevel::High
        } else if score < -0.3 {
            AnomalyLevel::Medium
        } else if score < 0.0 {
            AnomalyLevel::Low
        } else {
            AnomalyLevel::Normal
        }
    }
}

impl fmt::Display for AnomalyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyLevel::Normal => write!(f, "normal"),
            AnomalyLevel::Low => write!(f, "low likelihood"),
            AnomalyLevel::Medium => write!(f, "medium likelihood"),
            AnomalyLevel::High => write!(f, "high likelihood"),
        }
    }
}

/// Scoring annotations written onto a reading.
///
/// Grouped in one struct so a reading is either fully scored or not scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub is_anomaly: bool,
    /// Raw decision-function output; negative = anomalous.
    pub anomaly_score: f64,
    /// Empty when the reading is not anomalous.
    pub reasons: Vec<AnomalyReason>,
    pub forecast: Forecast,
    pub is_abnormal_prediction: bool,
}

impl ScoreResult {
    /// Human-readable reason line, `None` when not anomalous.
    pub fn reason_text(&self) -> Option<String> {
        if self.reasons.is_empty() {
            return None;
        }
        Some(
            self.reasons
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

// ============================================================================
// Reading
// ============================================================================

/// One timestamped sample of the monitored system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: u64,
    /// Set once at creation.
    pub timestamp: DateTime<Utc>,
    pub measurements: Measurements,
    /// `None` until scored.
    #[serde(default)]
    pub scoring: Option<ScoreResult>,
    #[serde(default)]
    pub backup_triggered: bool,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Reading {
    pub fn is_anomaly(&self) -> bool {
        self.scoring.as_ref().is_some_and(|s| s.is_anomaly)
    }

    pub fn is_abnormal_prediction(&self) -> bool {
        self.scoring.as_ref().is_some_and(|s| s.is_abnormal_prediction)
    }

    pub fn anomaly_level(&self) -> Option<AnomalyLevel> {
        self.scoring
            .as_ref()
            .map(|s| AnomalyLevel::from_score(s.anomaly_score))
    }
}

/// Fields supplied by the creator of a reading; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub measurements: Measurements,
    pub is_manual: bool,
    pub created_by: Option<String>,
}

// ============================================================================
// Generation profile
// ============================================================================

/// What kind of reading the generator should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadingProfile {
    Normal,
    Anomaly,
    AbnormalForecast,
}

impl fmt::Display for ReadingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingProfile::Normal => write!(f, "normal"),
            ReadingProfile::Anomaly => write!(f, "anomaly"),
            ReadingProfile::AbnormalForecast => write!(f, "abnormal-forecast"),
        }
    }
}

impl FromStr for ReadingProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "normal" => Ok(ReadingProfile::Normal),
            "anomaly" => Ok(ReadingProfile::Anomaly),
            "abnormal-forecast" | "abnormal-prediction" | "prediction" => {
                Ok(ReadingProfile::AbnormalForecast)
            }
            other => Err(format!(
                "unknown profile '{other}' (expected normal, anomaly or abnormal-forecast)"
            )),
        }
    }
}
