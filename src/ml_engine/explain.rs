//! Human-readable reasons for an anomalous reading.
//!
//! Each feature's contribution is measured by holding it at its dataset mean
//! and re-scoring. Features are ranked by absolute contribution; any ranked
//! feature that crosses a domain threshold yields a specific reason, in rank
//! order. When none does, one of the tied top contributors is picked at
//! random and reported as a deviation.

use rand::seq::SliceRandom;
use rand::Rng;

use super::models::{AnomalyModel, ModelError};
use crate::types::{AnomalyReason, Feature, Features, FEATURE_COUNT};

/// Contributions within this fraction of the largest count as tied.
const TIE_RATIO: f64 = 0.9;

/// Contribution of one feature to the anomaly score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub feature: Feature,
    /// Score with the feature at its mean minus the actual score.
    /// Positive when the feature pushed the score toward anomalous.
    pub delta: f64,
}

/// Leave-one-feature-out contributions, largest absolute first.
pub fn contributions(
    model: &dyn AnomalyModel,
    features: &Features,
) -> Result<Vec<Contribution>, ModelError> {
    let base = model.decision_function(features)?;
    let means = model.feature_means();

    let mut ranked = Feature::ALL
        .iter()
        .map(|&feature| -> Result<Contribution, ModelError> {
            let held = features.with(feature, means.get(feature));
            Ok(Contribution {
                feature,
                delta: model.decision_function(&held)? - base,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ranked.sort_by(|a, b| b.delta.abs().total_cmp(&a.delta.abs()));
    Ok(ranked)
}

/// Domain reason for a feature value, if it is outside its operating band.
pub fn domain_reason(feature: Feature, value: f64) -> Option<AnomalyReason> {
    match feature {
        Feature::AcOutputVoltage if value < 210.0 => Some(AnomalyReason::LowAcVoltage),
        Feature::AcOutputVoltage if value > 250.0 => Some(AnomalyReason::HighAcVoltage),
        Feature::DcBatteryVoltage if value < 21.0 => Some(AnomalyReason::LowBatteryVoltage),
        Feature::DcBatteryVoltage if value > 28.0 => Some(AnomalyReason::HighBatteryVoltage),
        Feature::DcBatteryCurrent if value < 2.0 => Some(AnomalyReason::LowBatteryCurrent),
        Feature::DcBatteryCurrent if value > 20.0 => Some(AnomalyReason::HighBatteryCurrent),
        Feature::LoadPower if value > 2500.0 => Some(AnomalyReason::Overload),
        Feature::LoadPower if value < 100.0 => Some(AnomalyReason::LowLoad),
        Feature::Temperature if value > 45.0 => Some(AnomalyReason::Overheating),
        Feature::Temperature if value < 5.0 => Some(AnomalyReason::LowTemperature),
        _ => None,
    }
}

/// Ordered reasons, most significant first. Never empty on success.
pub fn explain<R: Rng + ?Sized>(
    model: &dyn AnomalyModel,
    features: &Features,
    rng: &mut R,
) -> Result<Vec<AnomalyReason>, ModelError> {
    let ranked = contributions(model, features)?;

    let mut reasons: Vec<AnomalyReason> = Vec::with_capacity(FEATURE_COUNT);
    for c in &ranked {
        if let Some(reason) = domain_reason(c.feature, features.get(c.feature)) {
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
        }
    }
    if !reasons.is_empty() {
        return Ok(reasons);
    }

    let top = ranked.first().map_or(0.0, |c| c.delta.abs());
    if !(top.is_finite() && top > 0.0) {
        return Ok(vec![AnomalyReason::Unexplained]);
    }
    let tied: Vec<Feature> = ranked
        .iter()
        .filter(|c| c.delta.abs() >= top * TIE_RATIO)
        .map(|c| c.feature)
        .collect();
    let reason = tied
        .choose(rng)
        .map_or(AnomalyReason::Unexplained, |&f| AnomalyReason::Deviation(f));
    Ok(vec![reason])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::models::GaussianAnomalyModel;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_contributions_rank_the_outlying_feature_first() {
        let model = GaussianAnomalyModel::default();
        let features = Features([230.0, 24.0, 10.0, 1000.0, 52.0]);
        let ranked = contributions(&model, &features).unwrap();
        assert_eq!(ranked[0].feature, Feature::Temperature);
        assert!(ranked[0].delta > 0.0);
    }

    #[test]
    fn test_domain_reasons_in_rank_order() {
        let model = GaussianAnomalyModel::default();
        // AC voltage is 26 sigma out, temperature 20 sigma out
        let features = Features([152.0, 24.0, 10.0, 1000.0, 55.0]);
        let mut rng = StdRng::seed_from_u64(1);
        let reasons = explain(&model, &features, &mut rng).unwrap();
        assert_eq!(reasons, vec![AnomalyReason::LowAcVoltage, AnomalyReason::Overheating]);
    }

    #[test]
    fn test_falls_back_to_deviation_among_tied_features() {
        let model = GaussianAnomalyModel::default();
        // both 4 sigma out, neither crosses a domain threshold
        let features = Features([230.0, 24.0, 14.0, 1800.0, 35.0]);
        let mut rng = StdRng::seed_from_u64(7);
        let reasons = explain(&model, &features, &mut rng).unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(matches!(
            reasons[0],
            AnomalyReason::Deviation(Feature::DcBatteryCurrent | Feature::LoadPower)
        ));
    }

    #[test]
    fn test_mean_point_is_unexplained() {
        let model = GaussianAnomalyModel::default();
        let mut rng = StdRng::seed_from_u64(3);
        let reasons = explain(&model, &model.feature_means(), &mut rng).unwrap();
        assert_eq!(reasons, vec![AnomalyReason::Unexplained]);
    }
}
