//! Which trigger reason, if any, justifies a backup request.

use crate::types::{ReasonRule, Reading, TriggerReason};

/// Ordered rules; the first one that applies names the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPolicy {
    order: Vec<ReasonRule>,
}

impl Default for ReasonPolicy {
    fn default() -> Self {
        Self::new(ReasonRule::DEFAULT_ORDER.to_vec())
    }
}

impl ReasonPolicy {
    pub fn new(order: Vec<ReasonRule>) -> Self {
        Self { order }
    }

    pub fn order(&self) -> &[ReasonRule] {
        &self.order
    }

    /// `None` means the request is a no-op.
    ///
    /// A forced or explicit request is never dropped: if its rule is left
    /// out of the order it still applies after the configured rules.
    pub fn resolve(
        &self,
        force: bool,
        explicit: Option<TriggerReason>,
        reading: Option<&Reading>,
    ) -> Option<TriggerReason> {
        for rule in &self.order {
            let reason = match rule {
                ReasonRule::Force => force.then_some(TriggerReason::Manual),
                ReasonRule::Explicit => explicit,
                ReasonRule::Anomaly => reading
                    .is_some_and(Reading::is_anomaly)
                    .then_some(TriggerReason::Anomaly),
                ReasonRule::AbnormalForecast => reading
                    .is_some_and(Reading::is_abnormal_prediction)
                    .then_some(TriggerReason::AbnormalForecast),
            };
            if reason.is_some() {
                return reason;
            }
        }
        if force {
            return Some(TriggerReason::Manual);
        }
        explicit
    }
}
