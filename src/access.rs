// src/access.rs
//
// Token-gated access: resolve a subscriber's tier from their held balance,
// then rate-limit deliveries per tier. Tier resolution is a pure function;
// the gate is the only stateful part and it runs on caller-supplied
// timestamps, never wall-clock reads, so decisions replay identically.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::collections::HashMap;

use crate::models::{AccessTier, AlertBudget};

/// Highest tier whose requirement the balance meets, or None: there is no
/// free tier, so a balance below every requirement is simply unauthorized.
pub fn authorize(balance: u64, tiers: &[AccessTier]) -> Option<&AccessTier> {
    tiers
        .iter()
        .filter(|tier| tier.required_tokens <= balance)
        .max_by_key(|tier| tier.required_tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Deliver,
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Balance below every tier. A normal outcome, not an error.
    Unauthorized,
    /// Inside the tier's minimum spacing since the last delivery.
    TooSoon,
    /// Rolling-period alert budget spent.
    BudgetExhausted,
}

/// Per-subscriber delivery limiter. Suppression is terminal: a suppressed
/// alert is not queued or retried.
pub struct AccessGate {
    /// Rolling period the max_alerts budget applies to.
    budget_period: Duration,
    /// Delivery timestamps per subscriber, pruned to the budget period.
    deliveries: HashMap<String, Vec<DateTime<Utc>>>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::with_budget_period(Duration::hours(1))
    }

    pub fn with_budget_period(budget_period: Duration) -> Self {
        Self {
            budget_period,
            deliveries: HashMap::new(),
        }
    }

    /// Decide whether `subscriber` (holding `balance` tokens) may receive an
    /// alert at `now`. Records the delivery when the answer is Deliver.
    pub fn permit(
        &mut self,
        subscriber: &str,
        balance: u64,
        tiers: &[AccessTier],
        now: DateTime<Utc>,
    ) -> GateDecision {
        let Some(tier) = authorize(balance, tiers) else {
            debug!(
                "🔒 {} holds {} tokens, below every tier",
                subscriber, balance
            );
            return GateDecision::Suppressed(SuppressReason::Unauthorized);
        };

        let history = self.deliveries.entry(subscriber.to_string()).or_default();
        // Drop deliveries that fell out of the rolling period.
        let period = self.budget_period;
        history.retain(|&at| now < at || now - at < period);

        if let Some(&last) = history.last() {
            let spacing = Duration::seconds(tier.refresh_rate_secs as i64);
            if now - last < spacing {
                debug!(
                    "⏳ {} inside {}s refresh window of tier {}",
                    subscriber, tier.refresh_rate_secs, tier.name
                );
                return GateDecision::Suppressed(SuppressReason::TooSoon);
            }
        }

        if let AlertBudget::Limited(max) = tier.max_alerts {
            if history.len() as u32 >= max {
                info!(
                    "🚦 {} spent the {}-alert budget for tier {}",
                    subscriber, max, tier.name
                );
                return GateDecision::Suppressed(SuppressReason::BudgetExhausted);
            }
        }

        history.push(now);
        GateDecision::Deliver
    }
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: &str, required: u64, max_alerts: AlertBudget, refresh: u64) -> AccessTier {
        AccessTier {
            name: name.into(),
            required_tokens: required,
            features: vec![],
            max_alerts,
            refresh_rate_secs: refresh,
        }
    }

    fn tiers() -> Vec<AccessTier> {
        vec![
            tier("Basic", 100, AlertBudget::Limited(5), 300),
            tier("Premium", 1_000, AlertBudget::Limited(50), 60),
            tier("Enterprise", 10_000, AlertBudget::Unlimited, 10),
        ]
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn balance_between_tiers_resolves_down() {
        let tiers = tiers();
        let tier = authorize(500, &tiers).unwrap();
        assert_eq!(tier.name, "Basic");
    }

    #[test]
    fn exact_requirement_qualifies() {
        let tiers = tiers();
        assert_eq!(authorize(1_000, &tiers).unwrap().name, "Premium");
    }

    #[test]
    fn balance_below_every_tier_is_unauthorized() {
        let tiers = tiers();
        assert!(authorize(99, &tiers).is_none());
        assert!(authorize(0, &tiers).is_none());
    }

    #[test]
    fn authorize_is_monotonic_in_balance() {
        let tiers = tiers();
        let mut last_requirement = 0u64;
        for balance in [0u64, 50, 100, 500, 1_000, 5_000, 10_000, 1_000_000] {
            let requirement = authorize(balance, &tiers)
                .map(|t| t.required_tokens)
                .unwrap_or(0);
            assert!(
                requirement >= last_requirement,
                "tier requirement regressed at balance {}",
                balance
            );
            last_requirement = requirement;
        }
    }

    #[test]
    fn authorize_ignores_table_order() {
        let mut shuffled = tiers();
        shuffled.reverse();
        assert_eq!(authorize(500, &shuffled).unwrap().name, "Basic");
    }

    #[test]
    fn unauthorized_subscriber_never_delivers() {
        let mut gate = AccessGate::new();
        let tiers = tiers();
        assert_eq!(
            gate.permit("alice", 10, &tiers, ts(0)),
            GateDecision::Suppressed(SuppressReason::Unauthorized)
        );
    }

    #[test]
    fn refresh_rate_spaces_deliveries() {
        let mut gate = AccessGate::new();
        let tiers = tiers();

        // Basic tier: 300s spacing.
        assert_eq!(gate.permit("bob", 500, &tiers, ts(0)), GateDecision::Deliver);
        assert_eq!(
            gate.permit("bob", 500, &tiers, ts(299)),
            GateDecision::Suppressed(SuppressReason::TooSoon)
        );
        assert_eq!(
            gate.permit("bob", 500, &tiers, ts(300)),
            GateDecision::Deliver
        );
    }

    #[test]
    fn budget_caps_deliveries_within_the_rolling_hour() {
        let mut gate = AccessGate::new();
        let tiers = tiers();

        // Basic allows 5 alerts/hour at 300s spacing.
        for i in 0..5 {
            assert_eq!(
                gate.permit("carol", 500, &tiers, ts(i * 300)),
                GateDecision::Deliver
            );
        }
        assert_eq!(
            gate.permit("carol", 500, &tiers, ts(5 * 300)),
            GateDecision::Suppressed(SuppressReason::BudgetExhausted)
        );

        // Once the first delivery ages out of the hour, capacity returns.
        assert_eq!(
            gate.permit("carol", 500, &tiers, ts(3_601)),
            GateDecision::Deliver
        );
    }

    #[test]
    fn unlimited_budget_still_respects_spacing() {
        let mut gate = AccessGate::new();
        let tiers = tiers();

        // Enterprise: unlimited budget, 10s spacing.
        for i in 0..100 {
            assert_eq!(
                gate.permit("dave", 50_000, &tiers, ts(i * 10)),
                GateDecision::Deliver
            );
        }
        assert_eq!(
            gate.permit("dave", 50_000, &tiers, ts(995)),
            GateDecision::Suppressed(SuppressReason::TooSoon)
        );
    }

    #[test]
    fn subscribers_are_limited_independently() {
        let mut gate = AccessGate::new();
        let tiers = tiers();

        assert_eq!(gate.permit("erin", 500, &tiers, ts(0)), GateDecision::Deliver);
        assert_eq!(
            gate.permit("frank", 500, &tiers, ts(0)),
            GateDecision::Deliver
        );
    }
}
