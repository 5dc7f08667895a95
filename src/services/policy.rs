//! Extension points consulted by the state machine and payment flow.

use chrono::Duration;

use crate::config::BillingConfig;
use crate::models::subscription::{Subscription, SubscriptionStatus};

/// Decides transitions the built-in rules do not cover.
pub trait EligibilityPolicy: Send + Sync {
    fn allow_transition(&self, subscription: &Subscription, target: SubscriptionStatus) -> bool;
}

/// Rejects everything outside the built-in table.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyUnlisted;

impl EligibilityPolicy for DenyUnlisted {
    fn allow_transition(&self, _subscription: &Subscription, _target: SubscriptionStatus) -> bool {
        false
    }
}

pub trait FailedPaymentPolicy: Send + Sync {
    /// When true, a failed payment cancels the subscription instead of suspending it.
    fn max_failures_exceeded(&self, subscription: &Subscription) -> bool;

    /// Delay before the next automatic retry, if one should happen.
    fn retry_delay(&self, subscription: &Subscription) -> Option<Duration>;
}

/// Fixed retry ladder: the n-th consecutive failure waits `intervals[n - 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRules {
    intervals: Vec<Duration>,
    max_failed_payments: Option<u32>,
}

impl RetryRules {
    pub fn new(intervals: Vec<Duration>, max_failed_payments: Option<u32>) -> Self {
        Self {
            intervals,
            max_failed_payments,
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        let intervals = config
            .retry_intervals_hours
            .iter()
            .map(|hours| Duration::hours(i64::from(*hours)))
            .collect();
        let max = Some(config.max_failed_payments).filter(|max| *max > 0);
        Self::new(intervals, max)
    }
}

impl FailedPaymentPolicy for RetryRules {
    fn max_failures_exceeded(&self, subscription: &Subscription) -> bool {
        self.max_failed_payments
            .map_or(false, |max| subscription.failed_payment_count() > max)
    }

    fn retry_delay(&self, subscription: &Subscription) -> Option<Duration> {
        let failures = subscription.failed_payment_count() as usize;
        if failures == 0 {
            return None;
        }
        self.intervals.get(failures - 1).copied()
    }
}
