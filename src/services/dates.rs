//! Billing date calculations. Pure functions of a subscription and "now".

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::config::BillingConfig;
use crate::models::common::BillingPeriod;
use crate::models::subscription::Subscription;

/// Tunables for date computation, fixed at composition time.
#[derive(Debug, Clone, PartialEq)]
pub struct DatePolicy {
    /// A computed next payment must be at least this far in the future.
    pub next_payment_buffer: Duration,
    /// A next payment this close to (or past) the end date is not charged.
    pub end_date_grace: Duration,
    /// On activation, a stored next payment closer than this is recalculated.
    pub activation_threshold: Duration,
    pub max_period_iterations: u32,
}

impl Default for DatePolicy {
    fn default() -> Self {
        Self {
            next_payment_buffer: Duration::hours(2),
            end_date_grace: Duration::hours(23),
            activation_threshold: Duration::hours(2),
            max_period_iterations: 3000,
        }
    }
}

impl From<&BillingConfig> for DatePolicy {
    fn from(config: &BillingConfig) -> Self {
        Self {
            next_payment_buffer: Duration::hours(i64::from(config.next_payment_buffer_hours)),
            end_date_grace: Duration::hours(i64::from(config.end_date_grace_hours)),
            activation_threshold: Duration::hours(i64::from(config.activation_threshold_hours)),
            max_period_iterations: config.max_period_iterations,
        }
    }
}

/// Adds `interval` billing periods to `from`.
///
/// Month and year steps keep the day of month, clamping to the last day of
/// shorter months. A month-end source always lands on the target month's end.
/// Returns `None` only on calendar overflow.
pub fn add_period(from: DateTime<Utc>, interval: u32, period: BillingPeriod) -> Option<DateTime<Utc>> {
    match period {
        BillingPeriod::Day => from.checked_add_signed(Duration::days(i64::from(interval))),
        BillingPeriod::Week => from.checked_add_signed(Duration::weeks(i64::from(interval))),
        BillingPeriod::Month => add_months(from, interval),
        BillingPeriod::Year => add_months(from, interval.checked_mul(12)?),
    }
}

fn add_months(from: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    let date = from.date_naive();
    let mut target = date.checked_add_months(Months::new(months))?;
    if is_last_day_of_month(date) {
        target = last_day_of_month(target)?;
    }
    Some(Utc.from_utc_datetime(&NaiveDateTime::new(target, from.time())))
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt().map_or(true, |next| next.month() != date.month())
}

fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let first_of_next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
    };
    first_of_next.pred_opt()
}

#[derive(Debug, Clone, Default)]
pub struct DateCalculator {
    policy: DatePolicy,
}

impl DateCalculator {
    pub fn new(policy: DatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DatePolicy {
        &self.policy
    }

    /// When the next renewal payment is due, or `None` if no further payment is due.
    pub fn calculate_next_payment_date(&self, subscription: &Subscription, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let dates = subscription.dates();

        // First payment is due when the trial ends.
        if let Some(trial_end) = dates.trial_end {
            if trial_end > now {
                return Some(trial_end);
            }
        }

        let start = dates.start.unwrap_or(now);
        let stale_trial_payment = dates.next_payment.filter(|next_payment| {
            *next_payment < now && subscription.completed_payment_count() < 2 && subscription.has_trial()
        });

        let anchor = if let Some(next_payment) = stale_trial_payment {
            next_payment
        } else if let Some(last_payment) = dates.last_payment.filter(|last| *last >= start) {
            last_payment
        } else if let Some(next_payment) = dates.next_payment.filter(|next| *next > start) {
            // Keeps a synchronised renewal day.
            next_payment
        } else {
            start
        };

        let interval = subscription.billing_interval();
        let period = subscription.billing_period();
        let mut next_payment = add_period(anchor, interval, period)?;

        // Stay clear of the current day so a DST shift can never double charge.
        let threshold = now + self.policy.next_payment_buffer;
        let mut iterations = 1;
        while next_payment < threshold && iterations < self.policy.max_period_iterations {
            next_payment = add_period(next_payment, interval, period)?;
            iterations += 1;
        }
        if next_payment < threshold {
            log::warn!(
                "Subscription #{} gave up finding a next payment after {} periods",
                subscription.id(),
                iterations
            );
            return None;
        }

        if let Some(end) = dates.end {
            if next_payment + self.policy.end_date_grace > end {
                return None;
            }
        }

        Some(next_payment)
    }

    /// Trial end equals the first payment; a trial is exhausted after two completed payments.
    pub fn calculate_trial_end_date(&self, subscription: &Subscription, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if subscription.completed_payment_count() >= 2 {
            return None;
        }
        self.calculate_next_payment_date(subscription, now)
    }

    /// The last moment the customer has already paid for.
    pub fn calculate_end_of_prepaid_term_date(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let dates = subscription.dates();
        let (next_payment, end) = (dates.next_payment, dates.end);

        match (next_payment, end) {
            (None, None) => None,
            (Some(next_payment), _) if next_payment >= now => Some(next_payment),
            (None, _) => Some(now),
            (Some(_), Some(end)) if end > now => Some(end),
            (Some(_), _) => Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::subscription::DateType;
    use crate::testing::{new_subscription, utc};

    fn calculator() -> DateCalculator {
        DateCalculator::default()
    }

    #[test]
    fn test_add_period_month_end_clamps() {
        let jan_31 = utc(2024, 1, 31, 9, 0, 0);
        let feb = add_period(jan_31, 1, BillingPeriod::Month).unwrap();
        assert_eq!(feb, utc(2024, 2, 29, 9, 0, 0));
        let mar = add_period(feb, 1, BillingPeriod::Month).unwrap();
        assert_eq!(mar, utc(2024, 3, 31, 9, 0, 0));

        let mid = add_period(utc(2024, 1, 15, 0, 0, 0), 3, BillingPeriod::Month).unwrap();
        assert_eq!(mid, utc(2024, 4, 15, 0, 0, 0));
    }

    #[test]
    fn test_add_period_other_units() {
        let from = utc(2024, 2, 29, 0, 0, 0);
        assert_eq!(add_period(from, 1, BillingPeriod::Year).unwrap(), utc(2025, 2, 28, 0, 0, 0));
        assert_eq!(add_period(from, 2, BillingPeriod::Week).unwrap(), utc(2024, 3, 14, 0, 0, 0));
        assert_eq!(add_period(from, 10, BillingPeriod::Day).unwrap(), utc(2024, 3, 10, 0, 0, 0));
    }

    #[test]
    fn test_monthly_without_trial() {
        let now = utc(2024, 1, 1, 0, 0, 0);
        let subscription = new_subscription(1, BillingPeriod::Month, 0, now);
        assert_eq!(
            calculator().calculate_next_payment_date(&subscription, now),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_trial_end_is_first_payment() {
        let created = utc(2024, 1, 1, 0, 0, 0);
        let subscription = new_subscription(1, BillingPeriod::Month, 14, created);
        assert_eq!(subscription.date(DateType::TrialEnd), Some(utc(2024, 1, 15, 0, 0, 0)));

        let now = utc(2024, 1, 10, 0, 0, 0);
        assert_eq!(
            calculator().calculate_next_payment_date(&subscription, now),
            Some(utc(2024, 1, 15, 0, 0, 0))
        );
        assert_eq!(
            calculator().calculate_trial_end_date(&subscription, now),
            Some(utc(2024, 1, 15, 0, 0, 0))
        );
    }

    #[test]
    fn test_last_payment_anchor() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut subscription = new_subscription(1, BillingPeriod::Month, 0, start);
        subscription.set_date(DateType::LastPayment, Some(utc(2024, 3, 5, 10, 0, 0)));

        let now = utc(2024, 3, 5, 10, 0, 0);
        assert_eq!(
            calculator().calculate_next_payment_date(&subscription, now),
            Some(utc(2024, 4, 5, 10, 0, 0))
        );
    }

    #[test]
    fn test_stale_anchor_skips_to_future() {
        let start = utc(2020, 1, 1, 0, 0, 0);
        let subscription = new_subscription(1, BillingPeriod::Week, 0, start);
        let now = utc(2024, 6, 1, 12, 0, 0);

        let next = calculator().calculate_next_payment_date(&subscription, now).unwrap();
        assert!(next >= now + Duration::hours(2));
        assert!(next < now + Duration::weeks(1) + Duration::hours(2));
    }

    #[test]
    fn test_next_payment_never_inside_buffer() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let calc = calculator();
        for period in [BillingPeriod::Day, BillingPeriod::Week, BillingPeriod::Month, BillingPeriod::Year] {
            for hours in [0, 1, 22, 23, 24, 25, 24 * 40, 24 * 400] {
                let now = start + Duration::hours(hours);
                let subscription = new_subscription(1, period, 0, start);
                if let Some(next) = calc.calculate_next_payment_date(&subscription, now) {
                    assert!(next >= now + Duration::hours(2), "{:?} at +{}h gave {}", period, hours, next);
                }
            }
        }
    }

    #[test]
    fn test_next_payment_gives_up_past_iteration_cap() {
        let calc = calculator();
        let subscription = new_subscription(1, BillingPeriod::Day, 0, utc(2010, 1, 1, 0, 0, 0));
        assert_eq!(calc.calculate_next_payment_date(&subscription, utc(2024, 6, 1, 0, 0, 0)), None);

        // Inside the cap the schedule still catches up.
        let now = utc(2015, 1, 1, 0, 0, 0);
        let next = calc.calculate_next_payment_date(&subscription, now).unwrap();
        assert_eq!(next, utc(2015, 1, 2, 0, 0, 0));
    }

    #[test]
    fn test_no_payment_past_end_date() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut subscription = new_subscription(1, BillingPeriod::Month, 0, start);
        subscription.set_date(DateType::End, Some(utc(2024, 2, 1, 10, 0, 0)));

        assert_eq!(calculator().calculate_next_payment_date(&subscription, start), None);

        subscription.set_date(DateType::End, Some(utc(2024, 2, 2, 0, 0, 0)));
        assert_eq!(
            calculator().calculate_next_payment_date(&subscription, start),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_trial_exhausted_after_two_payments() {
        let start = utc(2024, 1, 1, 0, 0, 0);
        let mut subscription = new_subscription(1, BillingPeriod::Month, 14, start);
        subscription.record_completed_payment();
        subscription.record_completed_payment();
        assert_eq!(calculator().calculate_trial_end_date(&subscription, start), None);
    }

    #[test]
    fn test_end_of_prepaid_term() {
        let now = utc(2024, 5, 1, 0, 0, 0);
        let calc = calculator();
        let mut subscription = new_subscription(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0));

        assert_eq!(calc.calculate_end_of_prepaid_term_date(&subscription, now), None);

        subscription.set_date(DateType::NextPayment, Some(utc(2024, 5, 11, 0, 0, 0)));
        assert_eq!(
            calc.calculate_end_of_prepaid_term_date(&subscription, now),
            Some(utc(2024, 5, 11, 0, 0, 0))
        );

        subscription.set_date(DateType::NextPayment, Some(utc(2024, 4, 20, 0, 0, 0)));
        subscription.set_date(DateType::End, Some(utc(2024, 6, 1, 0, 0, 0)));
        assert_eq!(
            calc.calculate_end_of_prepaid_term_date(&subscription, now),
            Some(utc(2024, 6, 1, 0, 0, 0))
        );

        subscription.set_date(DateType::End, Some(utc(2024, 4, 25, 0, 0, 0)));
        assert_eq!(calc.calculate_end_of_prepaid_term_date(&subscription, now), Some(now));

        subscription.delete_date(DateType::NextPayment);
        assert_eq!(calc.calculate_end_of_prepaid_term_date(&subscription, now), Some(now));
    }
}
