//! Display helpers. Timezone conversion happens here and nowhere else.

use chrono::{DateTime, FixedOffset, Utc};

use crate::models::common::BillingPeriod;
use crate::models::subscription::{DateType, SubscriptionSnapshot};

pub fn format_date(value: Option<DateTime<Utc>>, offset: FixedOffset) -> String {
    match value {
        Some(value) => value.with_timezone(&offset).format("%B %-d, %Y %H:%M").to_string(),
        None => "-".to_string(),
    }
}

pub fn describe_billing_schedule(interval: u32, period: BillingPeriod) -> String {
    match interval {
        1 => format!("every {}", period),
        2 => format!("every other {}", period),
        n => format!("every {} {}s", n, period),
    }
}

/// One-line summary, e.g. for log output or an admin list.
pub fn summarize(snapshot: &SubscriptionSnapshot, offset: FixedOffset) -> String {
    format!(
        "#{} {} {} {} next payment: {}",
        snapshot.id,
        snapshot.status.label(),
        snapshot.total,
        describe_billing_schedule(snapshot.billing_interval, snapshot.billing_period),
        format_date(snapshot.dates.get(DateType::NextPayment), offset),
    )
}
