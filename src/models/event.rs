use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::common::OrderId;
use crate::models::subscription::{DateType, SubscriptionStatus};

/// Typed notifications produced while a subscription is mutated.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    DateUpdated {
        subscription_id: OrderId,
        date_type: DateType,
        value: DateTime<Utc>,
    },
    DateDeleted {
        subscription_id: OrderId,
        date_type: DateType,
    },
    StatusUpdated {
        subscription_id: OrderId,
        new_status: SubscriptionStatus,
        old_status: SubscriptionStatus,
    },
    UnableToUpdateStatus {
        subscription_id: OrderId,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    PaymentComplete {
        subscription_id: OrderId,
    },
    PaymentFailed {
        subscription_id: OrderId,
        new_status: SubscriptionStatus,
    },
    RenewalPaymentComplete {
        subscription_id: OrderId,
        order_id: OrderId,
    },
    TrialEnded {
        subscription_id: OrderId,
    },
    ScheduledPaymentDispatched {
        subscription_id: OrderId,
        order_id: OrderId,
        gateway_id: String,
        amount: Decimal,
    },
}

impl SubscriptionEvent {
    pub fn subscription_id(&self) -> OrderId {
        match self {
            SubscriptionEvent::DateUpdated { subscription_id, .. }
            | SubscriptionEvent::DateDeleted { subscription_id, .. }
            | SubscriptionEvent::StatusUpdated { subscription_id, .. }
            | SubscriptionEvent::UnableToUpdateStatus { subscription_id, .. }
            | SubscriptionEvent::PaymentComplete { subscription_id }
            | SubscriptionEvent::PaymentFailed { subscription_id, .. }
            | SubscriptionEvent::RenewalPaymentComplete { subscription_id, .. }
            | SubscriptionEvent::TrialEnded { subscription_id }
            | SubscriptionEvent::ScheduledPaymentDispatched { subscription_id, .. } => *subscription_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::DateUpdated { .. } => "date_updated",
            SubscriptionEvent::DateDeleted { .. } => "date_deleted",
            SubscriptionEvent::StatusUpdated { .. } => "status_updated",
            SubscriptionEvent::UnableToUpdateStatus { .. } => "unable_to_update_status",
            SubscriptionEvent::PaymentComplete { .. } => "payment_complete",
            SubscriptionEvent::PaymentFailed { .. } => "payment_failed",
            SubscriptionEvent::RenewalPaymentComplete { .. } => "renewal_payment_complete",
            SubscriptionEvent::TrialEnded { .. } => "trial_ended",
            SubscriptionEvent::ScheduledPaymentDispatched { .. } => "scheduled_payment_dispatched",
        }
    }
}
