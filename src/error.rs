//! Error types for the billing engine.
//!
//! [`BillingError`] is what callers of the engine see. Collaborator failures are
//! typed separately ([`StoreError`], [`QueueError`], [`GatewayError`]) and wrapped
//! where they cross into an engine operation.

use thiserror::Error;

use crate::models::common::OrderId;
use crate::models::order::OrderKind;
use crate::models::subscription::SubscriptionStatus;
use crate::models::task::TaskId;

pub type Result<T> = std::result::Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// The requested status change is not permitted from the current status.
    /// Non-fatal: the previous status is kept and a note is recorded.
    #[error("Unable to change subscription status from \"{}\" to \"{}\".", from.label(), to.label())]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    /// Building a renewal, resubscribe or parent order failed and was rolled back.
    #[error("Failed to create {kind} order: {reason}")]
    OrderCreation { kind: OrderKind, reason: String },

    /// A due task referenced something that is not a subscription. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Saving the subscription failed after a status mutation; the mutation was undone.
    #[error("Failed to save subscription #{id}: {source}")]
    Persistence {
        id: OrderId,
        #[source]
        source: StoreError,
    },

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order #{0} not found")]
    NotFound(OrderId),

    #[error("order #{id} is a {found}, expected a {expected}")]
    WrongType {
        id: OrderId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("order store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("order #{id} has corrupt data: {reason}")]
    Corrupt { id: OrderId, reason: String },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no gateway registered for payment method \"{0}\"")]
    UnknownGateway(String),

    #[error("gateway {gateway} unavailable: {reason}")]
    Unavailable { gateway: String, reason: String },
}
