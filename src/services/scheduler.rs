//! Keeps the task queue in line with a subscription's dates and status.
//!
//! Each hook has at most one pending task per subscription. Reconciliation reads
//! what the queue already holds and only cancels or schedules when that differs
//! from what the record wants, so replaying it is free.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::models::subscription::{DateType, Subscription, SubscriptionStatus};
use crate::models::task::{Hook, TaskArgs};
use crate::services::task_queue::TaskQueue;
use crate::utils::clock::Clock;

/// Hooks cancelled when a subscription stops renewing.
const PER_DATE_HOOKS: [Hook; 4] = [Hook::ScheduledPayment, Hook::PaymentRetry, Hook::TrialEnd, Hook::Expiration];

pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }

    /// The hook driven by `date_type`. The end date's hook depends on the status.
    pub fn hook_for(date_type: DateType, status: SubscriptionStatus) -> Option<Hook> {
        match date_type {
            DateType::NextPayment => Some(Hook::ScheduledPayment),
            DateType::PaymentRetry => Some(Hook::PaymentRetry),
            DateType::TrialEnd => Some(Hook::TrialEnd),
            DateType::End => match status {
                SubscriptionStatus::Cancelled | SubscriptionStatus::PendingCancel => Some(Hook::EndOfPrepaidTerm),
                SubscriptionStatus::Active => Some(Hook::Expiration),
                _ => None,
            },
            _ => None,
        }
    }

    fn is_schedulable(date_type: DateType, status: SubscriptionStatus) -> bool {
        date_type == DateType::PaymentRetry
            || status == SubscriptionStatus::Active
            || (status == SubscriptionStatus::PendingCancel && date_type == DateType::End)
    }

    pub fn on_date_changed(&self, subscription: &Subscription, date_type: DateType, value: Option<DateTime<Utc>>) {
        let status = subscription.status();
        let Some(hook) = Self::hook_for(date_type, status) else {
            return;
        };

        let now = self.clock.now();
        let desired = value.filter(|at| *at > now && Self::is_schedulable(date_type, status));
        self.reconcile_logged(subscription, hook, desired);
    }

    pub fn on_status_changed(
        &self,
        subscription: &Subscription,
        new_status: SubscriptionStatus,
        old_status: SubscriptionStatus,
    ) {
        log::debug!(
            "Reconciling tasks of subscription #{} after {} -> {}",
            subscription.id(),
            old_status,
            new_status
        );

        match new_status {
            SubscriptionStatus::Active => {
                self.reconcile_logged(subscription, Hook::EndOfPrepaidTerm, None);
                for date_type in DateType::TRACKED {
                    let value = subscription.date(date_type);
                    if date_type == DateType::PaymentRetry && value.is_none() {
                        continue;
                    }
                    self.on_date_changed(subscription, date_type, value);
                }
            }
            SubscriptionStatus::PendingCancel => {
                for hook in PER_DATE_HOOKS {
                    self.reconcile_logged(subscription, hook, None);
                }
                let end = subscription.date(DateType::End).filter(|end| *end > self.clock.now());
                self.reconcile_logged(subscription, Hook::EndOfPrepaidTerm, end);
            }
            SubscriptionStatus::OnHold
            | SubscriptionStatus::Cancelled
            | SubscriptionStatus::Switched
            | SubscriptionStatus::Expired
            | SubscriptionStatus::Trash
            | SubscriptionStatus::Deleted => {
                for hook in Hook::ALL {
                    self.reconcile_logged(subscription, hook, None);
                }
            }
            _ => {}
        }
    }

    /// Next pending run of `hook` for the subscription, if any.
    pub fn next_scheduled(&self, subscription: &Subscription, hook: Hook) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.queue.get_next(hook, TaskArgs::for_subscription(subscription.id()))
    }

    fn reconcile_logged(&self, subscription: &Subscription, hook: Hook, desired: Option<DateTime<Utc>>) {
        if let Err(e) = self.reconcile(TaskArgs::for_subscription(subscription.id()), hook, desired) {
            log::error!(
                "Failed to reconcile {} for subscription #{}: {}",
                hook,
                subscription.id(),
                e
            );
        }
    }

    fn reconcile(&self, args: TaskArgs, hook: Hook, desired: Option<DateTime<Utc>>) -> Result<(), QueueError> {
        let scheduled = self.queue.get_next(hook, args)?;
        if scheduled == desired {
            return Ok(());
        }

        if scheduled.is_some() {
            self.queue.cancel_all(hook, args)?;
        }
        if let Some(at) = desired {
            self.queue.schedule_single(at, hook, args)?;
        }
        Ok(())
    }
}
