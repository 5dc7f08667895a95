//! Handlers for due tasks fired by the task queue.
//!
//! Every handler reloads the subscription from the store first, so a replayed
//! task acts on current state. An id that does not resolve to a subscription
//! fails with `InvalidArgument` and is never retried.

use rust_decimal::Decimal;

use crate::error::{BillingError, Result, StoreError};
use crate::models::common::OrderId;
use crate::models::event::SubscriptionEvent;
use crate::models::order::OrderStatus;
use crate::models::subscription::{DateType, Subscription, SubscriptionStatus};
use crate::models::task::{Hook, ScheduledTask};
use crate::services::gateway::GatewayFeature;
use crate::services::related;
use crate::services::subscription::SubscriptionService;

impl SubscriptionService {
    /// Routes a claimed task to its handler.
    pub fn handle_task(&self, task: &ScheduledTask) -> Result<()> {
        let subscription_id = task.args.subscription_id;
        log::debug!("Running {} for subscription #{}", task.hook, subscription_id);

        match task.hook {
            Hook::ScheduledPayment => self.handle_payment(subscription_id),
            Hook::PaymentRetry => self.handle_payment_retry(subscription_id),
            Hook::TrialEnd => self.handle_trial_end(subscription_id),
            Hook::EndOfPrepaidTerm => self.handle_end_of_prepaid_term(subscription_id),
            Hook::Expiration => self.handle_expiration(subscription_id),
        }
    }

    /// The next payment date arrived. A replayed task for a cycle that was already
    /// renewed or attempted does nothing.
    pub fn handle_payment(&self, subscription_id: OrderId) -> Result<()> {
        let mut subscription = self.load_for_task(subscription_id)?;

        if self.renewal_already_handled(&subscription)? {
            log::info!(
                "Renewal of subscription #{} is not due, skipping scheduled payment",
                subscription_id
            );
            return Ok(());
        }

        if subscription.status() == SubscriptionStatus::Active && self.bills_renewal_itself(&subscription) {
            self.prepare_renewal(&mut subscription)?;
        }

        if !subscription.is_manual() && !subscription.status().is_ended() {
            let last_renewal = related::last_renewal_order(self.repo.as_ref(), &subscription)?;
            if let Some(order) = last_renewal.filter(|order| order.needs_payment()) {
                self.process_scheduled_payment(&mut subscription, order)?;
            }
        }

        self.dispatch(&mut subscription);
        Ok(())
    }

    /// True when the next payment is still in the future, or when a suspended subscription
    /// already has a renewal order created for the current due date.
    fn renewal_already_handled(&self, subscription: &Subscription) -> Result<bool> {
        let Some(due) = subscription.date(DateType::NextPayment) else {
            return Ok(true);
        };
        if due > self.clock.now() {
            return Ok(true);
        }
        if subscription.status() == SubscriptionStatus::Active {
            return Ok(false);
        }

        let last_renewal = related::last_renewal_order(self.repo.as_ref(), subscription)?;
        Ok(last_renewal.is_some_and(|order| order.data.date_created >= due))
    }

    /// A renewal order is created unless the gateway charges on its own schedule.
    fn bills_renewal_itself(&self, subscription: &Subscription) -> bool {
        subscription.total() <= Decimal::ZERO
            || subscription.is_manual()
            || !self
                .gateways
                .supports(subscription.payment_method(), GatewayFeature::GatewayScheduledPayments)
    }

    fn prepare_renewal(&self, subscription: &mut Subscription) -> Result<()> {
        match self.update_status(subscription, SubscriptionStatus::OnHold, "Subscription renewal payment due:", false) {
            Ok(()) => {}
            Err(BillingError::InvalidTransition { .. }) => {
                log::warn!(
                    "Subscription #{} could not be suspended while its renewal is due",
                    subscription.id()
                );
            }
            Err(e) => return Err(e),
        }

        let mut renewal = match self.renewals.create_renewal_order(subscription) {
            Ok(order) => order,
            Err(first) => {
                log::warn!(
                    "Retrying renewal order for subscription #{} after: {}",
                    subscription.id(),
                    first
                );
                self.renewals.create_renewal_order(subscription)?
            }
        };

        if renewal.data.total <= Decimal::ZERO {
            renewal.mark_paid(self.clock.now(), None);
            self.repo.save_order(&renewal)?;
            return self.payment_complete(subscription, Some(&renewal));
        }

        if subscription.is_manual() {
            self.add_order_note(
                renewal.id,
                "Manual renewal order created. Awaiting payment from the customer.",
            );
        } else {
            renewal.data.payment_method = subscription.payment_method().to_string();
            renewal.data.payment_method_title = subscription.data().payment_method_title.clone();
            self.repo.save_order(&renewal)?;
        }
        Ok(())
    }

    /// Retries the most recent unpaid order.
    pub fn handle_payment_retry(&self, subscription_id: OrderId) -> Result<()> {
        let mut subscription = self.load_for_task(subscription_id)?;

        let Some(mut order) = self.last_order(&subscription)? else {
            return Ok(());
        };
        if !order.needs_payment() {
            log::info!(
                "Order #{} of subscription #{} no longer needs payment, skipping retry",
                order.id,
                subscription_id
            );
            return Ok(());
        }

        order.set_order_status(OrderStatus::Pending);
        self.repo.save_order(&order)?;
        self.process_scheduled_payment(&mut subscription, order)
    }

    pub fn handle_trial_end(&self, subscription_id: OrderId) -> Result<()> {
        let mut subscription = self.load_for_task(subscription_id)?;
        subscription.push_event(SubscriptionEvent::TrialEnded { subscription_id });
        self.dispatch(&mut subscription);
        Ok(())
    }

    pub fn handle_end_of_prepaid_term(&self, subscription_id: OrderId) -> Result<()> {
        let mut subscription = self.load_for_task(subscription_id)?;
        self.update_status(&mut subscription, SubscriptionStatus::Cancelled, "", false)
    }

    pub fn handle_expiration(&self, subscription_id: OrderId) -> Result<()> {
        let mut subscription = self.load_for_task(subscription_id)?;
        self.update_status(&mut subscription, SubscriptionStatus::Expired, "", false)
    }

    fn load_for_task(&self, subscription_id: OrderId) -> Result<Subscription> {
        match self.get_subscription(subscription_id) {
            Ok(subscription) => Ok(subscription),
            Err(BillingError::Store(StoreError::NotFound(_) | StoreError::WrongType { .. })) => Err(
                BillingError::InvalidArgument(format!("#{} is not a subscription", subscription_id)),
            ),
            Err(e) => Err(e),
        }
    }
}
