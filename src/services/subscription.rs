//! The composed billing engine.
//!
//! `SubscriptionService` owns the collaborators and is the entry point for
//! checkout, payment results, admin actions and due tasks. Every public operation
//! ends by draining the record's events: date and status events reconcile the
//! scheduler, and all events are published on the bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use validator::Validate;

use crate::config::BillingConfig;
use crate::error::{BillingError, GatewayError, Result};
use crate::models::common::OrderId;
use crate::models::event::SubscriptionEvent;
use crate::models::order::{Order, OrderNote, OrderStatus};
use crate::models::subscription::{DateType, NewSubscription, RelationKind, Subscription, SubscriptionStatus};
use crate::services::database::OrderRepository;
use crate::services::dates::{DateCalculator, DatePolicy};
use crate::services::events::EventBus;
use crate::services::gateway::{amount_due, GatewayFeature, GatewayRegistry, PaymentOutcome};
use crate::services::policy::{EligibilityPolicy, FailedPaymentPolicy, RetryRules};
use crate::services::related;
use crate::services::renewal::RenewalOrderFactory;
use crate::services::scheduler::Scheduler;
use crate::services::state_machine::StateMachine;
use crate::services::task_queue::TaskQueue;
use crate::utils::clock::Clock;

pub struct SubscriptionService {
    pub(crate) repo: Arc<dyn OrderRepository>,
    pub(crate) gateways: Arc<GatewayRegistry>,
    pub(crate) state_machine: StateMachine,
    pub(crate) scheduler: Scheduler,
    pub(crate) renewals: RenewalOrderFactory,
    failed_payments: Arc<dyn FailedPaymentPolicy>,
    events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
}

impl SubscriptionService {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        queue: Arc<dyn TaskQueue>,
        gateways: Arc<GatewayRegistry>,
        clock: Arc<dyn Clock>,
        config: &BillingConfig,
    ) -> Self {
        let dates = DateCalculator::new(DatePolicy::from(config));
        Self {
            state_machine: StateMachine::new(repo.clone(), gateways.clone(), dates, clock.clone()),
            scheduler: Scheduler::new(queue, clock.clone()),
            renewals: RenewalOrderFactory::new(repo.clone(), clock.clone()),
            failed_payments: Arc::new(RetryRules::from_config(config)),
            events: EventBus::new(),
            repo,
            gateways,
            clock,
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_eligibility_policy(mut self, policy: Arc<dyn EligibilityPolicy>) -> Self {
        self.state_machine = self.state_machine.with_eligibility_policy(policy);
        self
    }

    pub fn with_failed_payment_policy(mut self, policy: Arc<dyn FailedPaymentPolicy>) -> Self {
        self.failed_payments = policy;
        self
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn date_calculator(&self) -> &DateCalculator {
        self.state_machine.date_calculator()
    }

    /// Validates the request and stores a new `pending` subscription.
    pub fn create_subscription(&self, request: NewSubscription) -> Result<Subscription> {
        request.validate()?;

        let mut subscription = Subscription::new(request, self.clock.now());
        let stored = self.repo.insert_order(subscription.to_order())?;
        subscription.set_id(stored.id);
        log::info!(
            "Created subscription #{} for customer {}",
            subscription.id(),
            subscription.customer_id()
        );

        self.dispatch(&mut subscription);
        Ok(subscription)
    }

    pub fn get_subscription(&self, id: OrderId) -> Result<Subscription> {
        let order = self.repo.get_order(id)?;
        Ok(Subscription::from_order(order)?)
    }

    pub fn update_status(
        &self,
        subscription: &mut Subscription,
        target: SubscriptionStatus,
        note: &str,
        manual: bool,
    ) -> Result<()> {
        let result = self.state_machine.update_status(subscription, target, note, manual);
        self.dispatch(subscription);
        result
    }

    /// Records a successful payment and (re)activates the subscription.
    pub fn payment_complete(&self, subscription: &mut Subscription, order: Option<&Order>) -> Result<()> {
        let now = self.clock.now();

        subscription.record_completed_payment();
        subscription.reset_suspension_count();
        let paid_at = order.and_then(|order| order.data.date_paid).unwrap_or(now);
        subscription.set_date(DateType::LastPayment, Some(paid_at));
        subscription.delete_date(DateType::PaymentRetry);
        if subscription.completed_payment_count() >= 2 {
            subscription.delete_date(DateType::TrialEnd);
        }

        if let Err(e) = self.save(subscription) {
            self.dispatch(subscription);
            return Err(e);
        }
        subscription.push_event(SubscriptionEvent::PaymentComplete {
            subscription_id: subscription.id(),
        });

        let result = self
            .state_machine
            .update_status(subscription, SubscriptionStatus::Active, "Payment received.", false);

        if let Some(order) = order.filter(|order| order.meta(RelationKind::Renewal.meta_key()).is_some()) {
            subscription.push_event(SubscriptionEvent::RenewalPaymentComplete {
                subscription_id: subscription.id(),
                order_id: order.id,
            });
        }

        self.dispatch(subscription);
        result
    }

    /// Records a failed payment and suspends (or, past the failure limit, cancels) the subscription.
    pub fn payment_failed(&self, subscription: &mut Subscription, fallback: SubscriptionStatus) -> Result<()> {
        subscription.record_failed_payment();
        let old_status = subscription.status();

        let target = if self.failed_payments.max_failures_exceeded(subscription) {
            log::info!(
                "Subscription #{} exceeded the failed payment limit, cancelling",
                subscription.id()
            );
            SubscriptionStatus::Cancelled
        } else {
            fallback
        };

        match self.state_machine.update_status(subscription, target, "Payment failed.", false) {
            Ok(()) => {}
            Err(BillingError::InvalidTransition { from, to }) => {
                log::warn!(
                    "Subscription #{} stays {} after a failed payment (cannot move to {})",
                    subscription.id(),
                    from,
                    to
                );
            }
            Err(e) => {
                self.dispatch(subscription);
                return Err(e);
            }
        }

        if subscription.status() == old_status {
            if let Err(e) = self.save(subscription) {
                self.dispatch(subscription);
                return Err(e);
            }
        }

        subscription.push_event(SubscriptionEvent::PaymentFailed {
            subscription_id: subscription.id(),
            new_status: subscription.status(),
        });
        self.dispatch(subscription);
        Ok(())
    }

    /// Applies several date changes at once, after checking they stay in order.
    ///
    /// Nothing is changed when any check fails.
    pub fn update_dates(
        &self,
        subscription: &mut Subscription,
        changes: &[(DateType, Option<DateTime<Utc>>)],
    ) -> Result<()> {
        self.validate_date_updates(subscription, changes)?;

        let previous = subscription.clone();
        for (date_type, value) in changes {
            subscription.set_date(*date_type, *value);
        }

        if let Err(e) = self.save(subscription) {
            *subscription = previous;
            return Err(e);
        }
        self.dispatch(subscription);
        Ok(())
    }

    fn validate_date_updates(
        &self,
        subscription: &Subscription,
        changes: &[(DateType, Option<DateTime<Utc>>)],
    ) -> Result<()> {
        let proposed = |date_type: DateType| {
            changes
                .iter()
                .rev()
                .find(|(changed, _)| *changed == date_type)
                .map_or_else(|| subscription.date(date_type), |(_, value)| *value)
        };
        let must_follow = |later: DateType, earlier: DateType| -> Result<()> {
            match (proposed(later), proposed(earlier)) {
                (Some(later_value), Some(earlier_value)) if later_value <= earlier_value => Err(
                    BillingError::InvalidDate(format!("The {} must occur after the {}.", later, earlier)),
                ),
                _ => Ok(()),
            }
        };

        let start = proposed(DateType::Start);
        if start.is_none() {
            return Err(BillingError::InvalidDate("The start_date can not be removed.".to_string()));
        }

        for (date_type, _) in changes {
            match date_type {
                DateType::Start => {
                    must_follow(DateType::TrialEnd, DateType::Start)?;
                    must_follow(DateType::NextPayment, DateType::Start)?;
                    must_follow(DateType::End, DateType::Start)?;
                }
                DateType::TrialEnd => {
                    must_follow(DateType::TrialEnd, DateType::Start)?;
                    must_follow(DateType::NextPayment, DateType::TrialEnd)?;
                    must_follow(DateType::End, DateType::TrialEnd)?;
                }
                DateType::NextPayment => {
                    must_follow(DateType::NextPayment, DateType::Start)?;
                    must_follow(DateType::NextPayment, DateType::TrialEnd)?;
                    must_follow(DateType::End, DateType::NextPayment)?;
                }
                DateType::End => {
                    must_follow(DateType::End, DateType::Start)?;
                    must_follow(DateType::End, DateType::TrialEnd)?;
                    must_follow(DateType::End, DateType::NextPayment)?;
                }
                DateType::LastPayment | DateType::Cancelled | DateType::PaymentRetry => {}
            }
        }

        let moves_next_payment = changes.iter().any(|(date_type, value)| {
            *date_type == DateType::NextPayment && *value != subscription.date(DateType::NextPayment)
        });
        if moves_next_payment
            && subscription.status() == SubscriptionStatus::Active
            && !self
                .state_machine
                .payment_method_supports(subscription, GatewayFeature::SubscriptionDateChanges)
        {
            return Err(BillingError::InvalidDate(format!(
                "The {} payment method does not support changing the next payment date.",
                subscription.payment_method()
            )));
        }

        Ok(())
    }

    /// Related order ids, loaded from the store on first use and cached on the record.
    pub fn related_order_ids(&self, subscription: &mut Subscription, kind: RelationKind) -> Result<Vec<OrderId>> {
        let ids = related::related_order_ids(self.repo.as_ref(), subscription, kind)?;
        subscription.related_mut().set(kind, ids.clone());
        Ok(ids)
    }

    pub fn last_order(&self, subscription: &Subscription) -> Result<Option<Order>> {
        Ok(related::last_order(self.repo.as_ref(), subscription)?)
    }

    pub fn create_renewal_order(&self, subscription: &mut Subscription) -> Result<Order> {
        self.renewals.create_renewal_order(subscription)
    }

    pub fn create_resubscribe_order(&self, subscription: &mut Subscription) -> Result<Order> {
        self.renewals.create_resubscribe_order(subscription)
    }

    /// Creates a parent order for the subscription and saves the link.
    pub fn create_parent_order(&self, subscription: &mut Subscription) -> Result<Order> {
        let order = self.renewals.create_parent_order(subscription)?;
        self.save(subscription)?;
        Ok(order)
    }

    /// Charges `order` through the subscription's gateway and applies the outcome.
    pub fn process_scheduled_payment(&self, subscription: &mut Subscription, mut order: Order) -> Result<()> {
        let gateway_id = if order.data.payment_method.is_empty() {
            subscription.payment_method().to_string()
        } else {
            order.data.payment_method.clone()
        };
        let Some(gateway) = self.gateways.get(&gateway_id) else {
            return Err(GatewayError::UnknownGateway(gateway_id).into());
        };

        subscription.push_event(SubscriptionEvent::ScheduledPaymentDispatched {
            subscription_id: subscription.id(),
            order_id: order.id,
            gateway_id: gateway_id.clone(),
            amount: amount_due(&order),
        });

        let outcome = match gateway.process_payment(&order) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Gateway {} failed for order #{}: {}", gateway_id, order.id, e);
                self.dispatch(subscription);
                return Err(e.into());
            }
        };

        match outcome {
            PaymentOutcome::Approved { transaction_id } => {
                let now = self.clock.now();
                order.mark_paid(now, Some(transaction_id));
                self.repo.save_order(&order)?;
                self.payment_complete(subscription, Some(&order))
            }
            PaymentOutcome::Declined { reason } => {
                log::warn!("Payment for order #{} declined: {}", order.id, reason);
                order.set_order_status(OrderStatus::Failed);
                self.repo.save_order(&order)?;
                self.add_order_note(order.id, &format!("Payment declined: {}", reason));

                self.payment_failed(subscription, SubscriptionStatus::OnHold)?;
                if subscription.status() != SubscriptionStatus::Cancelled {
                    let retry_at = self
                        .failed_payments
                        .retry_delay(subscription)
                        .map(|delay| self.clock.now() + delay);
                    subscription.set_date(DateType::PaymentRetry, retry_at);
                    self.save(subscription)?;
                }
                self.dispatch(subscription);
                Ok(())
            }
        }
    }

    /// Forwards queued events to the scheduler and then to listeners.
    pub fn dispatch(&self, subscription: &mut Subscription) {
        for event in subscription.take_events() {
            match &event {
                SubscriptionEvent::DateUpdated { date_type, .. } | SubscriptionEvent::DateDeleted { date_type, .. } => {
                    self.scheduler
                        .on_date_changed(subscription, *date_type, subscription.date(*date_type));
                }
                SubscriptionEvent::StatusUpdated {
                    new_status,
                    old_status,
                    ..
                } => {
                    self.scheduler.on_status_changed(subscription, *new_status, *old_status);
                }
                _ => {}
            }
            self.events.publish(&event);
        }
    }

    pub(crate) fn save(&self, subscription: &Subscription) -> Result<()> {
        self.repo
            .save_order(&subscription.to_order())
            .map_err(|source| BillingError::Persistence {
                id: subscription.id(),
                source,
            })
    }

    pub(crate) fn add_order_note(&self, order_id: OrderId, content: &str) {
        let note = OrderNote {
            content: content.to_string(),
            added_by_user: false,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.repo.add_note(order_id, note) {
            log::warn!("Could not add note to order #{}: {}", order_id, e);
        }
    }
}
