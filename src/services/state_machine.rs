//! Subscription status lifecycle.
//!
//! Every status change goes through [`StateMachine::update_status`]: it checks the
//! transition table, applies the per-status date and counter side effects, persists
//! the record and queues a `StatusUpdated` event. The record keeps the events until
//! the caller drains them, so the scheduler always reconciles against saved values.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{BillingError, Result};
use crate::models::event::SubscriptionEvent;
use crate::models::order::OrderNote;
use crate::models::subscription::{DateType, PreCancellationDates, Subscription, SubscriptionStatus};
use crate::services::database::OrderRepository;
use crate::services::dates::DateCalculator;
use crate::services::gateway::{GatewayFeature, GatewayRegistry};
use crate::services::policy::{DenyUnlisted, EligibilityPolicy};
use crate::services::related;
use crate::utils::clock::Clock;

pub struct StateMachine {
    repo: Arc<dyn OrderRepository>,
    gateways: Arc<GatewayRegistry>,
    eligibility: Arc<dyn EligibilityPolicy>,
    dates: DateCalculator,
    clock: Arc<dyn Clock>,
}

impl StateMachine {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        gateways: Arc<GatewayRegistry>,
        dates: DateCalculator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            gateways,
            eligibility: Arc::new(DenyUnlisted),
            dates,
            clock,
        }
    }

    pub fn with_eligibility_policy(mut self, policy: Arc<dyn EligibilityPolicy>) -> Self {
        self.eligibility = policy;
        self
    }

    pub fn date_calculator(&self) -> &DateCalculator {
        &self.dates
    }

    /// Manual subscriptions support every feature; otherwise the gateway decides.
    pub fn payment_method_supports(&self, subscription: &Subscription, feature: GatewayFeature) -> bool {
        subscription.is_manual() || self.gateways.supports(subscription.payment_method(), feature)
    }

    /// Whether the most recent parent or renewal order is still waiting for payment.
    ///
    /// A lookup failure counts as "payment due" so that nothing is finalised on a guess.
    pub fn needs_payment(&self, subscription: &Subscription) -> bool {
        match related::last_order(self.repo.as_ref(), subscription) {
            Ok(order) => order.map_or(false, |order| order.needs_payment()),
            Err(e) => {
                log::warn!(
                    "Could not load last order of subscription #{}: {}",
                    subscription.id(),
                    e
                );
                true
            }
        }
    }

    pub fn can_transition(&self, subscription: &Subscription, target: SubscriptionStatus) -> bool {
        self.allowed_by_table(subscription, target) || self.eligibility.allow_transition(subscription, target)
    }

    fn allowed_by_table(&self, subscription: &Subscription, target: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        let from = subscription.status();
        let supports = |feature| self.payment_method_supports(subscription, feature);

        match target {
            Pending => matches!(from, AutoDraft | Draft),
            Active => match from {
                Pending => true,
                OnHold => supports(GatewayFeature::SubscriptionReactivation),
                PendingCancel => {
                    let end_in_future = subscription
                        .date(DateType::End)
                        .map_or(false, |end| end > self.clock.now());
                    let can_resume_billing = subscription.requires_manual_renewal()
                        || subscription.is_manual()
                        || (!supports(GatewayFeature::GatewayScheduledPayments)
                            && supports(GatewayFeature::SubscriptionDateChanges)
                            && supports(GatewayFeature::SubscriptionReactivation));
                    end_in_future && can_resume_billing
                }
                _ => false,
            },
            OnHold => matches!(from, Active | Pending) && supports(GatewayFeature::SubscriptionSuspension),
            Cancelled => {
                from == PendingCancel || (!from.is_terminal() && supports(GatewayFeature::SubscriptionCancellation))
            }
            PendingCancel => match from {
                Active => true,
                Cancelled | OnHold => !self.needs_payment(subscription),
                _ => false,
            },
            Expired => !matches!(from, Cancelled | Trash | Switched),
            Trash => from.is_ended() || self.allowed_by_table(subscription, Cancelled),
            Deleted => from == Trash,
            Draft | AutoDraft | PendingPayment | Switched => false,
        }
    }

    /// Moves the subscription to `target`, applying side effects and persisting it.
    ///
    /// A rejected or unsaved transition leaves the record as it was, apart from the
    /// `UnableToUpdateStatus` event queued on rejection.
    pub fn update_status(
        &self,
        subscription: &mut Subscription,
        target: SubscriptionStatus,
        note: &str,
        manual: bool,
    ) -> Result<()> {
        let old_status = subscription.status();
        if target == old_status {
            return Ok(());
        }

        if !self.can_transition(subscription, target) {
            let error = BillingError::InvalidTransition {
                from: old_status,
                to: target,
            };
            log::warn!("Subscription #{}: {}", subscription.id(), error);
            self.add_note(subscription, &error.to_string(), manual);
            subscription.push_event(SubscriptionEvent::UnableToUpdateStatus {
                subscription_id: subscription.id(),
                from: old_status,
                to: target,
            });
            return Err(error);
        }

        let previous = subscription.clone();
        let now = self.clock.now();
        self.apply_side_effects(subscription, old_status, target, now);
        subscription.set_status(target);

        if let Err(source) = self.repo.save_order(&subscription.to_order()) {
            *subscription = previous;
            log::error!(
                "Failed to save subscription #{} after changing status to {}: {}",
                subscription.id(),
                target,
                source
            );
            self.add_note(
                subscription,
                &format!(
                    "Unable to change subscription status to \"{}\". {}",
                    target.label(),
                    source
                ),
                manual,
            );
            return Err(BillingError::Persistence {
                id: subscription.id(),
                source,
            });
        }

        subscription.push_event(SubscriptionEvent::StatusUpdated {
            subscription_id: subscription.id(),
            new_status: target,
            old_status,
        });
        let message = format!("Status changed from {} to {}.", old_status.label(), target.label());
        self.add_note(subscription, format!("{} {}", note, message).trim(), manual);
        log::info!("Subscription #{} changed from {} to {}", subscription.id(), old_status, target);

        Ok(())
    }

    fn apply_side_effects(
        &self,
        subscription: &mut Subscription,
        from: SubscriptionStatus,
        target: SubscriptionStatus,
        now: DateTime<Utc>,
    ) {
        match target {
            SubscriptionStatus::PendingCancel => {
                let end_of_prepaid_term = self.dates.calculate_end_of_prepaid_term_date(subscription, now);
                subscription.set_pre_cancellation(Some(PreCancellationDates {
                    end: subscription.date(DateType::End),
                    trial_end: subscription.date(DateType::TrialEnd),
                }));

                subscription.set_date(DateType::Cancelled, Some(now));
                match end_of_prepaid_term.filter(|end| *end > now) {
                    Some(end) => subscription.set_date(DateType::End, Some(end)),
                    None => subscription.set_date(DateType::End, Some(now)),
                }
                subscription.delete_date(DateType::TrialEnd);
                subscription.delete_date(DateType::NextPayment);
            }
            SubscriptionStatus::Active if from == SubscriptionStatus::PendingCancel => {
                // The prepaid term end becomes the next renewal.
                let end_of_prepaid_term = subscription.date(DateType::End);
                let restored = subscription.pre_cancellation().cloned().unwrap_or_default();

                subscription.set_date(DateType::End, restored.end);
                subscription.set_date(DateType::TrialEnd, restored.trial_end);
                subscription.delete_date(DateType::Cancelled);
                subscription.set_date(DateType::NextPayment, end_of_prepaid_term);
                subscription.set_pre_cancellation(None);
            }
            SubscriptionStatus::Active => {
                let stored = subscription.date(DateType::NextPayment);
                let threshold = now + self.dates.policy().activation_threshold;
                if stored.map_or(true, |next_payment| next_payment < threshold) {
                    match self.dates.calculate_next_payment_date(subscription, now) {
                        Some(next_payment) => subscription.set_date(DateType::NextPayment, Some(next_payment)),
                        None if stored.map_or(false, |next_payment| next_payment < now) => {
                            subscription.delete_date(DateType::NextPayment)
                        }
                        None => {}
                    }
                }
            }
            SubscriptionStatus::OnHold => subscription.increment_suspension_count(),
            SubscriptionStatus::Cancelled | SubscriptionStatus::Switched | SubscriptionStatus::Expired => {
                subscription.delete_date(DateType::TrialEnd);
                subscription.delete_date(DateType::NextPayment);
                if subscription.date(DateType::End).is_none() {
                    subscription.set_date(DateType::End, Some(now));
                }
                if target == SubscriptionStatus::Cancelled && subscription.date(DateType::Cancelled).is_none() {
                    subscription.set_date(DateType::Cancelled, subscription.date(DateType::End));
                }
            }
            _ => {}
        }
    }

    fn add_note(&self, subscription: &Subscription, content: &str, added_by_user: bool) {
        let note = OrderNote {
            content: content.to_string(),
            added_by_user,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.repo.add_note(subscription.id(), note) {
            log::warn!("Could not add note to subscription #{}: {}", subscription.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::models::common::BillingPeriod;
    use crate::models::order::{Order, OrderData};
    use crate::services::database::InMemoryStore;
    use crate::testing::{new_subscription, request, utc, Harness};
    use SubscriptionStatus::*;

    fn expected(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
        match to {
            Pending => matches!(from, AutoDraft | Draft),
            // The end date is unset, so pending_cancel cannot be reverted.
            Active => matches!(from, Pending | OnHold),
            OnHold => matches!(from, Active | Pending),
            Cancelled => !matches!(from, Cancelled | Expired | Switched | Trash | Deleted) || from == PendingCancel,
            PendingCancel => matches!(from, Active | Cancelled | OnHold),
            Expired => !matches!(from, Cancelled | Trash | Switched),
            Trash => {
                matches!(from, PendingCancel | Cancelled | Expired | Switched | Trash)
                    || !matches!(from, Cancelled | Expired | Switched | Trash | Deleted)
            }
            Deleted => from == Trash,
            Draft | AutoDraft | PendingPayment | Switched => false,
        }
    }

    #[test]
    fn test_transition_table() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let machine = harness.service.state_machine();
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));

        for suspensions in [0, 3] {
            for _ in 0..suspensions {
                subscription.increment_suspension_count();
            }
            for from in SubscriptionStatus::ALL {
                subscription.set_status(from);
                for to in SubscriptionStatus::ALL {
                    assert_eq!(
                        machine.can_transition(&subscription, to),
                        expected(from, to),
                        "{} -> {} with {} suspensions",
                        from,
                        to,
                        suspensions
                    );
                }
            }
        }
    }

    #[test]
    fn test_gateway_features_gate_transitions() {
        let harness = Harness::with_gateway_features(utc(2024, 1, 10, 0, 0, 0), &[]);
        let machine = harness.service.state_machine();
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));

        subscription.set_status(Active);
        assert!(!machine.can_transition(&subscription, OnHold));
        assert!(!machine.can_transition(&subscription, Cancelled));
        assert!(machine.can_transition(&subscription, PendingCancel));

        subscription.set_status(OnHold);
        assert!(!machine.can_transition(&subscription, Active));

        // Without a payment method the customer pays by hand and anything goes.
        subscription.set_payment_method("", "");
        assert!(machine.can_transition(&subscription, Active));
        subscription.set_status(Active);
        assert!(machine.can_transition(&subscription, Cancelled));
    }

    #[test]
    fn test_pending_cancel_reversal_needs_future_end() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let machine = harness.service.state_machine();
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));
        subscription.set_status(PendingCancel);

        subscription.set_date(DateType::End, Some(now + Duration::days(3)));
        assert!(machine.can_transition(&subscription, Active));

        subscription.set_date(DateType::End, Some(now - Duration::days(3)));
        assert!(!machine.can_transition(&subscription, Active));
    }

    #[test]
    fn test_pending_cancel_blocked_while_payment_due() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let machine = harness.service.state_machine();
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));
        subscription.set_status(OnHold);
        assert!(machine.can_transition(&subscription, PendingCancel));

        let mut parent = Order::new(1, OrderData::new("USD", utc(2024, 1, 1, 0, 0, 0)));
        parent.data.total = rust_decimal::Decimal::new(999, 2);
        let parent = harness.store.insert_order(parent).unwrap();
        subscription.set_parent_order_id(Some(parent.id));

        assert!(machine.needs_payment(&subscription));
        assert!(!machine.can_transition(&subscription, PendingCancel));
    }

    #[test]
    fn test_eligibility_policy_extends_table() {
        struct AllowPendingPayment;
        impl EligibilityPolicy for AllowPendingPayment {
            fn allow_transition(&self, _subscription: &Subscription, target: SubscriptionStatus) -> bool {
                target == PendingPayment
            }
        }

        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let machine = StateMachine::new(
            Arc::new(harness.store.clone()),
            Arc::new(GatewayRegistry::new()),
            DateCalculator::default(),
            harness.clock.clone(),
        )
        .with_eligibility_policy(Arc::new(AllowPendingPayment));
        let subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));

        assert!(machine.can_transition(&subscription, PendingPayment));
        assert!(!machine.can_transition(&subscription, Switched));
    }

    #[test]
    fn test_same_status_is_a_no_op() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let mut subscription = harness.active_monthly();
        harness.store.fail_next_saves(1);

        harness
            .service
            .state_machine()
            .update_status(&mut subscription, Active, "", false)
            .unwrap();

        // The injected failure was not consumed: nothing was written.
        assert!(harness.store.save_order(&subscription.to_order()).is_err());
        assert!(subscription.pending_events().is_empty());
    }

    #[test]
    fn test_rejection_records_note_and_event() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));

        let err = harness
            .service
            .state_machine()
            .update_status(&mut subscription, Deleted, "", true)
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidTransition { from: Pending, to: Deleted }));
        assert_eq!(subscription.status(), Pending);
        assert!(matches!(
            subscription.pending_events(),
            [SubscriptionEvent::UnableToUpdateStatus { from: Pending, to: Deleted, .. }]
        ));
        let notes = harness.store.notes(subscription.id()).unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].added_by_user);
        assert!(notes[0].content.contains("\"Pending\" to \"Deleted\""));
    }

    #[test]
    fn test_persistence_failure_rolls_back() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.active_monthly();
        let before = subscription.snapshot();
        harness.store.fail_next_saves(1);

        let err = harness
            .service
            .state_machine()
            .update_status(&mut subscription, PendingCancel, "", false)
            .unwrap_err();

        assert!(matches!(err, BillingError::Persistence { .. }));
        assert_eq!(subscription.snapshot(), before);
        assert!(subscription.pre_cancellation().is_none());
        assert_eq!(harness.reload(subscription.id()).status(), Active);
    }

    #[test]
    fn test_pending_cancel_keeps_prepaid_term() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.active_monthly();
        let next_payment = now + Duration::days(10);
        subscription.set_date(DateType::NextPayment, Some(next_payment));

        harness
            .service
            .state_machine()
            .update_status(&mut subscription, PendingCancel, "", false)
            .unwrap();

        assert_eq!(subscription.date(DateType::End), Some(next_payment));
        assert_eq!(subscription.date(DateType::Cancelled), Some(now));
        assert_eq!(subscription.date(DateType::NextPayment), None);
        assert_eq!(subscription.date(DateType::TrialEnd), None);

        let saved = harness.reload(subscription.id());
        assert_eq!(saved.status(), PendingCancel);
        assert_eq!(saved.date(DateType::End), Some(next_payment));
    }

    #[test]
    fn test_pending_cancel_without_dates_ends_now() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.active_monthly();
        subscription.delete_date(DateType::NextPayment);

        harness
            .service
            .state_machine()
            .update_status(&mut subscription, PendingCancel, "", false)
            .unwrap();

        assert_eq!(subscription.date(DateType::End), Some(now));
        assert_eq!(subscription.date(DateType::Cancelled), Some(now));
    }

    #[test]
    fn test_reactivation_restores_pre_cancellation_dates() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let machine = harness.service.state_machine();
        let mut subscription = harness.active_monthly();
        let original_end = utc(2025, 1, 1, 0, 0, 0);
        subscription.set_date(DateType::End, Some(original_end));
        let next_payment = subscription.date(DateType::NextPayment).unwrap();

        machine.update_status(&mut subscription, PendingCancel, "", true).unwrap();
        assert_eq!(subscription.date(DateType::End), Some(next_payment));

        machine.update_status(&mut subscription, Active, "", true).unwrap();
        assert_eq!(subscription.date(DateType::End), Some(original_end));
        assert_eq!(subscription.date(DateType::NextPayment), Some(next_payment));
        assert_eq!(subscription.date(DateType::Cancelled), None);
        assert!(subscription.pre_cancellation().is_none());
    }

    #[test]
    fn test_activation_recalculates_stale_next_payment() {
        let now = utc(2024, 3, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));
        subscription.set_date(DateType::NextPayment, Some(now + Duration::hours(1)));

        harness
            .service
            .state_machine()
            .update_status(&mut subscription, Active, "", false)
            .unwrap();

        // The stored date is kept as the anchor so a synchronised renewal day survives.
        assert_eq!(subscription.date(DateType::NextPayment), Some(utc(2024, 4, 10, 1, 0, 0)));
    }

    #[test]
    fn test_activation_keeps_future_next_payment() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0)));
        let synced = utc(2024, 1, 20, 0, 0, 0);
        subscription.set_date(DateType::NextPayment, Some(synced));

        harness
            .service
            .state_machine()
            .update_status(&mut subscription, Active, "", false)
            .unwrap();

        assert_eq!(subscription.date(DateType::NextPayment), Some(synced));
    }

    #[test]
    fn test_on_hold_counts_suspensions() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let machine = harness.service.state_machine();
        let mut subscription = harness.active_monthly();

        machine.update_status(&mut subscription, OnHold, "", false).unwrap();
        machine.update_status(&mut subscription, Active, "", false).unwrap();
        machine.update_status(&mut subscription, OnHold, "", false).unwrap();

        assert_eq!(subscription.suspension_count(), 2);
    }

    #[test]
    fn test_cancel_directly_from_active() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let mut subscription = harness.create(request(1, BillingPeriod::Month, 14, utc(2024, 1, 1, 0, 0, 0)));
        let machine = harness.service.state_machine();
        machine.update_status(&mut subscription, Active, "", false).unwrap();
        assert!(subscription.date(DateType::TrialEnd).is_some());
        assert!(subscription.date(DateType::NextPayment).is_some());

        machine.update_status(&mut subscription, Cancelled, "", true).unwrap();

        assert_eq!(subscription.date(DateType::TrialEnd), None);
        assert_eq!(subscription.date(DateType::NextPayment), None);
        assert_eq!(subscription.date(DateType::End), Some(now));
        assert_eq!(subscription.date(DateType::Cancelled), Some(now));
    }

    #[test]
    fn test_cancelled_date_is_not_overwritten() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let machine = harness.service.state_machine();
        let mut subscription = harness.active_monthly();

        machine.update_status(&mut subscription, PendingCancel, "", true).unwrap();
        let end = subscription.date(DateType::End);

        harness.clock.advance(Duration::days(40));
        machine.update_status(&mut subscription, Cancelled, "", false).unwrap();

        assert_eq!(subscription.date(DateType::Cancelled), Some(now));
        assert_eq!(subscription.date(DateType::End), end);
    }

    #[test]
    fn test_expired_keeps_existing_end() {
        let now = utc(2024, 1, 10, 0, 0, 0);
        let harness = Harness::new(now);
        let machine = harness.service.state_machine();
        let mut subscription = harness.active_monthly();
        let end = utc(2024, 1, 9, 0, 0, 0);
        subscription.set_date(DateType::End, Some(end));

        machine.update_status(&mut subscription, Expired, "", false).unwrap();

        assert_eq!(subscription.date(DateType::End), Some(end));
        assert_eq!(subscription.date(DateType::Cancelled), None);
    }

    #[test]
    fn test_unknown_gateway_supports_nothing() {
        let harness = Harness::new(utc(2024, 1, 10, 0, 0, 0));
        let machine = StateMachine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(GatewayRegistry::new()),
            DateCalculator::default(),
            harness.clock.clone(),
        );
        let subscription = new_subscription(1, BillingPeriod::Month, 0, utc(2024, 1, 1, 0, 0, 0));

        assert!(!machine.needs_payment(&subscription));
        assert!(!machine.payment_method_supports(&subscription, GatewayFeature::SubscriptionCancellation));
    }
}
