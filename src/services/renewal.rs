use std::sync::Arc;

use crate::error::{BillingError, Result};
use crate::models::order::{Order, OrderData, OrderKind, OrderStatus};
use crate::models::subscription::{RelationKind, Subscription};
use crate::services::database::OrderRepository;
use crate::utils::clock::Clock;

/// Meta key tagging every order generated from a subscription.
pub const META_SUBSCRIPTION_ID: &str = "subscription_id";

/// Builds orders that mirror a subscription's totals, addresses and line items.
pub struct RenewalOrderFactory {
    repo: Arc<dyn OrderRepository>,
    clock: Arc<dyn Clock>,
}

impl RenewalOrderFactory {
    pub fn new(repo: Arc<dyn OrderRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Creates and stores the order inside its own transaction.
    pub fn create_order_from_subscription(&self, subscription: &Subscription, kind: OrderKind) -> Result<Order> {
        let creation_error = |reason: String| BillingError::OrderCreation { kind, reason };

        let tx = self
            .repo
            .begin_transaction()
            .map_err(|e| creation_error(e.to_string()))?;

        let order = self.build_order(subscription, kind);
        let stored = self.repo.insert_order_in(tx, order).and_then(|order| {
            self.repo.commit(tx)?;
            Ok(order)
        });

        match stored {
            Ok(order) => {
                log::info!(
                    "Created {} order #{} from subscription #{}",
                    kind,
                    order.id,
                    subscription.id()
                );
                Ok(order)
            }
            Err(e) => {
                if let Err(rollback_error) = self.repo.rollback(tx) {
                    log::error!("Rollback after failed {} order failed: {}", kind, rollback_error);
                }
                log::error!(
                    "Failed to create {} order for subscription #{}: {}",
                    kind,
                    subscription.id(),
                    e
                );
                Err(creation_error(e.to_string()))
            }
        }
    }

    pub fn create_renewal_order(&self, subscription: &mut Subscription) -> Result<Order> {
        let order = self.create_order_from_subscription(subscription, OrderKind::Renewal)?;
        subscription.related_mut().push(RelationKind::Renewal, order.id);
        Ok(order)
    }

    pub fn create_resubscribe_order(&self, subscription: &mut Subscription) -> Result<Order> {
        let order = self.create_order_from_subscription(subscription, OrderKind::Resubscribe)?;
        subscription.related_mut().push(RelationKind::Resubscribe, order.id);
        Ok(order)
    }

    /// Creates the order the subscription is billed under and links it as its parent.
    /// The caller persists the subscription.
    pub fn create_parent_order(&self, subscription: &mut Subscription) -> Result<Order> {
        let order = self.create_order_from_subscription(subscription, OrderKind::Parent)?;
        subscription.set_parent_order_id(Some(order.id));
        Ok(order)
    }

    fn build_order(&self, subscription: &Subscription, kind: OrderKind) -> Order {
        let source = subscription.data();
        let mut data = OrderData::new(&source.currency, self.clock.now());
        data.prices_include_tax = source.prices_include_tax;
        data.discount_total = source.discount_total;
        data.discount_tax = source.discount_tax;
        data.shipping_total = source.shipping_total;
        data.shipping_tax = source.shipping_tax;
        data.cart_tax = source.cart_tax;
        data.total = source.total;
        data.billing = source.billing.clone();
        data.shipping = source.shipping.clone();
        data.items = source.items.clone();
        data.created_via = "subscription".to_string();
        data.meta = source
            .meta
            .iter()
            .filter(|(key, _)| !Subscription::is_internal_meta_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut order = Order::new(subscription.customer_id(), data);
        order.set_order_status(OrderStatus::Pending);

        let relation = match kind {
            OrderKind::Renewal => Some(RelationKind::Renewal),
            OrderKind::Resubscribe => Some(RelationKind::Resubscribe),
            OrderKind::Parent => None,
        };
        if let Some(relation) = relation {
            order.add_meta(META_SUBSCRIPTION_ID, subscription.id().to_string());
            order.add_meta(relation.meta_key(), subscription.id().to_string());
        }
        order
    }
}
