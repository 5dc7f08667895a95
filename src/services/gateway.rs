use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::order::Order;

/// Capabilities a payment gateway may declare for subscriptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatewayFeature {
    SubscriptionSuspension,
    SubscriptionReactivation,
    SubscriptionCancellation,
    SubscriptionDateChanges,
    /// The gateway bills on its own schedule; no renewal orders are created for it.
    GatewayScheduledPayments,
}

impl GatewayFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayFeature::SubscriptionSuspension => "subscription_suspension",
            GatewayFeature::SubscriptionReactivation => "subscription_reactivation",
            GatewayFeature::SubscriptionCancellation => "subscription_cancellation",
            GatewayFeature::SubscriptionDateChanges => "subscription_date_changes",
            GatewayFeature::GatewayScheduledPayments => "gateway_scheduled_payments",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        [
            GatewayFeature::SubscriptionSuspension,
            GatewayFeature::SubscriptionReactivation,
            GatewayFeature::SubscriptionCancellation,
            GatewayFeature::SubscriptionDateChanges,
            GatewayFeature::GatewayScheduledPayments,
        ]
        .into_iter()
        .find(|feature| feature.as_str() == slug)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Approved { transaction_id: String },
    Declined { reason: String },
}

pub trait PaymentGateway: Send + Sync {
    fn id(&self) -> &str;

    fn title(&self) -> &str {
        self.id()
    }

    fn supports(&self, feature: GatewayFeature) -> bool;

    fn process_payment(&self, order: &Order) -> Result<PaymentOutcome, GatewayError>;
}

#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.id().to_string(), gateway);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(id).cloned()
    }

    pub fn supports(&self, id: &str, feature: GatewayFeature) -> bool {
        self.gateways.get(id).map_or(false, |gateway| gateway.supports(feature))
    }
}

/// Gateway that approves every charge without contacting anyone.
pub struct OfflineGateway {
    id: String,
    features: HashSet<GatewayFeature>,
}

impl OfflineGateway {
    pub fn new(id: &str, features: impl IntoIterator<Item = GatewayFeature>) -> Self {
        Self {
            id: id.to_string(),
            features: features.into_iter().collect(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.id, config.features.iter().copied())
    }
}

impl PaymentGateway for OfflineGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, feature: GatewayFeature) -> bool {
        self.features.contains(&feature)
    }

    fn process_payment(&self, order: &Order) -> Result<PaymentOutcome, GatewayError> {
        log::info!("Offline gateway approving order #{} for {}", order.id, order.data.total);
        Ok(PaymentOutcome::Approved {
            transaction_id: format!("OFFLINE_{}", Uuid::new_v4().simple()),
        })
    }
}

/// Amount a gateway is asked to collect for an order.
pub fn amount_due(order: &Order) -> Decimal {
    order.data.total.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::order::OrderData;
    use chrono::Utc;

    #[test]
    fn test_feature_slugs() {
        assert_eq!(
            GatewayFeature::from_slug("gateway_scheduled_payments"),
            Some(GatewayFeature::GatewayScheduledPayments)
        );
        assert_eq!(GatewayFeature::from_slug("refunds"), None);
    }

    #[test]
    fn test_registry_supports() {
        let mut registry = GatewayRegistry::new();
        registry.register(Arc::new(OfflineGateway::new("offline", [GatewayFeature::SubscriptionSuspension])));

        assert!(registry.supports("offline", GatewayFeature::SubscriptionSuspension));
        assert!(!registry.supports("offline", GatewayFeature::SubscriptionReactivation));
        assert!(!registry.supports("stripe", GatewayFeature::SubscriptionSuspension));
    }

    #[test]
    fn test_offline_gateway_approves() {
        let gateway = OfflineGateway::new("offline", []);
        let order = Order::new(1, OrderData::new("USD", Utc::now()));
        assert!(matches!(
            gateway.process_payment(&order).unwrap(),
            PaymentOutcome::Approved { .. }
        ));
    }
}
