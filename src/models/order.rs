use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::common::{Address, CustomerId, OrderId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    ShopOrder,
    Subscription,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::ShopOrder => "shop_order",
            OrderType::Subscription => "subscription",
        }
    }
}

/// Statuses of a generic (non-subscription) order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::OnHold => "on_hold",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "on_hold" => Some(OrderStatus::OnHold),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Processing | OrderStatus::Completed)
    }
}

/// Why an order was generated from a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Renewal,
    Resubscribe,
    Parent,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Renewal => write!(f, "renewal"),
            OrderKind::Resubscribe => write!(f, "resubscribe"),
            OrderKind::Parent => write!(f, "parent"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Product,
    Fee,
    Shipping,
    Tax,
    Coupon,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub kind: LineItemKind,
    pub name: String,
    pub product_id: Option<u64>,
    pub quantity: u32,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub tax: Decimal,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl LineItem {
    pub fn product(name: &str, product_id: u64, quantity: u32, total: Decimal) -> Self {
        Self {
            kind: LineItemKind::Product,
            name: name.to_string(),
            product_id: Some(product_id),
            quantity,
            subtotal: total,
            total,
            tax: Decimal::ZERO,
            meta: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderNote {
    pub content: String,
    /// True when the change behind the note was requested by a customer or admin.
    pub added_by_user: bool,
    pub created_at: DateTime<Utc>,
}

/// Billing data shared by shop orders and subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderData {
    pub currency: String,
    pub prices_include_tax: bool,
    pub discount_total: Decimal,
    pub discount_tax: Decimal,
    pub shipping_total: Decimal,
    pub shipping_tax: Decimal,
    pub cart_tax: Decimal,
    pub total: Decimal,
    pub billing: Address,
    pub shipping: Address,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    pub payment_method: String,
    pub payment_method_title: String,
    pub created_via: String,
    pub date_created: DateTime<Utc>,
    pub date_paid: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
}

impl OrderData {
    pub fn new(currency: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            currency: currency.to_string(),
            prices_include_tax: false,
            discount_total: Decimal::ZERO,
            discount_tax: Decimal::ZERO,
            shipping_total: Decimal::ZERO,
            shipping_tax: Decimal::ZERO,
            cart_tax: Decimal::ZERO,
            total: Decimal::ZERO,
            billing: Address::default(),
            shipping: Address::default(),
            items: Vec::new(),
            meta: BTreeMap::new(),
            payment_method: String::new(),
            payment_method_title: String::new(),
            created_via: String::new(),
            date_created: created_at,
            date_paid: None,
            transaction_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub order_type: OrderType,
    /// Raw status slug; interpret with [`Order::order_status`] for shop orders.
    pub status: String,
    pub parent_id: Option<OrderId>,
    pub customer_id: CustomerId,
    pub data: OrderData,
}

impl Order {
    pub fn new(customer_id: CustomerId, data: OrderData) -> Self {
        Self {
            id: 0,
            order_type: OrderType::ShopOrder,
            status: OrderStatus::Pending.as_str().to_string(),
            parent_id: None,
            customer_id,
            data,
        }
    }

    pub fn order_status(&self) -> Option<OrderStatus> {
        OrderStatus::from_slug(&self.status)
    }

    pub fn set_order_status(&mut self, status: OrderStatus) {
        self.status = status.as_str().to_string();
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.data.meta.get(key).map(String::as_str)
    }

    pub fn add_meta(&mut self, key: &str, value: impl Into<String>) {
        self.data.meta.insert(key.to_string(), value.into());
    }

    pub fn add_item(&mut self, item: LineItem) {
        self.data.items.push(item);
    }

    /// An order needs payment while it is pending or failed and has something to charge.
    pub fn needs_payment(&self) -> bool {
        matches!(self.order_status(), Some(OrderStatus::Pending | OrderStatus::Failed))
            && self.data.total > Decimal::ZERO
    }

    pub fn mark_paid(&mut self, paid_at: DateTime<Utc>, transaction_id: Option<String>) {
        self.set_order_status(OrderStatus::Processing);
        self.data.date_paid = Some(paid_at);
        if transaction_id.is_some() {
            self.data.transaction_id = transaction_id;
        }
    }
}
