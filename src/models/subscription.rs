use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::error::StoreError;
use crate::models::common::{Address, BillingPeriod, CustomerId, OrderId};
use crate::models::event::SubscriptionEvent;
use crate::models::order::{LineItem, Order, OrderData, OrderType};

/// Storage format of schedule meta rows. Always UTC.
pub const META_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const META_BILLING_PERIOD: &str = "billing_period";
const META_BILLING_INTERVAL: &str = "billing_interval";
const META_TRIAL_DAYS: &str = "trial_days";
const META_MANUAL_RENEWAL: &str = "requires_manual_renewal";
const META_SUSPENSION_COUNT: &str = "suspension_count";
const META_COMPLETED_PAYMENTS: &str = "completed_payment_count";
const META_FAILED_PAYMENTS: &str = "failed_payment_count";
const META_END_PRE_CANCELLATION: &str = "end_date_pre_cancellation";
const META_TRIAL_END_PRE_CANCELLATION: &str = "trial_end_date_pre_cancellation";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Draft,
    AutoDraft,
    Pending,
    PendingPayment,
    Active,
    OnHold,
    PendingCancel,
    Cancelled,
    Expired,
    Switched,
    Trash,
    Deleted,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 12] = [
        SubscriptionStatus::Draft,
        SubscriptionStatus::AutoDraft,
        SubscriptionStatus::Pending,
        SubscriptionStatus::PendingPayment,
        SubscriptionStatus::Active,
        SubscriptionStatus::OnHold,
        SubscriptionStatus::PendingCancel,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Switched,
        SubscriptionStatus::Trash,
        SubscriptionStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Draft => "draft",
            SubscriptionStatus::AutoDraft => "auto_draft",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::PendingPayment => "pending_payment",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::OnHold => "on_hold",
            SubscriptionStatus::PendingCancel => "pending_cancel",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Switched => "switched",
            SubscriptionStatus::Trash => "trash",
            SubscriptionStatus::Deleted => "deleted",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == slug)
    }

    /// Human readable name used in notes and rejection messages.
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionStatus::Draft => "Draft",
            SubscriptionStatus::AutoDraft => "Auto draft",
            SubscriptionStatus::Pending => "Pending",
            SubscriptionStatus::PendingPayment => "Pending payment",
            SubscriptionStatus::Active => "Active",
            SubscriptionStatus::OnHold => "On hold",
            SubscriptionStatus::PendingCancel => "Pending Cancellation",
            SubscriptionStatus::Cancelled => "Cancelled",
            SubscriptionStatus::Expired => "Expired",
            SubscriptionStatus::Switched => "Switched",
            SubscriptionStatus::Trash => "Trash",
            SubscriptionStatus::Deleted => "Deleted",
        }
    }

    /// Statuses in which the subscription no longer renews.
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::PendingCancel
                | SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::Switched
                | SubscriptionStatus::Trash
        )
    }

    /// Statuses a subscription never leaves for a live status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::Switched
                | SubscriptionStatus::Trash
                | SubscriptionStatus::Deleted
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DateType {
    Start,
    TrialEnd,
    NextPayment,
    LastPayment,
    Cancelled,
    End,
    PaymentRetry,
}

impl DateType {
    pub const ALL: [DateType; 7] = [
        DateType::Start,
        DateType::TrialEnd,
        DateType::NextPayment,
        DateType::LastPayment,
        DateType::Cancelled,
        DateType::End,
        DateType::PaymentRetry,
    ];

    /// Dates that drive scheduled tasks.
    pub const TRACKED: [DateType; 4] = [
        DateType::NextPayment,
        DateType::PaymentRetry,
        DateType::TrialEnd,
        DateType::End,
    ];

    pub fn meta_key(&self) -> &'static str {
        match self {
            DateType::Start => "start_date",
            DateType::TrialEnd => "trial_end_date",
            DateType::NextPayment => "next_payment_date",
            DateType::LastPayment => "last_payment_date",
            DateType::Cancelled => "cancelled_date",
            DateType::End => "end_date",
            DateType::PaymentRetry => "payment_retry_date",
        }
    }
}

impl std::fmt::Display for DateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.meta_key())
    }
}

/// Backward relations from orders to the subscription that produced them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Renewal,
    Resubscribe,
    Switch,
}

impl RelationKind {
    /// Meta key placed on the related order, holding the subscription id.
    pub fn meta_key(&self) -> &'static str {
        match self {
            RelationKind::Renewal => "subscription_renewal",
            RelationKind::Resubscribe => "subscription_resubscribe",
            RelationKind::Switch => "subscription_switch",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelatedOrders {
    pub renewal: Option<Vec<OrderId>>,
    pub resubscribe: Option<Vec<OrderId>>,
    pub switch: Option<Vec<OrderId>>,
}

impl RelatedOrders {
    pub fn get(&self, kind: RelationKind) -> Option<&Vec<OrderId>> {
        match kind {
            RelationKind::Renewal => self.renewal.as_ref(),
            RelationKind::Resubscribe => self.resubscribe.as_ref(),
            RelationKind::Switch => self.switch.as_ref(),
        }
    }

    pub fn set(&mut self, kind: RelationKind, ids: Vec<OrderId>) {
        match kind {
            RelationKind::Renewal => self.renewal = Some(ids),
            RelationKind::Resubscribe => self.resubscribe = Some(ids),
            RelationKind::Switch => self.switch = Some(ids),
        }
    }

    /// Appends to an already loaded relation. Unloaded relations stay unloaded.
    pub fn push(&mut self, kind: RelationKind, id: OrderId) {
        let slot = match kind {
            RelationKind::Renewal => &mut self.renewal,
            RelationKind::Resubscribe => &mut self.resubscribe,
            RelationKind::Switch => &mut self.switch,
        };
        if let Some(ids) = slot {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScheduleDates {
    pub start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub next_payment: Option<DateTime<Utc>>,
    pub last_payment: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub payment_retry: Option<DateTime<Utc>>,
}

impl ScheduleDates {
    pub fn get(&self, date_type: DateType) -> Option<DateTime<Utc>> {
        match date_type {
            DateType::Start => self.start,
            DateType::TrialEnd => self.trial_end,
            DateType::NextPayment => self.next_payment,
            DateType::LastPayment => self.last_payment,
            DateType::Cancelled => self.cancelled,
            DateType::End => self.end,
            DateType::PaymentRetry => self.payment_retry,
        }
    }

    fn slot(&mut self, date_type: DateType) -> &mut Option<DateTime<Utc>> {
        match date_type {
            DateType::Start => &mut self.start,
            DateType::TrialEnd => &mut self.trial_end,
            DateType::NextPayment => &mut self.next_payment,
            DateType::LastPayment => &mut self.last_payment,
            DateType::Cancelled => &mut self.cancelled,
            DateType::End => &mut self.end,
            DateType::PaymentRetry => &mut self.payment_retry,
        }
    }
}

/// Dates captured when a cancellation is requested, restored if it is reverted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreCancellationDates {
    pub end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSubscription {
    pub customer_id: CustomerId,
    pub parent_order_id: Option<OrderId>,
    pub billing_period: BillingPeriod,

    #[validate(range(min = 1, message = "Billing interval must be at least 1"))]
    pub billing_interval: u32,

    pub trial_days: u32,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub requires_manual_renewal: bool,

    #[validate(length(equal = 3, message = "Currency must be an ISO 4217 code"))]
    pub currency: String,

    pub total: Decimal,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub billing: Address,
    #[serde(default)]
    pub shipping: Address,
}

/// Read-only view of a subscription, safe to hand to presentation code.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubscriptionSnapshot {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub parent_order_id: Option<OrderId>,
    pub status: SubscriptionStatus,
    pub payment_method: String,
    pub billing_period: BillingPeriod,
    pub billing_interval: u32,
    pub trial: bool,
    pub trial_days: u32,
    pub requires_manual_renewal: bool,
    pub suspension_count: u32,
    pub completed_payment_count: u32,
    pub failed_payment_count: u32,
    pub dates: ScheduleDates,
    pub total: Decimal,
    pub currency: String,
}

/// A recurring order with its own status lifecycle and schedule.
///
/// Fields are only reachable through the mutation API so that every date
/// change is normalised to whole UTC seconds and recorded as an event.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: OrderId,
    customer_id: CustomerId,
    parent_order_id: Option<OrderId>,
    status: SubscriptionStatus,
    billing_period: BillingPeriod,
    billing_interval: u32,
    trial_days: u32,
    requires_manual_renewal: bool,
    suspension_count: u32,
    completed_payment_count: u32,
    failed_payment_count: u32,
    dates: ScheduleDates,
    pre_cancellation: Option<PreCancellationDates>,
    related: RelatedOrders,
    data: OrderData,
    pending_events: Vec<SubscriptionEvent>,
}

impl Subscription {
    /// Builds an unsaved subscription (id 0) in `pending` status.
    pub fn new(request: NewSubscription, now: DateTime<Utc>) -> Self {
        let start = normalize(request.start_date.unwrap_or(now));
        let trial_end = if request.trial_days > 0 {
            Some(start + Duration::days(i64::from(request.trial_days)))
        } else {
            None
        };

        let mut data = OrderData::new(&request.currency, now);
        data.total = request.total;
        data.items = request.items;
        data.billing = request.billing;
        data.shipping = request.shipping;
        data.payment_method = request.payment_method.unwrap_or_default();
        data.created_via = "checkout".to_string();

        Self {
            id: 0,
            customer_id: request.customer_id,
            parent_order_id: request.parent_order_id,
            status: SubscriptionStatus::Pending,
            billing_period: request.billing_period,
            billing_interval: request.billing_interval,
            trial_days: request.trial_days,
            requires_manual_renewal: request.requires_manual_renewal,
            suspension_count: 0,
            completed_payment_count: 0,
            failed_payment_count: 0,
            dates: ScheduleDates {
                start: Some(start),
                trial_end,
                end: request.end_date.map(normalize),
                ..ScheduleDates::default()
            },
            pre_cancellation: None,
            related: RelatedOrders::default(),
            data,
            pending_events: Vec::new(),
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: OrderId) {
        self.id = id;
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn parent_order_id(&self) -> Option<OrderId> {
        self.parent_order_id
    }

    pub fn set_parent_order_id(&mut self, id: Option<OrderId>) {
        self.parent_order_id = id;
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
    }

    pub fn has_status(&self, statuses: &[SubscriptionStatus]) -> bool {
        statuses.contains(&self.status)
    }

    pub fn billing_period(&self) -> BillingPeriod {
        self.billing_period
    }

    pub fn billing_interval(&self) -> u32 {
        self.billing_interval
    }

    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    pub fn trial_days(&self) -> u32 {
        self.trial_days
    }

    pub fn payment_method(&self) -> &str {
        &self.data.payment_method
    }

    pub fn set_payment_method(&mut self, gateway_id: &str, title: &str) {
        self.data.payment_method = gateway_id.to_string();
        self.data.payment_method_title = title.to_string();
    }

    pub fn requires_manual_renewal(&self) -> bool {
        self.requires_manual_renewal
    }

    pub fn set_requires_manual_renewal(&mut self, manual: bool) {
        self.requires_manual_renewal = manual;
    }

    /// Renewals are paid by the customer when flagged manual or when no payment method is attached.
    pub fn is_manual(&self) -> bool {
        self.requires_manual_renewal || self.data.payment_method.is_empty()
    }

    pub fn total(&self) -> Decimal {
        self.data.total
    }

    pub fn data(&self) -> &OrderData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut OrderData {
        &mut self.data
    }

    pub fn suspension_count(&self) -> u32 {
        self.suspension_count
    }

    pub(crate) fn increment_suspension_count(&mut self) {
        self.suspension_count += 1;
    }

    pub(crate) fn reset_suspension_count(&mut self) {
        self.suspension_count = 0;
    }

    pub fn completed_payment_count(&self) -> u32 {
        self.completed_payment_count
    }

    pub(crate) fn record_completed_payment(&mut self) {
        self.completed_payment_count += 1;
        self.failed_payment_count = 0;
    }

    pub fn failed_payment_count(&self) -> u32 {
        self.failed_payment_count
    }

    pub(crate) fn record_failed_payment(&mut self) {
        self.failed_payment_count += 1;
    }

    pub fn dates(&self) -> &ScheduleDates {
        &self.dates
    }

    pub fn date(&self, date_type: DateType) -> Option<DateTime<Utc>> {
        self.dates.get(date_type)
    }

    /// Sets (or clears, with `None`) a schedule date. The epoch counts as "none".
    ///
    /// Emits `DateUpdated`/`DateDeleted` only when the stored value changes.
    pub fn set_date(&mut self, date_type: DateType, value: Option<DateTime<Utc>>) {
        let value = value.map(normalize).filter(|v| v.timestamp() > 0);
        let slot = self.dates.slot(date_type);
        if *slot == value {
            return;
        }
        *slot = value;

        let event = match value {
            Some(value) => SubscriptionEvent::DateUpdated {
                subscription_id: self.id,
                date_type,
                value,
            },
            None => SubscriptionEvent::DateDeleted {
                subscription_id: self.id,
                date_type,
            },
        };
        self.pending_events.push(event);
    }

    pub fn delete_date(&mut self, date_type: DateType) {
        self.set_date(date_type, None);
    }

    /// Sets a date from its stored string form (`YYYY-MM-DD HH:MM:SS` UTC or RFC 3339).
    /// Empty strings and `"0"` clear the date.
    pub fn set_date_str(&mut self, date_type: DateType, value: &str) -> Result<(), String> {
        let parsed = parse_date(value)?;
        self.set_date(date_type, parsed);
        Ok(())
    }

    pub fn pre_cancellation(&self) -> Option<&PreCancellationDates> {
        self.pre_cancellation.as_ref()
    }

    pub(crate) fn set_pre_cancellation(&mut self, dates: Option<PreCancellationDates>) {
        self.pre_cancellation = dates;
    }

    pub fn related(&self) -> &RelatedOrders {
        &self.related
    }

    pub(crate) fn related_mut(&mut self) -> &mut RelatedOrders {
        &mut self.related
    }

    pub(crate) fn push_event(&mut self, event: SubscriptionEvent) {
        self.pending_events.push(event);
    }

    pub fn pending_events(&self) -> &[SubscriptionEvent] {
        &self.pending_events
    }

    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: self.id,
            customer_id: self.customer_id,
            parent_order_id: self.parent_order_id,
            status: self.status,
            payment_method: self.data.payment_method.clone(),
            billing_period: self.billing_period,
            billing_interval: self.billing_interval,
            trial: self.has_trial(),
            trial_days: self.trial_days,
            requires_manual_renewal: self.requires_manual_renewal,
            suspension_count: self.suspension_count,
            completed_payment_count: self.completed_payment_count,
            failed_payment_count: self.failed_payment_count,
            dates: self.dates.clone(),
            total: self.data.total,
            currency: self.data.currency.clone(),
        }
    }

    /// Meta keys owned by the subscription itself, never copied onto generated orders.
    pub fn is_internal_meta_key(key: &str) -> bool {
        key.starts_with('_')
            || DateType::ALL.iter().any(|d| d.meta_key() == key)
            || [
                META_BILLING_PERIOD,
                META_BILLING_INTERVAL,
                META_TRIAL_DAYS,
                META_MANUAL_RENEWAL,
                META_SUSPENSION_COUNT,
                META_COMPLETED_PAYMENTS,
                META_FAILED_PAYMENTS,
                META_END_PRE_CANCELLATION,
                META_TRIAL_END_PRE_CANCELLATION,
            ]
            .contains(&key)
    }

    /// Flattens the subscription into an order row plus one meta entry per schedule field.
    pub fn to_order(&self) -> Order {
        let mut data = self.data.clone();
        let meta = &mut data.meta;

        for date_type in DateType::ALL {
            match self.dates.get(date_type) {
                Some(value) => {
                    meta.insert(date_type.meta_key().to_string(), format_date(value));
                }
                None => {
                    meta.remove(date_type.meta_key());
                }
            }
        }
        meta.insert(META_BILLING_PERIOD.to_string(), self.billing_period.to_string());
        meta.insert(META_BILLING_INTERVAL.to_string(), self.billing_interval.to_string());
        meta.insert(META_TRIAL_DAYS.to_string(), self.trial_days.to_string());
        meta.insert(META_MANUAL_RENEWAL.to_string(), self.requires_manual_renewal.to_string());
        meta.insert(META_SUSPENSION_COUNT.to_string(), self.suspension_count.to_string());
        meta.insert(META_COMPLETED_PAYMENTS.to_string(), self.completed_payment_count.to_string());
        meta.insert(META_FAILED_PAYMENTS.to_string(), self.failed_payment_count.to_string());

        meta.remove(META_END_PRE_CANCELLATION);
        meta.remove(META_TRIAL_END_PRE_CANCELLATION);
        if let Some(pre) = &self.pre_cancellation {
            if let Some(end) = pre.end {
                meta.insert(META_END_PRE_CANCELLATION.to_string(), format_date(end));
            }
            if let Some(trial_end) = pre.trial_end {
                meta.insert(META_TRIAL_END_PRE_CANCELLATION.to_string(), format_date(trial_end));
            }
        }

        Order {
            id: self.id,
            order_type: OrderType::Subscription,
            status: self.status.as_str().to_string(),
            parent_id: self.parent_order_id,
            customer_id: self.customer_id,
            data,
        }
    }

    /// Rebuilds a subscription from its order row. Fails on any other order type.
    pub fn from_order(order: Order) -> Result<Self, StoreError> {
        if order.order_type != OrderType::Subscription {
            return Err(StoreError::WrongType {
                id: order.id,
                expected: OrderType::Subscription.as_str(),
                found: order.order_type.as_str(),
            });
        }

        let id = order.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };
        let mut data = order.data;

        let status = SubscriptionStatus::from_slug(&order.status)
            .ok_or_else(|| corrupt(format!("unknown status \"{}\"", order.status)))?;

        let mut dates = ScheduleDates::default();
        for date_type in DateType::ALL {
            if let Some(raw) = data.meta.remove(date_type.meta_key()) {
                *dates.slot(date_type) = parse_date(&raw).map_err(corrupt)?;
            }
        }

        let billing_period = data
            .meta
            .remove(META_BILLING_PERIOD)
            .ok_or_else(|| corrupt("missing billing period".to_string()))?
            .parse::<BillingPeriod>()
            .map_err(corrupt)?;
        let billing_interval = take_number(&mut data.meta, META_BILLING_INTERVAL).map_err(corrupt)?.unwrap_or(1);
        let trial_days = take_number(&mut data.meta, META_TRIAL_DAYS).map_err(corrupt)?.unwrap_or(0);
        let suspension_count = take_number(&mut data.meta, META_SUSPENSION_COUNT).map_err(corrupt)?.unwrap_or(0);
        let completed_payment_count =
            take_number(&mut data.meta, META_COMPLETED_PAYMENTS).map_err(corrupt)?.unwrap_or(0);
        let failed_payment_count = take_number(&mut data.meta, META_FAILED_PAYMENTS).map_err(corrupt)?.unwrap_or(0);
        let requires_manual_renewal = data
            .meta
            .remove(META_MANUAL_RENEWAL)
            .map(|raw| raw == "true")
            .unwrap_or(false);

        let pre_end = data.meta.remove(META_END_PRE_CANCELLATION);
        let pre_trial_end = data.meta.remove(META_TRIAL_END_PRE_CANCELLATION);
        let pre_cancellation = if pre_end.is_some() || pre_trial_end.is_some() {
            Some(PreCancellationDates {
                end: pre_end.as_deref().map(parse_date).transpose().map_err(corrupt)?.flatten(),
                trial_end: pre_trial_end.as_deref().map(parse_date).transpose().map_err(corrupt)?.flatten(),
            })
        } else {
            None
        };

        Ok(Self {
            id,
            customer_id: order.customer_id,
            parent_order_id: order.parent_id,
            status,
            billing_period,
            billing_interval,
            trial_days,
            requires_manual_renewal,
            suspension_count,
            completed_payment_count,
            failed_payment_count,
            dates,
            pre_cancellation,
            related: RelatedOrders::default(),
            data,
            pending_events: Vec::new(),
        })
    }
}

fn take_number(meta: &mut BTreeMap<String, String>, key: &str) -> Result<Option<u32>, String> {
    meta.remove(key)
        .map(|raw| raw.parse::<u32>().map_err(|e| format!("{}: {}", key, e)))
        .transpose()
}

/// Truncates to whole seconds.
pub fn normalize(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}

pub fn format_date(value: DateTime<Utc>) -> String {
    value.format(META_DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(None);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, META_DATE_FORMAT) {
        return Ok(Some(Utc.from_utc_datetime(&naive)).filter(|v| v.timestamp() > 0));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| Some(normalize(parsed.with_timezone(&Utc))).filter(|v| v.timestamp() > 0))
        .map_err(|e| format!("invalid date \"{}\": {}", raw, e))
}
