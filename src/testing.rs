//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::BillingConfig;
use crate::error::GatewayError;
use crate::models::common::{Address, BillingPeriod, OrderId};
use crate::models::event::SubscriptionEvent;
use crate::models::order::{LineItem, Order};
use crate::models::subscription::{NewSubscription, Subscription};
use crate::services::database::InMemoryStore;
use crate::services::events::{EventBus, EventListener};
use crate::services::gateway::{GatewayFeature, GatewayRegistry, PaymentGateway, PaymentOutcome};
use crate::services::subscription::SubscriptionService;
use crate::services::task_queue::InMemoryTaskQueue;
use crate::utils::clock::{Clock, FixedClock};

pub const CARD: &str = "card";

pub const STANDARD_FEATURES: [GatewayFeature; 4] = [
    GatewayFeature::SubscriptionSuspension,
    GatewayFeature::SubscriptionReactivation,
    GatewayFeature::SubscriptionCancellation,
    GatewayFeature::SubscriptionDateChanges,
];

pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .expect("valid test date")
}

/// A card-paid request for 15.00 per period.
pub fn request(interval: u32, period: BillingPeriod, trial_days: u32, start: DateTime<Utc>) -> NewSubscription {
    NewSubscription {
        customer_id: 1,
        parent_order_id: None,
        billing_period: period,
        billing_interval: interval,
        trial_days,
        start_date: Some(start),
        end_date: None,
        payment_method: Some(CARD.to_string()),
        requires_manual_renewal: false,
        currency: "USD".to_string(),
        total: Decimal::new(1500, 2),
        items: vec![LineItem::product("Coffee box", 10, 1, Decimal::new(1500, 2))],
        billing: Address::default(),
        shipping: Address::default(),
    }
}

/// An unsaved subscription created at `start`.
pub fn new_subscription(interval: u32, period: BillingPeriod, trial_days: u32, start: DateTime<Utc>) -> Subscription {
    Subscription::new(request(interval, period, trial_days, start), start)
}

/// Keeps every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<SubscriptionEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SubscriptionEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(SubscriptionEvent::name).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventListener for EventRecorder {
    fn handle(&self, event: &SubscriptionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Gateway that replays queued outcomes and approves once they run out.
pub struct ScriptedGateway {
    id: String,
    features: Vec<GatewayFeature>,
    outcomes: Mutex<VecDeque<PaymentOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(id: &str, features: &[GatewayFeature]) -> Self {
        Self {
            id: id.to_string(),
            features: features.to_vec(),
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_outcome(&self, outcome: PaymentOutcome) {
        self.outcomes.lock().expect("outcomes lock").push_back(outcome);
    }

    pub fn decline_next(&self, reason: &str) {
        self.push_outcome(PaymentOutcome::Declined {
            reason: reason.to_string(),
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PaymentGateway for ScriptedGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, feature: GatewayFeature) -> bool {
        self.features.contains(&feature)
    }

    fn process_payment(&self, order: &Order) -> Result<PaymentOutcome, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.outcomes.lock().expect("outcomes lock").pop_front();
        Ok(scripted.unwrap_or_else(|| PaymentOutcome::Approved {
            transaction_id: format!("TXN_{}_{}", order.id, call),
        }))
    }
}

/// A service wired to in-memory collaborators, a pinned clock and a recording event bus.
pub struct Harness {
    pub store: InMemoryStore,
    pub queue: InMemoryTaskQueue,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<ScriptedGateway>,
    pub recorder: Arc<EventRecorder>,
    pub service: SubscriptionService,
    registry: Arc<GatewayRegistry>,
    bus: EventBus,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_gateway_features(now, &STANDARD_FEATURES)
    }

    pub fn with_gateway_features(now: DateTime<Utc>, features: &[GatewayFeature]) -> Self {
        let gateway = Arc::new(ScriptedGateway::new(CARD, features));
        let mut registry = GatewayRegistry::new();
        registry.register(gateway.clone());

        let recorder = Arc::new(EventRecorder::new());
        let mut bus = EventBus::new();
        bus.subscribe(recorder.clone());

        let store = InMemoryStore::new();
        let queue = InMemoryTaskQueue::new();
        let clock = Arc::new(FixedClock::new(now));
        let registry = Arc::new(registry);
        let service = Self::build_service(&store, &queue, &clock, &registry, &bus);

        Self {
            store,
            queue,
            clock,
            gateway,
            recorder,
            service,
            registry,
            bus,
        }
    }

    fn build_service(
        store: &InMemoryStore,
        queue: &InMemoryTaskQueue,
        clock: &Arc<FixedClock>,
        registry: &Arc<GatewayRegistry>,
        bus: &EventBus,
    ) -> SubscriptionService {
        SubscriptionService::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            registry.clone(),
            clock.clone(),
            &BillingConfig::default(),
        )
        .with_event_bus(bus.clone())
    }

    /// A second service over the same store, queue, clock, gateway and recorder.
    pub fn rebuild_service(&self) -> SubscriptionService {
        Self::build_service(&self.store, &self.queue, &self.clock, &self.registry, &self.bus)
    }

    pub fn create(&self, request: NewSubscription) -> Subscription {
        self.service
            .create_subscription(request)
            .expect("subscription is created")
    }

    /// A monthly subscription starting now whose first payment has completed.
    pub fn active_monthly(&self) -> Subscription {
        let mut subscription = self.create(request(1, BillingPeriod::Month, 0, self.clock.now()));
        self.service
            .payment_complete(&mut subscription, None)
            .expect("first payment completes");
        subscription
    }

    pub fn reload(&self, id: OrderId) -> Subscription {
        self.store.subscription(id).expect("subscription is stored")
    }
}
