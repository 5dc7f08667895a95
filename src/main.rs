use anyhow::Context;
use dotenv::dotenv;
use std::fs;
use std::sync::Arc;

use recurring_billing::config::Config;
use recurring_billing::models::subscription::NewSubscription;
use recurring_billing::services::database::InMemoryStore;
use recurring_billing::services::events::{EventBus, LoggingListener};
use recurring_billing::services::gateway::{GatewayRegistry, OfflineGateway};
use recurring_billing::services::subscription::SubscriptionService;
use recurring_billing::services::task_queue::InMemoryTaskQueue;
use recurring_billing::tasks::worker::TaskWorker;
use recurring_billing::utils::clock::SystemClock;
use recurring_billing::utils::format;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let offset = config.display_offset()?;

    let store = InMemoryStore::new();
    let queue = InMemoryTaskQueue::with_history_limit(config.worker.task_history_limit);
    let clock = Arc::new(SystemClock);

    let mut gateways = GatewayRegistry::new();
    gateways.register(Arc::new(OfflineGateway::from_config(&config.gateway)));

    let mut events = EventBus::new();
    events.subscribe(Arc::new(LoggingListener));

    let service = Arc::new(
        SubscriptionService::new(
            Arc::new(store),
            Arc::new(queue.clone()),
            Arc::new(gateways),
            clock.clone(),
            &config.billing,
        )
        .with_event_bus(events),
    );

    if let Some(path) = &config.seed_file {
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let requests: Vec<NewSubscription> =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path))?;

        for mut request in requests {
            if request.payment_method.is_none() {
                request.payment_method = Some(config.gateway.id.clone());
            }
            let mut subscription = service.create_subscription(request)?;
            service.payment_complete(&mut subscription, None)?;
            log::info!("Seeded {}", format::summarize(&subscription.snapshot(), offset));
        }
    }

    let worker = TaskWorker::new(service, Arc::new(queue), clock, config.worker.clone());

    log::info!("Starting billing worker with gateway \"{}\"", config.gateway.id);
    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    Ok(())
}
