use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::services::gateway::GatewayFeature;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: \"{value}\"")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub billing: BillingConfig,
    pub gateway: GatewayConfig,
    /// Only used when rendering dates for people.
    pub display_utc_offset_minutes: i32,
    /// Optional JSON file of subscriptions to create at startup.
    pub seed_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// Finished tasks the in-memory queue keeps for inspection.
    pub task_history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub retry_intervals_hours: Vec<u32>,
    /// 0 disables cancelling after repeated failures.
    pub max_failed_payments: u32,
    pub next_payment_buffer_hours: u32,
    pub end_date_grace_hours: u32,
    pub activation_threshold_hours: u32,
    pub max_period_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: String,
    pub features: Vec<GatewayFeature>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, falling back to defaults for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker = WorkerConfig::default();
        let billing = BillingConfig::default();
        let gateway = GatewayConfig::default();

        Ok(Config {
            worker: WorkerConfig {
                poll_interval_secs: parse_or(&lookup, "WORKER_POLL_INTERVAL_SECS", worker.poll_interval_secs)?,
                batch_size: parse_or(&lookup, "WORKER_BATCH_SIZE", worker.batch_size)?,
                task_history_limit: parse_or(&lookup, "WORKER_TASK_HISTORY_LIMIT", worker.task_history_limit)?,
            },

            billing: BillingConfig {
                retry_intervals_hours: parse_list_or(
                    &lookup,
                    "PAYMENT_RETRY_INTERVALS_HOURS",
                    billing.retry_intervals_hours,
                    |s| s.parse().ok(),
                )?,
                max_failed_payments: parse_or(&lookup, "MAX_FAILED_PAYMENTS", billing.max_failed_payments)?,
                next_payment_buffer_hours: parse_or(
                    &lookup,
                    "NEXT_PAYMENT_BUFFER_HOURS",
                    billing.next_payment_buffer_hours,
                )?,
                end_date_grace_hours: parse_or(&lookup, "END_DATE_GRACE_HOURS", billing.end_date_grace_hours)?,
                activation_threshold_hours: parse_or(
                    &lookup,
                    "ACTIVATION_THRESHOLD_HOURS",
                    billing.activation_threshold_hours,
                )?,
                max_period_iterations: parse_or(&lookup, "MAX_PERIOD_ITERATIONS", billing.max_period_iterations)?,
            },

            gateway: GatewayConfig {
                id: lookup("DEFAULT_GATEWAY_ID")
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or(gateway.id),
                features: parse_list_or(
                    &lookup,
                    "DEFAULT_GATEWAY_FEATURES",
                    gateway.features,
                    GatewayFeature::from_slug,
                )?,
            },

            display_utc_offset_minutes: parse_or(&lookup, "DISPLAY_UTC_OFFSET_MINUTES", 0)?,
            seed_file: lookup("SEED_SUBSCRIPTIONS_FILE").filter(|path| !path.trim().is_empty()),
        })
    }

    pub fn display_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.display_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                key: "DISPLAY_UTC_OFFSET_MINUTES".to_string(),
                value: self.display_utc_offset_minutes.to_string(),
            })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_list_or<F, T>(
    lookup: &F,
    key: &str,
    default: Vec<T>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse(s).ok_or_else(|| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
            })
        })
        .collect()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 25,
            task_history_limit: 1000,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            retry_intervals_hours: vec![12, 12, 24, 48, 72],
            max_failed_payments: 5,
            next_payment_buffer_hours: 2,
            end_date_grace_hours: 23,
            activation_threshold_hours: 2,
            max_period_iterations: 3000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: "offline".to_string(),
            features: vec![
                GatewayFeature::SubscriptionSuspension,
                GatewayFeature::SubscriptionReactivation,
                GatewayFeature::SubscriptionCancellation,
                GatewayFeature::SubscriptionDateChanges,
            ],
        }
    }
}
