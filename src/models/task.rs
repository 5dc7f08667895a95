use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::common::OrderId;

pub type TaskId = Uuid;

/// Named unit of future work registered with the task queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    ScheduledPayment,
    PaymentRetry,
    TrialEnd,
    EndOfPrepaidTerm,
    Expiration,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::ScheduledPayment,
        Hook::PaymentRetry,
        Hook::TrialEnd,
        Hook::EndOfPrepaidTerm,
        Hook::Expiration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::ScheduledPayment => "scheduled_payment",
            Hook::PaymentRetry => "schedule_payment_retry",
            Hook::TrialEnd => "schedule_trial_end",
            Hook::EndOfPrepaidTerm => "schedule_end_of_prepaid_term",
            Hook::Expiration => "schedule_expiration",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskArgs {
    pub subscription_id: OrderId,
}

impl TaskArgs {
    pub fn for_subscription(subscription_id: OrderId) -> Self {
        Self { subscription_id }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub hook: Hook,
    pub args: TaskArgs,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    pub fn new(scheduled_for: DateTime<Utc>, hook: Hook, args: TaskArgs) -> Self {
        Self {
            id: Uuid::new_v4(),
            hook,
            args,
            scheduled_for,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Criteria for [`crate::services::task_queue::TaskQueue::search`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub hook: Option<Hook>,
    pub args: Option<TaskArgs>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn matches(&self, task: &ScheduledTask) -> bool {
        self.hook.map_or(true, |hook| task.hook == hook)
            && self.args.map_or(true, |args| task.args == args)
            && self.status.map_or(true, |status| task.status == status)
    }
}
