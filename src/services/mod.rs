pub mod database;
pub mod dates;
pub mod events;
pub mod gateway;
pub mod policy;
pub mod related;
pub mod renewal;
pub mod scheduler;
pub mod state_machine;
pub mod subscription;
pub mod task_queue;
