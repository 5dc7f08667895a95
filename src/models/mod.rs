pub mod common;
pub mod event;
pub mod order;
pub mod subscription;
pub mod task;
