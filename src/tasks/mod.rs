pub mod handlers;
pub mod worker;
