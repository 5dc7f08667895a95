pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod tasks;
pub mod utils;

#[cfg(test)]
mod testing;
