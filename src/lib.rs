pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod scheduler;
pub mod store;
pub mod telemetry;
