pub mod config;
pub mod connection;
pub mod driver;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod pacing;
pub mod probe;
pub mod queue;
pub mod roles;
pub mod store;
