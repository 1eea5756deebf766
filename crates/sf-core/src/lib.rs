pub mod config;
pub mod db;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod migrations;
pub mod server;
pub mod service_config;
