mod routes;

pub mod annotate;
pub mod app;
pub mod config;
pub mod frame;
pub mod input;
pub mod models;
pub mod processor;
pub mod server;
pub mod telemetry;

pub use app::start_app;
