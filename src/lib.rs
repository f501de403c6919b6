pub mod api;
pub mod coercion;
pub mod identifier;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod utils;
