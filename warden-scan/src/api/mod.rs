//! HTTP API modules

pub mod events;
pub mod health;
pub mod ingest;

pub use events::event_routes;
pub use health::health_routes;
pub use ingest::ingest_routes;
