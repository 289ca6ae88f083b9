//! HTTP API handlers for warden-review

pub mod entities;
pub mod events;
pub mod health;
pub mod queue;
pub mod review;
pub mod workers;

pub use entities::entity_routes;
pub use events::event_routes;
pub use health::health_routes;
pub use queue::queue_routes;
pub use review::review_routes;
pub use workers::worker_routes;
