//! Recovery events and their consumers: Discord webhooks and Prometheus metrics.

pub mod discord;
pub mod events;
pub mod prometheus;

pub use discord::DiscordNotifier;
pub use events::{EventSink, RecoveryEvent};
pub use prometheus::{Metrics, MetricsServer};
