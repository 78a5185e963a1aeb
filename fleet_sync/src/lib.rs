//! # fleet_sync
//!
//! Live fleet data over shared WebSocket connections: topic subscriptions, message routing,
//! version-aware reconciliation with REST snapshots, and reconnection with snapshot repair.
//!
//! ```no_run
//! # async fn run() -> fleet_sync::Result<()> {
//! use fleet_sync::SyncClient;
//! use fleet_sync::SyncConfig;
//! use fleet_types::Topic;
//! use fleet_types::models::Vehicle;
//!
//! let client = SyncClient::builder().config(SyncConfig::new("wss://api.example.com")).build();
//! let mut vehicles = client.use_channel(Topic::fleet_vehicles(42), || async { Ok::<Vec<Vehicle>, fleet_sync::SyncError>(Vec::new()) })?;
//! vehicles.changed().await?;
//! println!("{} vehicles ({})", vehicles.data().len(), vehicles.connection_state());
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod errors;
pub mod facade;
pub mod notifications;
pub mod reconciler;
pub mod reconnect;
pub mod registry;
pub mod router;

pub use alerts::AlertLatch;
pub use alerts::SyncEvent;
pub use config::BackoffConfig;
pub use config::SyncConfig;
pub use errors::Result;
pub use errors::SyncError;
pub use facade::ChannelHandle;
pub use facade::ChannelView;
pub use facade::SyncClient;
pub use facade::SyncClientBuilder;
pub use notifications::LogSink;
pub use notifications::NotificationFilter;
pub use notifications::NotificationSink;
pub use reconciler::Reconciler;
pub use reconciler::ReconcilerStats;
pub use reconciler::TopicSnapshot;
pub use reconnect::Backoff;
pub use reconnect::ConnectionMachine;
pub use registry::Registry;
pub use registry::SnapshotFetcher;
pub use registry::Subscriber;
pub use registry::SubscriptionId;
pub use router::RouteOutcome;
pub use router::Router;
