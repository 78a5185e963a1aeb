//! # fleet_types
//!
//! Shared vocabulary for the real-time sync layer: topics, versioned entity
//! snapshots, connection states, wire messages and the fleet domain models.

pub mod connection;
pub mod entity;
pub mod errors;
pub mod messages;
pub mod models;
pub mod topic;

pub use connection::ConnectionState;
pub use entity::Entity;
pub use entity::EntityId;
pub use entity::EntitySnapshot;
pub use entity::Version;
pub use errors::Result;
pub use errors::TypesError;
pub use messages::ClientFrame;
pub use messages::Delta;
pub use messages::ServerMessage;
pub use topic::Topic;
pub use topic::TopicKind;
