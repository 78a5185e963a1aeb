//! # fleet_http
//!
//! REST boundary of the sync layer: snapshot fetches, mutations and the bearer-token session.

pub mod api;
pub mod circuit_breaker;
pub mod client;
pub mod errors;
pub mod session;

pub use api::FleetApi;
pub use api::FleetApiBuilder;
pub use api::TokenGrant;
pub use circuit_breaker::CircuitBreaker;
pub use circuit_breaker::CircuitBreakerConfig;
pub use circuit_breaker::CircuitState;
pub use client::HttpClient;
pub use client::HttpClientConfig;
pub use errors::ApiError;
pub use errors::Result;
pub use session::Session;
