//! # fleet_ws
//!
//! Transport layer: one reconnectable WebSocket connection per endpoint URL, shared through a
//! reference-counted pool. Frames are delivered verbatim; parsing belongs to the router.

pub mod dialer;
pub mod errors;
pub mod frame;
pub mod health;
pub mod metrics;
pub mod pool;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use dialer::Dialer;
pub use dialer::DialerConfig;
pub use dialer::Link;
pub use dialer::TokenSource;
pub use dialer::TungsteniteDialer;
pub use errors::Result;
pub use errors::WsError;
pub use frame::Frame;
pub use health::HealthChecker;
pub use metrics::TransportStats;
pub use metrics::TransportStatsSnapshot;
pub use pool::Opened;
pub use pool::TransportHandle;
pub use pool::TransportPool;
pub use transport::Transport;
pub use transport::TransportConfig;
