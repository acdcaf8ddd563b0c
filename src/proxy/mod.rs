//! SOCKS5 relay implementation
//!
//! This module provides the relay data path:
//! - SOCKS5 wire codec
//! - Proxy list feed and upstream pool management
//! - Upstream SOCKS5 handshake
//! - Client sessions and bidirectional forwarding

pub mod feed;
pub mod pool;
pub mod server;
pub mod session;
pub mod socks5;
pub mod tunnel;
pub mod upstream;

pub use feed::{FeedFilter, FileProxySource, HttpProxySource, ProxySource};
pub use pool::{FailureOutcome, PoolManager};
pub use server::RelayServer;
pub use session::{SessionConfig, SessionHandler};
pub use tunnel::{Forwarder, TransferStats};
pub use upstream::{UpstreamConfig, UpstreamConnector};
