//! Socks Relay - local SOCKS5 relay over rotating upstream proxies
//!
//! Accepts unauthenticated SOCKS5 CONNECT requests on a local port and
//! tunnels each one through a proxy picked from a public SOCKS5 list.
//!
//! ## Features
//!
//! - Proxy list loaded from HTTP(S) or a local file, filtered by ping,
//!   country and age, refreshed periodically
//! - Failure-driven blacklisting and rotation of the active upstream
//! - Periodic blacklist decay and statistics logging
//! - Read-only status API

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;

pub use config::Config;
pub use error::{RelayError, Result};
