//! Status API
//!
//! Read-only HTTP endpoints exposing the relay's pool and counters.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{AppState, StatusServer};
