//! Relays a BLE heart-rate strap to WebSocket subscribers.
//!
//! `gateway` → `multiplexer` → `hub` → `server`, with `session` driving the
//! whole thing and reporting on the `signal` bus.

pub mod ble;
pub mod config;
pub mod fake;
pub mod gateway;
pub mod hub;
pub mod multiplexer;
pub mod server;
pub mod session;
pub mod signal;
pub mod telemetry;
