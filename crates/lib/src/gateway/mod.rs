//! Gateway: webhook HTTP server.
//!
//! Single port serves the LINE callback, the Telegram webhook and a health probe. Handlers
//! verify and normalize; a processor task routes each event and emits its reply.

mod server;

pub use server::{app, run_gateway, serve, GatewayState};
