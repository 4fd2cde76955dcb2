//! WebSocket signalling: login, offer/answer exchange and stream
//! subscriptions for a single shared room.

pub mod messages;
pub mod server;

pub use server::SignallingServer;
