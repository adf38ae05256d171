//! WebSocket surface: one socket per client, frames dispatched by their
//! dotted type string.

mod router;

pub use router::ws_handler;
