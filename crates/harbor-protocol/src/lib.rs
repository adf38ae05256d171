//! Canonical wire types for Harbor client/broker communication.
//!
//! This crate defines the formats spoken on every Harbor boundary:
//!
//! ```text
//! Browser <--[WS: framed events/commands]--> Broker <--[JSONL stdout]--> Agent CLI
//! ```
//!
//! The browser speaks only the framed protocol. Agent CLI records flow through
//! the broker unmodified; the broker inspects them just enough to derive
//! session metadata and canonical replay messages.
//!
//! ## Design principles
//!
//! 1. **Records are pass-through.** Unknown record variants and unknown fields
//!    survive a round trip so new agent CLI releases keep working.
//! 2. **Frames are flat.** One `{type, data}` envelope in both directions,
//!    with a dotted namespace (`session.<id>.send_message`) as the router key.
//! 3. **Metadata is derived, never authored.** `DerivedMetadata` is computed
//!    from the agent's own session log; the broker stores but never edits it.

pub mod frames;
pub mod messages;
pub mod records;

pub use frames::{
    ClientFrame, FrameTarget, SendMessagePayload, ServerFrame, ShellInitPayload,
    ShellInputPayload, ShellResizePayload, TurnImage, TurnOptions,
};
pub use messages::{ContentBlock, DerivedMetadata, SessionMessage};
pub use records::{LogRecord, TokenUsage};
