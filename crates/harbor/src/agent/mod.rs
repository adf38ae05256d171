//! The agent session engine: child CLI supervision per turn.

mod args;
mod engine;
mod images;

pub use args::TurnCommand;
pub use engine::{AgentEngine, AgentSession};
pub use images::{TempImageDir, write_turn_images};
