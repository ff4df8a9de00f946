//! Data models for calls, signaling envelopes and inbox notices

mod call;
mod inbox;
mod message;
mod signal;

pub use call::*;
pub use inbox::*;
pub use message::*;
pub use signal::*;
