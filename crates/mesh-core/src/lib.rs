//! mesh-core — shared wire format, message envelope, and configuration.
//! All other mesh crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use message::{Message, MessageId};
pub use wire::{RawFrame, WireError};
