//! tether-core: shared types, wire format, and configuration.
//! All other Tether crates depend on this one.

pub mod config;
pub mod forward;
pub mod session;
pub mod wire;

pub use forward::{ForwardAck, ForwardItem, ForwardRequest, MAX_FORWARD_HOPS};
pub use session::{Device, NodeId, SessionId, SessionRecord, Status, Uid};
pub use wire::{Flag, Frame, Meta, WireError};
