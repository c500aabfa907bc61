//! On-wire protocol: framing and per-command payload codecs.
//!
//! Pure functions over byte slices — no I/O, no state. WebSocket framing
//! provides message boundaries, so frames carry no top-level length field.

pub mod codec;
pub mod frame;

pub use frame::{fnv1a64, CommandKind, Frame, FrameKind, RequestId};
