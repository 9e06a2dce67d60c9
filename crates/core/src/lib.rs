//! wire formats for the RF433 benchmark link
//!
//! Binary frames and newline-delimited control messages travel over the same serial byte
//! stream. This crate only encodes and decodes; it does no I/O.

pub mod control;
pub mod frame;
pub mod hash;
pub mod types;

pub use control::{ControlError, ControlMessage};
pub use frame::{Frame, FrameError};
pub use types::*;
