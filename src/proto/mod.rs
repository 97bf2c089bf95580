//! Shared wire protocol: the framing codec and frame payloads.
//!
//! A frame is `type (1 byte) || length (8 bytes, little-endian) || payload`.
//! The same codec carries three disjoint type ranges: transfer frames
//! (0x01-0x09 and 0x7F), PAKE frames (0x10, 0x11, 0x1F), and rendezvous
//! frames (0x40-0x4F, which never share a stream with the other two).

pub mod frame;
pub mod wire;

pub use frame::{read_frame, write_frame, FrameError};
