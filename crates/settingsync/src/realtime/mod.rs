//! Realtime patch channel over TCP
//!
//! Every frame is a 4-byte big-endian length followed by a protobuf `Frame`.

mod client;
mod frame;
mod listener;

pub use client::{RealtimeClient, RealtimeEvent};
pub use frame::{FrameError, read_frame, write_frame};
pub use listener::RealtimeListener;
