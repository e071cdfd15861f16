//! Protocol module - Content-Length framing over a byte transport.
//!
//! This module implements the textual framing shared by the editor transport
//! and the backend RPC session:
//! - incremental, resumable frame parsing
//! - frame encoding with a correct UTF-8 byte count

mod frame_codec;

pub use frame_codec::{FrameCodec, MAX_HEADER_SIZE};
