//! Moray Transport Layer
//!
//! This module provides the frame codec and the async TCP helpers used to
//! exchange [`Message`](crate::protocol::Message) frames with a server.
//!
//! # Architecture
//!
//! - **Transport**: TCP with keep-alive enabled on every connection
//! - **Codec**: JSON serialization of protocol frames
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! # Components
//!
//! - **[`JsonCodec`]**: Encode/decode frames to JSON, with or without the length prefix
//! - **[`TcpTransport`]**: Connect with a deadline, read and write frames on async streams
//!
//! # Message Size Limits
//!
//! Frames larger than [`MAX_MESSAGE_SIZE`] (100 MB) are rejected in both
//! directions.

pub mod codec;
pub mod tcp;

pub use codec::{JsonCodec, MAX_MESSAGE_SIZE};
pub use tcp::TcpTransport;

#[cfg(test)]
mod tests;
