//! Moray Common Types and Transport
//!
//! This crate provides the wire protocol definitions, the error taxonomy and
//! the framed TCP transport shared by the Moray client and its tooling.
//!
//! # Overview
//!
//! Moray is a key/value store fronted by an RPC service. Clients keep a pool
//! of TCP connections to one or more Moray servers and multiplex many
//! in-flight requests over each connection. This crate contains the pieces
//! that every component agrees on:
//!
//! - **Protocol Layer**: message frames, remote (server-reported) errors and
//!   the client-side [`MorayError`] type
//! - **Transport Layer**: length-prefixed JSON framing over async streams
//!
//! # Architecture
//!
//! The wire protocol is deliberately simple:
//! - **Transport**: TCP with keep-alive enabled
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB (prevents memory exhaustion)
//!
//! Every frame carries a request id, a status (`data`, `end` or `error`) and
//! the method name, so a single connection can interleave the responses of
//! many concurrent requests.
//!
//! # Components
//!
//! - [`protocol`] - Message frames, remote errors and [`MorayError`]
//! - [`transport`] - Frame codec and TCP connection helpers
//!
//! # Example
//!
//! ```
//! use moray_common::{Message, MessageStatus};
//! use serde_json::json;
//!
//! let request = Message::request(1, "getObject", vec![json!("bucket"), json!("key")]);
//! assert_eq!(request.status, MessageStatus::Data);
//! assert_eq!(request.method(), "getObject");
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
