//! Links and transport for the Scuttlebutt replication protocol
//!
//! This crate provides:
//! - In-process full-duplex links carrying protocol messages
//! - Newline-delimited JSON framing
//! - A pump bridging any byte stream (TCP, in-memory) to a link

pub mod framing;
pub mod link;
pub mod transport;

pub use framing::{FrameError, MessageCodec};
pub use link::Link;
pub use transport::{pump, Transport, TransportError};
