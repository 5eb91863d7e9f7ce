//! Scuttlebutt Core Library
//!
//! This crate provides the core types, vector clock bookkeeping, canonical
//! encoding and update signing for the Scuttlebutt replication protocol.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (SourceId, Timestamp, Update, Digest, Message)
//! - [`clock`]: Vector clock ledger, history filtering and ordering
//! - [`canonical`]: Deterministic serialization for signing
//! - [`crypto`]: Signing/verification plugin traits and Ed25519 plugins
//! - [`time`]: Process-wide monotonic timestamp generator
//! - [`error`]: Error types

pub mod canonical;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod time;
pub mod types;

pub use clock::VectorClock;
pub use error::{Error, Result};
pub use types::*;
