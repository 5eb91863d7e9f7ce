//! Canonical encoding for update signing
//!
//! Signatures cover the payload, timestamp and source of an update, encoded
//! with postcard. The signature field itself is never part of the signed
//! bytes.

use crate::error::{Error, Result};
use crate::types::{SourceId, Timestamp, Update};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Canonical bytes of the signed portion of an update.
pub fn update_bytes<P: Serialize>(update: &Update<P>) -> Result<Vec<u8>> {
    let unsigned: (&P, Timestamp, &SourceId) = (&update.payload, update.timestamp, &update.source);
    canonical_bytes(&unsigned)
}
