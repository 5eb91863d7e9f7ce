//! Core protocol types for Scuttlebutt
//!
//! The wire shapes are fixed: updates travel as JSON arrays
//! `[payload, timestamp, source, signature?]`, digests as objects and the
//! sync marker as the bare string `"SYNC"`.

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

/// Keys that must never be used as identifiers or data-type keys.
pub const RESERVED_KEYS: &[&str] = &["__proto__"];

/// Literal marking the end of history replay on a stream.
pub const SYNC_MARKER: &str = "SYNC";

/// Reject reserved identifiers and keys.
pub fn ensure_legal_key(key: &str) -> Result<()> {
    if RESERVED_KEYS.contains(&key) {
        return Err(Error::ReservedKey(key.to_string()));
    }
    Ok(())
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Identifier of the replica an update originated from.
///
/// Always non-empty and never a reserved key; both construction and
/// deserialization enforce this.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Create a source id, rejecting empty and reserved values
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyId);
        }
        ensure_legal_key(&id)?;
        Ok(Self(id))
    }

    /// Generate a random source id (16 hex chars)
    pub fn random() -> Self {
        let bytes: [u8; 8] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl FromStr for SourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl Borrow<str> for SourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for SourceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-source logical timestamp (microseconds since the Unix epoch).
///
/// Only comparable between updates of the same source.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque signature attached by a signing plugin. Hex-encoded on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded)
            .map(Signature)
            .map_err(de::Error::custom)
    }
}

// =============================================================================
// UPDATE
// =============================================================================

/// A single replicated update: `(payload, timestamp, source, signature?)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Update<P> {
    pub payload: P,
    pub timestamp: Timestamp,
    pub source: SourceId,
    pub signature: Option<Signature>,
}

impl<P> Update<P> {
    /// Create an unsigned update
    pub fn new(payload: P, timestamp: Timestamp, source: SourceId) -> Self {
        Self {
            payload,
            timestamp,
            source,
            signature: None,
        }
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }
}

impl<P: Serialize> Serialize for Update<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.signature.is_some() { 4 } else { 3 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.payload)?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&self.source)?;
        if let Some(signature) = &self.signature {
            seq.serialize_element(signature)?;
        }
        seq.end()
    }
}

impl<'de, P: Deserialize<'de>> Deserialize<'de> for Update<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct UpdateVisitor<P>(PhantomData<P>);

        impl<'de, P: Deserialize<'de>> Visitor<'de> for UpdateVisitor<P> {
            type Value = Update<P>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array [payload, timestamp, source, signature?]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Update<P>, A::Error> {
                let payload = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let timestamp = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let source = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let signature = seq.next_element::<Option<Signature>>()?.flatten();

                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(5, &self));
                }

                Ok(Update {
                    payload,
                    timestamp,
                    source,
                    signature,
                })
            }
        }

        deserializer.deserialize_seq(UpdateVisitor(PhantomData))
    }
}

// =============================================================================
// STREAM MESSAGES
// =============================================================================

/// Vector clock digest sent at the start of every session.
///
/// `clock` is optional only so that a digest without one can be decoded and
/// rejected as a protocol violation by the session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<VectorClock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Digest {
    /// Digest for a replica's current clock
    pub fn new(id: SourceId, clock: VectorClock) -> Self {
        Self {
            id: Some(id),
            clock: Some(clock),
            meta: None,
        }
    }

    /// Digest standing for "the peer has nothing yet"
    pub fn empty() -> Self {
        Self {
            id: None,
            clock: Some(VectorClock::new()),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Option<serde_json::Value>) -> Self {
        self.meta = meta;
        self
    }
}

/// One logical message on a replication stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Message<P> {
    Digest(Digest),
    Update(Update<P>),
    Sync,
}

impl<P: Serialize> Serialize for Message<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Message::Digest(digest) => digest.serialize(serializer),
            Message::Update(update) => update.serialize(serializer),
            Message::Sync => serializer.serialize_str(SYNC_MARKER),
        }
    }
}
