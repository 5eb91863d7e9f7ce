//! Replicated data type contract

use scuttlebutt_core::{Update, VectorClock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// A replicated data type driven by the engine.
///
/// The engine decides *whether* an update is new; the model decides what it
/// means. Conflict resolution and history retention belong here.
pub trait Model: Send + 'static {
    /// Payload carried by this model's updates
    type Payload: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Merge an update into local state.
    ///
    /// Returns true iff state changed; updates that return false are not
    /// forwarded to peers.
    fn apply_update(&mut self, update: &Update<Self::Payload>) -> bool;

    /// Every retained update newer than `peer` for its source, ordered by
    /// `(timestamp, source)`. Sources missing from `peer` count as unseen.
    fn history(&self, peer: &VectorClock) -> Vec<Update<Self::Payload>>;
}
