//! Vector clock ledger
//!
//! Tracks, per source, the timestamp of the most recent accepted update. The
//! same structure doubles as a session's record of what its peer has seen.

use crate::types::{SourceId, Timestamp, Update};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from source to the highest timestamp seen from that source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<SourceId, Timestamp>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest timestamp recorded for a source
    pub fn get(&self, source: &str) -> Option<Timestamp> {
        self.0.get(source).copied()
    }

    /// Record `timestamp` for `source` if it is strictly newer.
    ///
    /// Returns false for stale or duplicate timestamps; the clock is left
    /// untouched in that case.
    pub fn observe(&mut self, source: &SourceId, timestamp: Timestamp) -> bool {
        match self.0.get_mut(source.as_str()) {
            Some(latest) if *latest >= timestamp => false,
            Some(latest) => {
                *latest = timestamp;
                true
            }
            None => {
                self.0.insert(source.clone(), timestamp);
                true
            }
        }
    }

    /// Move the entry for `source` forward to `timestamp` (never backwards)
    pub fn advance(&mut self, source: &SourceId, timestamp: Timestamp) {
        self.observe(source, timestamp);
    }

    /// Whether `update` is something a holder of this clock has not seen
    pub fn is_behind<P>(&self, update: &Update<P>) -> bool {
        is_newer(update, self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &Timestamp)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.0.contains_key(source)
    }
}

impl FromIterator<(SourceId, Timestamp)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (SourceId, Timestamp)>>(iter: I) -> Self {
        let mut clock = VectorClock::new();
        for (source, timestamp) in iter {
            clock.advance(&source, timestamp);
        }
        clock
    }
}

/// History filter: true if `clock` has no entry for the update's source or
/// its entry is older than the update.
pub fn is_newer<P>(update: &Update<P>, clock: &VectorClock) -> bool {
    match clock.get(update.source.as_str()) {
        Some(seen) => seen < update.timestamp,
        None => true,
    }
}

/// Order history by timestamp, then source. Stable.
pub fn sort_history<P>(history: &mut [Update<P>]) {
    history.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.source.cmp(&b.source))
    });
}

/// Shape check applied to every update entering or leaving a stream.
pub fn validate<P>(update: &Update<P>) -> bool {
    update.timestamp > Timestamp::ZERO && crate::types::ensure_legal_key(update.source.as_str()).is_ok()
}
