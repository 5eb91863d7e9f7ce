//! Reliable event log model
//!
//! Every emission from every replica is retained, grouped by event name.
//! Unlike the key/value model nothing is ever superseded, so history grows
//! without bound.

use crate::engine::{Notification, Scuttlebutt};
use crate::model::Model;
use scuttlebutt_core::clock::sort_history;
use scuttlebutt_core::types::ensure_legal_key;
use scuttlebutt_core::{Update, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Event payload, `[name, args]` on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emission(pub String, pub Vec<Value>);

impl Emission {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn args(&self) -> &[Value] {
        &self.1
    }
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: BTreeMap<String, Vec<Update<Emission>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emissions of one event in arrival order
    pub fn events(&self, name: &str) -> scuttlebutt_core::Result<&[Update<Emission>]> {
        ensure_legal_key(name)?;
        Ok(self.events.get(name).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Total number of retained emissions
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Model for EventLog {
    type Payload = Emission;

    fn apply_update(&mut self, update: &Update<Emission>) -> bool {
        let name = update.payload.name();
        if ensure_legal_key(name).is_err() {
            return false;
        }
        self.events
            .entry(name.to_string())
            .or_default()
            .push(update.clone());
        true
    }

    fn history(&self, peer: &VectorClock) -> Vec<Update<Emission>> {
        let mut history: Vec<_> = self
            .events
            .values()
            .flatten()
            .filter(|update| peer.is_behind(update))
            .cloned()
            .collect();
        sort_history(&mut history);
        history
    }
}

impl Scuttlebutt<EventLog> {
    /// Record an event locally
    pub fn emit(&self, name: impl Into<String>, args: Vec<Value>) -> scuttlebutt_core::Result<bool> {
        let name = name.into();
        ensure_legal_key(&name)?;
        Ok(self.local_update(Emission(name, args)))
    }

    /// Emissions of one event in arrival order
    pub fn events(&self, name: &str) -> scuttlebutt_core::Result<Vec<Update<Emission>>> {
        self.read(|log| log.events(name).map(<[_]>::to_vec))
    }

    /// Listen for emissions of one event accepted from now on, local or
    /// replicated
    pub fn on(&self, name: impl Into<String>) -> scuttlebutt_core::Result<Listener> {
        let name = name.into();
        ensure_legal_key(&name)?;
        Ok(Listener {
            name,
            notifications: self.subscribe(),
        })
    }
}

/// Accepted emissions of a single event
pub struct Listener {
    name: String,
    notifications: broadcast::Receiver<Notification<Emission>>,
}

impl Listener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next matching emission. None once the engine is gone.
    pub async fn recv(&mut self) -> Option<Update<Emission>> {
        loop {
            match self.notifications.recv().await {
                Ok(Notification::Accepted(update)) if update.payload.name() == self.name => {
                    return Some(update)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(event = %self.name, "Listener dropped {} notifications", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
