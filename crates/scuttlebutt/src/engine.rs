//! Scuttlebutt engine: vector clock, ingestion pipeline and tail fan-out
//!
//! An engine owns one replica: its id, its vector clock, the data-type state
//! and the set of sessions currently tailing it. All of that lives behind a
//! single lock that is never held across an await. Verification of updates
//! from other sources runs on its own task, outside any session.

use crate::model::Model;
use parking_lot::Mutex;
use scuttlebutt_core::clock::validate;
use scuttlebutt_core::crypto::{Sign, Verify};
use scuttlebutt_core::time::timestamp;
use scuttlebutt_core::{Message, SourceId, Update, VectorClock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Payload type of a model
pub type Payload<M> = <M as Model>::Payload;

/// Identifier of a session within one engine
pub type SessionId = u64;

/// Default capacity of the notification channel
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Observable engine notifications
#[derive(Clone, Debug)]
pub enum Notification<P> {
    /// Update was stale or a duplicate for its source
    OldData(Update<P>),
    /// Verification rejected the update
    UnverifiedData(Update<P>),
    /// Verification or signing failed; the update was dropped
    Error(String),
    /// Update was applied by the model and fanned out
    Accepted(Update<P>),
    /// A session closed; carries the number still open
    Unstream(usize),
    /// A loopback clone detached; carries the number still attached
    Unclone(usize),
    /// All sessions were asked to close
    Dispose,
}

/// Result of [`Scuttlebutt::submit`]
#[derive(Debug)]
pub enum Submitted {
    /// Pipeline finished synchronously; whether the model applied the update
    Done(bool),
    /// Verification is running; resolves to whether the update was applied
    Verifying(JoinHandle<bool>),
}

/// Forwarding half of a tailing session.
///
/// Registered once the session has queued its history. Holds the session's
/// view of the peer clock, which only this tail advances.
pub(crate) struct Tail<P> {
    peer_clock: VectorClock,
    outbound: mpsc::UnboundedSender<Message<P>>,
}

impl<P: Clone> Tail<P> {
    fn forward(&mut self, update: &Update<P>) {
        if !validate(update) || !self.peer_clock.is_behind(update) {
            return;
        }
        if self.outbound.send(Message::Update(update.clone())).is_ok() {
            // Optimistic: the peer will have it once the message lands
            self.peer_clock.advance(&update.source, update.timestamp);
        }
    }
}

struct State<M: Model> {
    clock: VectorClock,
    model: M,
    tails: BTreeMap<SessionId, Tail<M::Payload>>,
    streams: usize,
    clones: usize,
}

struct Inner<M: Model> {
    id: SourceId,
    state: Mutex<State<M>>,
    signer: Option<Arc<dyn Sign<M::Payload>>>,
    verifier: Option<Arc<dyn Verify<M::Payload>>>,
    notifications: broadcast::Sender<Notification<M::Payload>>,
    notify_capacity: usize,
    /// Dispose signal; sessions subscribe when they open
    dispose: broadcast::Sender<()>,
    next_session: AtomicU64,
}

/// Handle to a replica. Cloning the handle shares the replica.
pub struct Scuttlebutt<M: Model> {
    inner: Arc<Inner<M>>,
}

impl<M: Model> Clone for Scuttlebutt<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Engine builder
pub struct Builder<M: Model> {
    model: M,
    id: Option<SourceId>,
    signer: Option<Arc<dyn Sign<M::Payload>>>,
    verifier: Option<Arc<dyn Verify<M::Payload>>>,
    notify_capacity: usize,
}

impl<M: Model> Builder<M> {
    /// Replica id (random when unset)
    pub fn id(mut self, id: SourceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sign every update originating from this replica
    pub fn signer(mut self, signer: impl Sign<M::Payload> + 'static) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Verify every update from other sources
    pub fn verifier(mut self, verifier: impl Verify<M::Payload> + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Scuttlebutt<M> {
        let (notifications, _) = broadcast::channel(self.notify_capacity);
        let (dispose, _) = broadcast::channel(1);

        Scuttlebutt {
            inner: Arc::new(Inner {
                id: self.id.unwrap_or_else(SourceId::random),
                state: Mutex::new(State {
                    clock: VectorClock::new(),
                    model: self.model,
                    tails: BTreeMap::new(),
                    streams: 0,
                    clones: 0,
                }),
                signer: self.signer,
                verifier: self.verifier,
                notifications,
                notify_capacity: self.notify_capacity,
                dispose,
                next_session: AtomicU64::new(0),
            }),
        }
    }
}

impl<M: Model> Scuttlebutt<M> {
    pub fn builder(model: M) -> Builder<M> {
        Builder {
            model,
            id: None,
            signer: None,
            verifier: None,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }

    /// Create a replica with the given id, rejecting reserved ids
    pub fn new(model: M, id: &str) -> scuttlebutt_core::Result<Self> {
        Ok(Self::builder(model).id(SourceId::new(id)?).build())
    }

    pub fn id(&self) -> &SourceId {
        &self.inner.id
    }

    /// Snapshot of the vector clock
    pub fn clock(&self) -> VectorClock {
        self.inner.state.lock().clock.clone()
    }

    /// Number of open sessions
    pub fn streams(&self) -> usize {
        self.inner.state.lock().streams
    }

    /// Number of attached loopback clones
    pub fn clones(&self) -> usize {
        self.inner.state.lock().clones
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification<Payload<M>>> {
        self.inner.notifications.subscribe()
    }

    /// Read the data-type state
    pub fn read<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.inner.state.lock().model)
    }

    /// History the model would replay to a peer holding `peer`
    pub fn history(&self, peer: &VectorClock) -> Vec<Update<Payload<M>>> {
        self.inner.state.lock().model.history(peer)
    }

    /// Record a local mutation. Never suspends.
    ///
    /// Returns true if the model applied the update.
    pub fn local_update(&self, payload: Payload<M>) -> bool {
        let mut state = self.inner.state.lock();
        // Stamped under the lock so local updates are admitted in order
        let update = Update::new(payload, timestamp(), self.inner.id.clone());
        self.ingest_locked(&mut state, update)
    }

    /// Run an update through the ingestion pipeline and wait for the outcome.
    ///
    /// Stale, rejected and failed updates are reported as notifications and
    /// return false. Dropping the returned future does not cancel a pending
    /// verification; see [`Scuttlebutt::submit`].
    pub async fn ingest(&self, update: Update<Payload<M>>) -> bool {
        match self.submit(update) {
            Submitted::Done(applied) => applied,
            Submitted::Verifying(task) => task.await.unwrap_or(false),
        }
    }

    /// Hand an update to the ingestion pipeline without waiting on
    /// verification.
    ///
    /// The ledger check runs immediately. Updates from other sources are then
    /// verified on a task owned by the engine, so a stalled verifier holds up
    /// only that update and outlives the session it arrived on. Must be
    /// called from within a tokio runtime when a verifier is configured.
    pub fn submit(&self, update: Update<Payload<M>>) -> Submitted {
        let verifier = match &self.inner.verifier {
            Some(verifier) if update.source != self.inner.id => verifier.clone(),
            _ => {
                let mut state = self.inner.state.lock();
                return Submitted::Done(self.ingest_locked(&mut state, update));
            }
        };

        if !self.admit(&mut self.inner.state.lock(), &update) {
            return Submitted::Done(false);
        }

        let engine = self.clone();
        Submitted::Verifying(tokio::spawn(async move {
            engine.verify_and_apply(verifier, update).await
        }))
    }

    async fn verify_and_apply(
        &self,
        verifier: Arc<dyn Verify<Payload<M>>>,
        update: Update<Payload<M>>,
    ) -> bool {
        match verifier.verify(&update).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(source = %update.source, ts = %update.timestamp, "Unverified update");
                self.notify(Notification::UnverifiedData(update));
                return false;
            }
            Err(e) => {
                warn!(source = %update.source, ts = %update.timestamp, "Verification error: {}", e);
                self.notify(Notification::Error(e.to_string()));
                return false;
            }
        }

        let mut state = self.inner.state.lock();
        self.apply(&mut state, update)
    }

    /// Close every open session. Sessions opened afterwards are unaffected.
    pub fn dispose(&self) {
        debug!(id = %self.inner.id, "Disposing sessions");
        let _ = self.inner.dispose.send(());
        self.notify(Notification::Dispose);
    }

    fn ingest_locked(&self, state: &mut State<M>, mut update: Update<Payload<M>>) -> bool {
        if !self.admit(state, &update) {
            return false;
        }
        if update.source == self.inner.id && !self.sign(&mut update) {
            return false;
        }
        self.apply(state, update)
    }

    /// Ledger check and record
    fn admit(&self, state: &mut State<M>, update: &Update<Payload<M>>) -> bool {
        if !state.clock.observe(&update.source, update.timestamp) {
            debug!(source = %update.source, ts = %update.timestamp, "Old data");
            self.notify(Notification::OldData(update.clone()));
            return false;
        }
        true
    }

    fn sign(&self, update: &mut Update<Payload<M>>) -> bool {
        let Some(signer) = &self.inner.signer else {
            return true;
        };
        match signer.sign(update) {
            Ok(signature) => {
                update.signature = Some(signature);
                true
            }
            Err(e) => {
                warn!(ts = %update.timestamp, "Signing failed: {}", e);
                self.notify(Notification::Error(e.to_string()));
                false
            }
        }
    }

    /// Hand the update to the model and fan it out to every tail, in
    /// acceptance order.
    fn apply(&self, state: &mut State<M>, update: Update<Payload<M>>) -> bool {
        if !state.model.apply_update(&update) {
            debug!(source = %update.source, ts = %update.timestamp, "Model ignored update");
            return false;
        }
        for tail in state.tails.values_mut() {
            tail.forward(&update);
        }
        self.notify(Notification::Accepted(update));
        true
    }

    fn notify(&self, notification: Notification<Payload<M>>) {
        // No subscribers is fine
        let _ = self.inner.notifications.send(notification);
    }

    pub(crate) fn notify_capacity(&self) -> usize {
        self.inner.notify_capacity
    }

    /// Count a new session and hand it the dispose signal
    pub(crate) fn open_session(&self) -> (SessionId, broadcast::Receiver<()>) {
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().streams += 1;
        (session, self.inner.dispose.subscribe())
    }

    /// Queue history for `peer_clock`, start tailing if requested, then
    /// queue the sync marker.
    ///
    /// Runs as one critical section, so no update can land between the
    /// history and the tail. Returns the number of replayed updates.
    pub(crate) fn replay(
        &self,
        session: SessionId,
        peer_clock: VectorClock,
        outbound: &mpsc::UnboundedSender<Message<Payload<M>>>,
        tail: bool,
    ) -> usize {
        let mut state = self.inner.state.lock();

        let history = state.model.history(&peer_clock);
        let replayed = history.len();
        for update in history {
            let _ = outbound.send(Message::Update(update));
        }

        if tail {
            state.tails.insert(
                session,
                Tail {
                    peer_clock,
                    outbound: outbound.clone(),
                },
            );
        }

        let _ = outbound.send(Message::Sync);
        replayed
    }

    /// Unregister a session and report how many remain
    pub(crate) fn close_session(&self, session: SessionId) {
        let remaining = {
            let mut state = self.inner.state.lock();
            state.tails.remove(&session);
            state.streams = state.streams.saturating_sub(1);
            state.streams
        };
        self.notify(Notification::Unstream(remaining));
    }

    pub(crate) fn track_clone(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.clones += 1;
        state.clones
    }

    pub(crate) fn release_clone(&self) {
        let remaining = {
            let mut state = self.inner.state.lock();
            state.clones = state.clones.saturating_sub(1);
            state.clones
        };
        self.notify(Notification::Unclone(remaining));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Entry, KvStore};
    use async_trait::async_trait;
    use scuttlebutt_core::crypto::{Ed25519Signer, Ed25519Verifier};
    use scuttlebutt_core::{Signature, Timestamp};
    use serde_json::json;
    use tokio::sync::Notify;

    fn engine(id: &str) -> Scuttlebutt<KvStore> {
        Scuttlebutt::new(KvStore::new(), id).unwrap()
    }

    fn remote(key: &str, value: i64, ts: u64, source: &str) -> Update<Entry> {
        Update::new(
            Entry(key.to_string(), json!(value)),
            Timestamp(ts),
            SourceId::new(source).unwrap(),
        )
    }

    fn drain<P: Clone>(rx: &mut broadcast::Receiver<Notification<P>>) -> Vec<Notification<P>> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    struct Reject;

    #[async_trait]
    impl Verify<Entry> for Reject {
        async fn verify(&self, _update: &Update<Entry>) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct Broken;

    #[async_trait]
    impl Verify<Entry> for Broken {
        async fn verify(&self, _update: &Update<Entry>) -> anyhow::Result<bool> {
            anyhow::bail!("keyserver unreachable")
        }
    }

    /// Holds every verification until released
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Verify<Entry> for Gate {
        async fn verify(&self, _update: &Update<Entry>) -> anyhow::Result<bool> {
            self.0.notified().await;
            Ok(true)
        }
    }

    #[test]
    fn test_reserved_id_rejected() {
        assert!(Scuttlebutt::new(KvStore::new(), "__proto__").is_err());
        assert!(Scuttlebutt::new(KvStore::new(), "").is_err());
    }

    #[test]
    fn test_random_id_when_unset() {
        let a = Scuttlebutt::builder(KvStore::new()).build();
        let b = Scuttlebutt::builder(KvStore::new()).build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_local_update_advances_clock() {
        let a = engine("a");
        let mut notes = a.subscribe();

        assert!(a.local_update(Entry("x".into(), json!(1))));
        assert!(a.local_update(Entry("x".into(), json!(2))));

        let clock = a.clock();
        assert_eq!(clock.len(), 1);
        assert!(clock.get("a").is_some());
        assert_eq!(a.read(|kv| kv.get("x").cloned()), Some(json!(2)));

        let accepted = drain(&mut notes)
            .into_iter()
            .filter(|n| matches!(n, Notification::Accepted(_)))
            .count();
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let a = engine("a");
        let mut notes = a.subscribe();

        let update = remote("x", 1, 10, "b");
        assert!(a.ingest(update.clone()).await);
        assert!(!a.ingest(update).await);
        assert!(!a.ingest(remote("x", 7, 9, "b")).await);

        assert_eq!(a.read(|kv| kv.get("x").cloned()), Some(json!(1)));
        assert_eq!(a.clock().get("b"), Some(Timestamp(10)));

        let notes = drain(&mut notes);
        assert_eq!(notes.iter().filter(|n| matches!(n, Notification::Accepted(_))).count(), 1);
        assert_eq!(notes.iter().filter(|n| matches!(n, Notification::OldData(_))).count(), 2);
    }

    #[tokio::test]
    async fn test_unverified_update_dropped() {
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .verifier(Reject)
            .build();
        let mut notes = a.subscribe();

        assert!(!a.ingest(remote("x", 1, 10, "b")).await);
        assert_eq!(a.read(|kv| kv.get("x").cloned()), None);
        assert!(matches!(
            drain(&mut notes).as_slice(),
            [Notification::UnverifiedData(_)]
        ));

        // Local updates skip verification
        assert!(a.local_update(Entry("y".into(), json!(2))));
    }

    #[tokio::test]
    async fn test_verification_error_dropped_without_retry() {
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .verifier(Broken)
            .build();
        let mut notes = a.subscribe();

        assert!(!a.ingest(remote("x", 1, 10, "b")).await);
        match drain(&mut notes).as_slice() {
            [Notification::Error(message)] => assert!(message.contains("keyserver")),
            other => panic!("unexpected notifications: {:?}", other),
        }

        // The ledger already recorded it: a replay is old data
        assert!(!a.ingest(remote("x", 1, 10, "b")).await);
        assert!(matches!(drain(&mut notes).as_slice(), [Notification::OldData(_)]));
    }

    #[tokio::test]
    async fn test_stalled_verification_blocks_nothing_else() {
        let gate = Arc::new(Notify::new());
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .verifier(Gate(gate.clone()))
            .build();

        let pending = tokio::spawn({
            let a = a.clone();
            async move { a.ingest(remote("x", 1, 10, "b")).await }
        });
        tokio::task::yield_now().await;

        // The engine stays usable while verification is outstanding
        assert!(a.local_update(Entry("y".into(), json!(2))));
        assert_eq!(a.read(|kv| kv.get("x").cloned()), None);

        gate.notify_one();
        assert!(pending.await.unwrap());
        assert_eq!(a.read(|kv| kv.get("x").cloned()), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_cancelled_ingest_still_applies() {
        let gate = Arc::new(Notify::new());
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .verifier(Gate(gate.clone()))
            .build();
        let mut notes = a.subscribe();

        let waiting = tokio::spawn({
            let a = a.clone();
            async move { a.ingest(remote("x", 1, 10, "b")).await }
        });
        while !a.clock().contains("b") {
            tokio::task::yield_now().await;
        }
        waiting.abort();
        assert!(waiting.await.is_err());

        gate.notify_one();
        let accepted = tokio::time::timeout(std::time::Duration::from_secs(1), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(accepted, Notification::Accepted(_)));
        assert_eq!(a.read(|kv| kv.get("x").cloned()), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_ed25519_plugins() {
        let signer = Ed25519Signer::from_seed(&[3; 32]);
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .signer(signer.clone())
            .build();
        let verifier = Ed25519Verifier::new()
            .with_key(SourceId::new("a").unwrap(), &signer.public_key())
            .unwrap();
        let b = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("b").unwrap())
            .verifier(verifier)
            .build();

        assert!(a.local_update(Entry("x".into(), json!(1))));
        let history = a.history(&VectorClock::new());
        assert_eq!(history.len(), 1);
        assert!(history[0].signature.is_some());

        assert!(b.ingest(history[0].clone()).await);

        let mut forged = history[0].clone();
        forged.timestamp = Timestamp(forged.timestamp.0 + 1);
        assert!(!b.ingest(forged).await);
    }

    #[test]
    fn test_signing_error_drops_local_update() {
        let a = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new("a").unwrap())
            .signer(|_: &Update<Entry>| -> anyhow::Result<Signature> { anyhow::bail!("no key") })
            .build();
        let mut notes = a.subscribe();

        assert!(!a.local_update(Entry("x".into(), json!(1))));
        assert_eq!(a.read(|kv| kv.len()), 0);
        assert!(matches!(drain(&mut notes).as_slice(), [Notification::Error(_)]));
    }

    #[tokio::test]
    async fn test_tail_forwards_only_unseen() {
        let a = engine("a");
        let (session, _dispose) = a.open_session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let peer: VectorClock = [(SourceId::new("b").unwrap(), Timestamp(10))]
            .into_iter()
            .collect();
        assert_eq!(a.replay(session, peer, &tx, true), 0);
        assert_eq!(rx.try_recv().unwrap(), Message::Sync);

        // Peer already has b@10
        a.ingest(remote("x", 1, 10, "b")).await;
        a.ingest(remote("y", 2, 11, "b")).await;

        match rx.try_recv().unwrap() {
            Message::Update(update) => assert_eq!(update.timestamp, Timestamp(11)),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        a.close_session(session);
        a.ingest(remote("z", 3, 12, "b")).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(a.streams(), 0);
    }
}
