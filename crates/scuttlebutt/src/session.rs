//! Replication sessions
//!
//! A session is one end of a duplex stream between two replicas. It opens by
//! sending a digest of its engine's clock, answers the peer's digest with the
//! history the peer is missing followed by `SYNC`, and then tails new
//! updates until either side goes away.
//!
//! ```text
//! HandshakePending --digest--> HistorySent --SYNC--> Synced
//!        \                          \                   \
//!         +--------------------------+-------------------+--> Closed
//! ```

use crate::engine::{Payload, Scuttlebutt, SessionId};
use crate::model::Model;
use scuttlebutt_core::clock::validate;
use scuttlebutt_core::{Digest, Message, Update, VectorClock};
use scuttlebutt_net::Link;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Protocol violations that terminate a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("peer digest carries no clock")]
    MissingClock,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    HandshakePending,
    HistorySent,
    Synced,
    Closed,
}

/// Events observable on a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Peer digest accepted and history queued
    Header(Digest),
    /// This side finished sending history
    SyncSent,
    /// Peer finished sending history
    SyncReceived,
    /// Both sides are past history. Emitted once.
    Synced,
    Error(SessionError),
    Closed,
}

/// Per-session options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Send history and live updates to the peer
    pub readable: bool,
    /// Accept updates from the peer
    pub writable: bool,
    /// Keep forwarding after history; when false the session ends once synced
    pub tail: bool,
    /// Send our digest even when not readable
    pub send_clock: bool,
    /// Wait for the peer digest even when not writable
    pub expect_clock: bool,
    /// Opaque value carried in our digest
    pub meta: Option<Value>,
    /// Label for logs
    pub name: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            tail: true,
            send_clock: false,
            expect_clock: false,
            meta: None,
            name: None,
        }
    }
}

impl SessionOptions {
    /// Only sends to the peer
    pub fn read_only() -> Self {
        Self {
            writable: false,
            ..Self::default()
        }
    }

    /// Only receives from the peer
    pub fn write_only() -> Self {
        Self {
            readable: false,
            ..Self::default()
        }
    }

    pub fn with_tail(mut self, tail: bool) -> Self {
        self.tail = tail;
        self
    }

    pub fn with_send_clock(mut self, send_clock: bool) -> Self {
        self.send_clock = send_clock;
        self
    }

    pub fn with_expect_clock(mut self, expect_clock: bool) -> Self {
        self.expect_clock = expect_clock;
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Handle to a running session
pub struct SessionHandle {
    id: SessionId,
    events: broadcast::Receiver<SessionEvent>,
    sender: broadcast::Sender<SessionEvent>,
    phase: watch::Receiver<SessionPhase>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Events since the session was created
    pub fn events(&mut self) -> &mut broadcast::Receiver<SessionEvent> {
        &mut self.events
    }

    /// Additional receiver seeing events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Wait until the session is synced. False if it closed first.
    pub async fn synced(&mut self) -> bool {
        loop {
            match self.events.recv().await {
                Ok(SessionEvent::Synced) => return true,
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return false,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end
    pub async fn closed(self) {
        let _ = self.task.await;
    }

    /// Tear the session down without waiting for the peer
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// A session plus the far end of its link, ready to be pumped over a
/// transport or attached to another engine.
pub struct PeerStream<P> {
    pub link: Link<P>,
    pub session: SessionHandle,
}

impl<M: Model> Scuttlebutt<M> {
    /// Run a session over `link`.
    ///
    /// Setup happens before this returns: the digest is already queued on
    /// the link and, for read-only sessions, so is the history.
    pub fn attach(&self, options: SessionOptions, link: Link<Payload<M>>) -> SessionHandle {
        let (id, dispose) = self.open_session();
        let (sender, events) = broadcast::channel(EVENT_CAPACITY);
        let (outbound, inbound) = link.split();
        let (phase_tx, phase) = watch::channel(SessionPhase::HandshakePending);

        let mut session = Session {
            id,
            engine: self.clone(),
            label: options.name.clone().unwrap_or_else(|| format!("session-{}", id)),
            sync_sent: !options.readable,
            sync_recv: !options.writable,
            options,
            outbound: Some(outbound),
            events: sender.clone(),
            phase: phase_tx,
            started: false,
            closed: false,
        };
        session.open();

        let task = tokio::spawn(session.run(inbound, dispose));
        SessionHandle {
            id,
            events,
            sender,
            phase,
            task,
        }
    }

    /// Create a session and return the far end of its link
    pub fn create_stream(&self, options: SessionOptions) -> PeerStream<Payload<M>> {
        let (ours, theirs) = Link::pair();
        let session = self.attach(options, ours);
        PeerStream {
            link: theirs,
            session,
        }
    }

    /// Session that only receives updates
    pub fn create_write_stream(&self) -> PeerStream<Payload<M>> {
        self.create_stream(SessionOptions::write_only())
    }

    /// Session that only sends updates
    pub fn create_read_stream(&self) -> PeerStream<Payload<M>> {
        self.create_stream(SessionOptions::read_only())
    }
}

struct Session<M: Model> {
    id: SessionId,
    engine: Scuttlebutt<M>,
    options: SessionOptions,
    label: String,
    outbound: Option<mpsc::UnboundedSender<Message<Payload<M>>>>,
    events: broadcast::Sender<SessionEvent>,
    phase: watch::Sender<SessionPhase>,
    sync_sent: bool,
    sync_recv: bool,
    started: bool,
    closed: bool,
}

impl<M: Model> Session<M> {
    fn open(&mut self) {
        let digest = Digest::new(self.engine.id().clone(), self.engine.clock())
            .with_meta(self.options.meta.clone());

        if self.options.readable {
            self.send(Message::Digest(digest));
            if !self.options.writable && !self.options.expect_clock {
                // Peer will never send a digest; replay everything
                self.start(Digest::empty(), VectorClock::new());
            }
        } else if self.options.send_clock {
            self.send(Message::Digest(digest));
        }
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Message<Payload<M>>>,
        mut dispose: broadcast::Receiver<()>,
    ) {
        while !self.finished() {
            let message = tokio::select! {
                biased;
                _ = dispose.recv() => {
                    debug!(session = %self.label, "Disposed");
                    break;
                }
                message = inbound.recv() => message,
            };
            let Some(message) = message else {
                debug!(session = %self.label, "Peer closed");
                break;
            };

            if let Err(e) = self.handle(message) {
                warn!(session = %self.label, "Protocol error: {}", e);
                self.emit(SessionEvent::Error(e));
                break;
            }
        }

        self.close();
    }

    fn handle(&mut self, message: Message<Payload<M>>) -> Result<(), SessionError> {
        match message {
            Message::Update(update) => self.on_update(update),
            Message::Digest(digest) => {
                let clock = digest.clock.clone().ok_or(SessionError::MissingClock)?;
                self.start(digest, clock);
            }
            Message::Sync => self.on_sync(),
        }
        Ok(())
    }

    fn on_update(&mut self, update: Update<Payload<M>>) {
        if !self.options.writable {
            trace!(session = %self.label, "Dropping update on non-writable session");
            return;
        }
        if !validate(&update) {
            debug!(session = %self.label, source = %update.source, "Invalid update");
            return;
        }
        // Verification, if any, completes on its own task
        let _ = self.engine.submit(update);
    }

    fn start(&mut self, header: Digest, peer_clock: VectorClock) {
        if self.started {
            debug!(session = %self.label, "Ignoring repeated digest");
            return;
        }
        self.started = true;

        if !self.options.readable {
            self.emit(SessionEvent::Header(header));
            return;
        }

        if let Some(outbound) = &self.outbound {
            let replayed = self
                .engine
                .replay(self.id, peer_clock, outbound, self.options.tail);
            debug!(session = %self.label, replayed, "History sent");
        }

        self.sync_sent = true;
        self.phase.send_replace(SessionPhase::HistorySent);
        self.emit(SessionEvent::Header(header));
        self.emit(SessionEvent::SyncSent);

        if !self.options.tail {
            // Closes our side of the stream once the queue drains
            self.outbound = None;
        }
        if self.sync_recv {
            self.mark_synced();
        }
    }

    fn on_sync(&mut self) {
        self.sync_recv = true;
        self.emit(SessionEvent::SyncReceived);
        if self.sync_sent {
            self.mark_synced();
        }
    }

    fn mark_synced(&mut self) {
        if *self.phase.borrow() == SessionPhase::Synced {
            return;
        }
        self.phase.send_replace(SessionPhase::Synced);
        info!(session = %self.label, "Synced");
        self.emit(SessionEvent::Synced);
    }

    fn finished(&self) -> bool {
        !self.options.tail && *self.phase.borrow() == SessionPhase::Synced
    }

    fn send(&self, message: Message<Payload<M>>) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(message);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound = None;
        self.phase.send_replace(SessionPhase::Closed);
        self.engine.close_session(self.id);
        debug!(session = %self.label, "Closed");
        self.emit(SessionEvent::Closed);
    }
}

impl<M: Model> Drop for Session<M> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Notification;
    use crate::kv::{Entry, KvStore};
    use async_trait::async_trait;
    use scuttlebutt_core::crypto::Verify;
    use scuttlebutt_core::{SourceId, Timestamp};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    fn engine(id: &str) -> Scuttlebutt<KvStore> {
        Scuttlebutt::new(KvStore::new(), id).unwrap()
    }

    /// Verifier that holds each update until released
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Verify<Entry> for Gate {
        async fn verify(&self, _update: &Update<Entry>) -> anyhow::Result<bool> {
            self.0.notified().await;
            Ok(true)
        }
    }

    fn gated(id: &str) -> (Scuttlebutt<KvStore>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let engine = Scuttlebutt::builder(KvStore::new())
            .id(SourceId::new(id).unwrap())
            .verifier(Gate(gate.clone()))
            .build();
        (engine, gate)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    async fn next_message(link: &mut Link<Entry>) -> Message<Entry> {
        timeout(Duration::from_secs(1), link.recv())
            .await
            .expect("timed out")
            .expect("link closed")
    }

    async fn next_event(handle: &mut SessionHandle) -> SessionEvent {
        timeout(Duration::from_secs(1), handle.events().recv())
            .await
            .expect("timed out")
            .expect("events closed")
    }

    fn update(key: &str, ts: u64, source: &str) -> Update<Entry> {
        Update::new(
            Entry(key.to_string(), json!(ts)),
            Timestamp(ts),
            SourceId::new(source).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_handshake_sends_digest_then_history_then_sync() {
        let a = engine("a");
        a.set("x", 1).unwrap();

        let PeerStream { mut link, mut session } = a.create_stream(SessionOptions::default());

        match next_message(&mut link).await {
            Message::Digest(digest) => {
                assert_eq!(digest.id.unwrap().as_str(), "a");
                assert!(digest.clock.unwrap().contains("a"));
            }
            other => panic!("expected digest, got {:?}", other),
        }

        link.send(Message::Digest(Digest::new(
            SourceId::new("b").unwrap(),
            VectorClock::new(),
        )));

        assert!(matches!(next_message(&mut link).await, Message::Update(_)));
        assert_eq!(next_message(&mut link).await, Message::Sync);

        link.send(Message::Sync);
        assert!(session.synced().await);
    }

    #[tokio::test]
    async fn test_history_filtered_by_peer_clock() {
        let a = engine("a");
        let b_first = update("x", 5, "b");
        let b_second = update("y", 6, "b");
        a.ingest(b_first).await;
        a.ingest(b_second).await;

        let PeerStream { mut link, session: _session } = a.create_stream(SessionOptions::default());
        next_message(&mut link).await;

        let peer: VectorClock = [(SourceId::new("b").unwrap(), Timestamp(5))]
            .into_iter()
            .collect();
        link.send(Message::Digest(Digest::new(SourceId::new("b").unwrap(), peer)));

        match next_message(&mut link).await {
            Message::Update(update) => assert_eq!(update.timestamp, Timestamp(6)),
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(next_message(&mut link).await, Message::Sync);
    }

    #[tokio::test]
    async fn test_synced_emitted_once() {
        let a = engine("a");
        let PeerStream { mut link, mut session } = a.create_stream(SessionOptions::default());

        link.send(Message::Digest(Digest::empty()));
        link.send(Message::Sync);
        link.send(Message::Digest(Digest::empty()));
        link.send(Message::Sync);

        // Header, SyncSent, SyncReceived, Synced, SyncReceived
        let mut synced = 0;
        let mut headers = 0;
        for _ in 0..5 {
            match next_event(&mut session).await {
                SessionEvent::Synced => synced += 1,
                SessionEvent::Header(_) => headers += 1,
                _ => {}
            }
        }
        assert_eq!(synced, 1);
        assert_eq!(headers, 1);

        // Only one SYNC went out despite the repeated digest
        let mut syncs = 0;
        while let Ok(message) = link.rx.try_recv() {
            if message == Message::Sync {
                syncs += 1;
            }
        }
        assert_eq!(syncs, 1);
    }

    #[tokio::test]
    async fn test_missing_clock_is_protocol_error() {
        let a = engine("a");
        let mut notes = a.subscribe();
        let PeerStream { link, mut session } = a.create_stream(SessionOptions::default());

        link.send(Message::Digest(Digest::default()));

        assert_eq!(
            next_event(&mut session).await,
            SessionEvent::Error(SessionError::MissingClock)
        );
        assert_eq!(next_event(&mut session).await, SessionEvent::Closed);
        assert_eq!(a.streams(), 0);

        let unstream = timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(Notification::Unstream(n)) = notes.recv().await {
                    return n;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(unstream, 0);
    }

    #[tokio::test]
    async fn test_read_only_session_replays_immediately() {
        let a = engine("a");
        a.set("x", 1).unwrap();

        let PeerStream { mut link, mut session } = a.create_read_stream();

        assert!(matches!(next_message(&mut link).await, Message::Digest(_)));
        assert!(matches!(next_message(&mut link).await, Message::Update(_)));
        assert_eq!(next_message(&mut link).await, Message::Sync);
        assert!(session.synced().await);

        // Inbound updates are ignored
        link.send(Message::Update(update("y", 3, "b")));
        a.set("z", 2).unwrap();
        assert!(matches!(next_message(&mut link).await, Message::Update(_)));
        assert_eq!(a.get("y"), None);
    }

    #[tokio::test]
    async fn test_write_only_session_never_sends_history() {
        let a = engine("a");
        a.set("x", 1).unwrap();

        let PeerStream { mut link, mut session } = a.create_write_stream();

        link.send(Message::Update(update("y", 3, "b")));
        link.send(Message::Sync);
        assert!(session.synced().await);
        assert_eq!(a.get("y"), Some(json!(3)));

        a.set("z", 2).unwrap();
        assert!(link.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_only_with_send_clock() {
        let a = engine("a");
        let PeerStream { mut link, session: _session } =
            a.create_stream(SessionOptions::write_only().with_send_clock(true));

        assert!(matches!(next_message(&mut link).await, Message::Digest(_)));
    }

    #[tokio::test]
    async fn test_non_tailing_session_ends_after_sync() {
        let a = engine("a");
        a.set("x", 1).unwrap();

        let PeerStream { mut link, session } =
            a.create_stream(SessionOptions::default().with_tail(false));

        next_message(&mut link).await;
        link.send(Message::Digest(Digest::empty()));
        link.send(Message::Sync);

        assert!(matches!(next_message(&mut link).await, Message::Update(_)));
        assert_eq!(next_message(&mut link).await, Message::Sync);

        timeout(Duration::from_secs(1), session.closed()).await.unwrap();
        assert!(link.recv().await.is_none());
        assert_eq!(a.streams(), 0);
    }

    #[tokio::test]
    async fn test_dispose_closes_sessions() {
        let a = engine("a");
        let first = a.create_stream(SessionOptions::default());
        let second = a.create_stream(SessionOptions::default());
        assert_eq!(a.streams(), 2);

        a.dispose();

        timeout(Duration::from_secs(1), first.session.closed()).await.unwrap();
        timeout(Duration::from_secs(1), second.session.closed()).await.unwrap();
        assert_eq!(a.streams(), 0);

        // Later sessions are unaffected
        let third = a.create_stream(SessionOptions::default());
        tokio::task::yield_now().await;
        assert!(!third.session.is_finished());
    }

    #[tokio::test]
    async fn test_peer_drop_closes_session() {
        let a = engine("a");
        let PeerStream { link, mut session } = a.create_stream(SessionOptions::default());
        drop(link);

        loop {
            if next_event(&mut session).await == SessionEvent::Closed {
                break;
            }
        }
        assert_eq!(a.streams(), 0);
    }

    #[tokio::test]
    async fn test_digest_meta_is_sent() {
        let a = engine("a");
        let PeerStream { mut link, session: _session } =
            a.create_stream(SessionOptions::default().with_meta(json!({"role": "hub"})));

        match next_message(&mut link).await {
            Message::Digest(digest) => assert_eq!(digest.meta, Some(json!({"role": "hub"}))),
            other => panic!("expected digest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_verification_does_not_hold_sync() {
        let (a, gate) = gated("a");
        let PeerStream { link, mut session } = a.create_stream(SessionOptions::default());

        link.send(Message::Digest(Digest::empty()));
        link.send(Message::Update(update("x", 10, "b")));
        link.send(Message::Sync);

        assert!(timeout(Duration::from_secs(1), session.synced()).await.unwrap());
        assert_eq!(a.get("x"), None);

        gate.notify_one();
        wait_until(|| a.get("x") == Some(json!(10))).await;
    }

    #[tokio::test]
    async fn test_dispose_keeps_pending_verification() {
        let (a, gate) = gated("a");
        let PeerStream { link, session } = a.create_stream(SessionOptions::default());

        link.send(Message::Digest(Digest::empty()));
        link.send(Message::Update(update("x", 10, "b")));
        wait_until(|| a.clock().get("b") == Some(Timestamp(10))).await;

        a.dispose();
        timeout(Duration::from_secs(1), session.closed()).await.unwrap();
        assert_eq!(a.streams(), 0);

        gate.notify_one();
        wait_until(|| a.get("x") == Some(json!(10))).await;
    }

    #[tokio::test]
    async fn test_phase_follows_lifecycle() {
        let a = engine("a");
        let PeerStream { link, mut session } = a.create_stream(SessionOptions::default());
        assert_eq!(session.phase(), SessionPhase::HandshakePending);

        link.send(Message::Digest(Digest::empty()));
        while next_event(&mut session).await != SessionEvent::SyncSent {}
        assert_eq!(session.phase(), SessionPhase::HistorySent);

        link.send(Message::Sync);
        assert!(session.synced().await);
        assert_eq!(session.phase(), SessionPhase::Synced);

        drop(link);
        while next_event(&mut session).await != SessionEvent::Closed {}
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_read_only_session_synced_before_spawn() {
        let a = engine("a");
        let PeerStream { link: _link, session } = a.create_read_stream();
        assert_eq!(session.phase(), SessionPhase::Synced);
    }
}
