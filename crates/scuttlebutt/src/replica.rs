//! Loopback replicas

use crate::engine::Scuttlebutt;
use crate::model::Model;
use crate::session::SessionOptions;
use scuttlebutt_net::Link;
use tracing::{debug, info};

impl<M: Model + Default> Scuttlebutt<M> {
    /// Create a fresh replica with the same id, wired to this one through an
    /// in-process link.
    ///
    /// Resolves once the replica has caught up (or its session ended first).
    /// The link is unbounded, so neither side can stall the other. The
    /// replica carries no signer or verifier.
    pub async fn clone_replica(&self) -> Scuttlebutt<M> {
        let replica = Scuttlebutt::builder(M::default())
            .id(self.id().clone())
            .notify_capacity(self.notify_capacity())
            .build();

        let clones = self.track_clone();
        info!(id = %self.id(), clones, "Cloning replica");

        let (ours, theirs) = Link::pair();
        self.attach(SessionOptions::default().with_name("clone-source"), ours);
        let mut session = replica.attach(SessionOptions::default().with_name("clone"), theirs);

        let synced = session.synced().await;
        debug!(id = %self.id(), synced, "Replica ready");

        let source = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            source.release_clone();
        });

        replica
    }
}
