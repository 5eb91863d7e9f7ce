//! Scuttlebutt gossip replication
//!
//! Replicas exchange vector clock digests, replay whatever the other side is
//! missing, and then stream new updates as they are accepted. The replicated
//! data type plugs in through [`Model`]; [`KvStore`] and [`EventLog`] are
//! provided.
//!
//! ```no_run
//! use scuttlebutt::{KvStore, Scuttlebutt};
//!
//! # async fn demo() -> scuttlebutt_core::Result<()> {
//! let a = Scuttlebutt::new(KvStore::new(), "a")?;
//! a.set("x", 1)?;
//!
//! let b = a.clone_replica().await;
//! assert_eq!(b.get("x"), Some(serde_json::json!(1)));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod event_log;
pub mod kv;
pub mod model;
pub mod replica;
pub mod server;
pub mod session;

pub use engine::{Builder, Notification, Scuttlebutt, SessionId, Submitted};
pub use event_log::{Emission, EventLog, Listener};
pub use kv::{Entry, KvStore};
pub use model::Model;
pub use session::{PeerStream, SessionError, SessionEvent, SessionHandle, SessionOptions, SessionPhase};
