//! In-process message links
//!
//! A [`Link`] is one end of a full-duplex, unbounded message pipe. Sessions
//! run on one end; the other end is handed to a transport pump or straight to
//! another session. Links never apply backpressure, so a replica wired
//! through one can never stall.

use scuttlebutt_core::Message;
use tokio::sync::mpsc;

/// One end of a full-duplex message pipe
pub struct Link<P> {
    /// Messages sent to the other end
    pub tx: mpsc::UnboundedSender<Message<P>>,
    /// Messages received from the other end
    pub rx: mpsc::UnboundedReceiver<Message<P>>,
}

impl<P> Link<P> {
    /// Create two connected ends
    pub fn pair() -> (Link<P>, Link<P>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }

    /// Send a message; false once the other end has gone away
    pub fn send(&self, message: Message<P>) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Receive the next message; `None` once the other end has closed
    pub async fn recv(&mut self) -> Option<Message<P>> {
        self.rx.recv().await
    }

    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<Message<P>>,
        mpsc::UnboundedReceiver<Message<P>>,
    ) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (a, mut b) = Link::<u32>::pair();

        assert!(a.send(Message::Sync));
        assert_eq!(b.recv().await, Some(Message::Sync));
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (a, mut b) = Link::<u32>::pair();
        a.send(Message::Sync);
        drop(a);

        // Buffered messages are still delivered before the close
        assert_eq!(b.recv().await, Some(Message::Sync));
        assert_eq!(b.recv().await, None);
        assert!(!b.send(Message::Sync));
    }
}
