//! Byte-stream transport
//!
//! Bridges a TCP connection (or any `AsyncRead + AsyncWrite`) to a [`Link`]
//! using the newline-delimited JSON codec.

use crate::framing::{FrameError, MessageCodec};
use crate::link::Link;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// TCP listener accepting replication connections
pub struct Transport {
    listener: TcpListener,
}

impl Transport {
    /// Bind a listener
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Dial a peer
    pub async fn connect(addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Move messages between `stream` and `link` until the connection ends.
///
/// When the link's outbound side closes the write half is shut down and
/// reading continues, so a one-shot session still receives the remote
/// history. Remote EOF, or the session dropping its end, ends the pump.
pub async fn pump<P, S>(stream: S, link: Link<P>) -> Result<(), TransportError>
where
    P: Serialize + DeserializeOwned,
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(reader, MessageCodec::<P>::new());
    let mut frames_out = FramedWrite::new(writer, MessageCodec::<P>::new());
    let (tx, mut rx) = link.split();
    let mut outbound_open = true;

    loop {
        tokio::select! {
            frame = frames_in.next() => match frame {
                Some(Ok(message)) => {
                    if tx.send(message).is_err() {
                        debug!("Session closed, dropping connection");
                        break;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!("Remote closed connection");
                    break;
                }
            },
            outgoing = rx.recv(), if outbound_open => match outgoing {
                Some(message) => frames_out.send(message).await?,
                None => {
                    debug!("Session finished sending, shutting down write half");
                    frames_out.close().await?;
                    outbound_open = false;
                }
            },
        }
    }

    Ok(())
}
