//! TCP transport
//!
//! Every message travels on its own connection as a single length-delimited
//! frame. Sends are fire-and-forget: failures are logged and the engine's
//! resend loops take care of the rest.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, instrument, trace, warn};
use unanimous::{Envelope, NodeId, Transport};

use crate::error::TransportError;

/// Largest frame either side will accept.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Inbound frames buffered before the listener applies backpressure.
const INBOUND_BUFFER: usize = 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Sends envelopes to peers listed by id.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    peers: Arc<HashMap<NodeId, String>>,
}

impl TcpTransport {
    /// `peers` maps node ids to `host:port`.
    #[must_use]
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        Self {
            peers: Arc::new(peers),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) {
        let Some(addr) = self.peers.get(&envelope.to).cloned() else {
            warn!(to = %envelope.to, "no address for peer, dropping message");
            return;
        };
        tokio::spawn(async move {
            match deliver(&addr, envelope.body).await {
                Ok(()) => trace!(to = %envelope.to, %addr, "delivered"),
                Err(report) => debug!(to = %envelope.to, ?report, "delivery failed"),
            }
        });
    }
}

/// Open a connection to `addr`, write `body` as one frame and close.
pub async fn deliver(addr: &str, body: Bytes) -> Result<(), Report<TransportError>> {
    let stream = TcpStream::connect(addr)
        .await
        .change_context(TransportError)
        .attach_with(|| format!("connecting to {addr}"))?;
    let mut writer = FramedWrite::new(stream, codec());
    writer
        .send(body)
        .await
        .change_context(TransportError)
        .attach_with(|| format!("writing frame to {addr}"))?;
    SinkExt::<Bytes>::close(&mut writer)
        .await
        .change_context(TransportError)?;
    Ok(())
}

/// Accept connections on `listener` and yield every frame received.
///
/// The accept loop runs until the returned stream is dropped.
///
/// # Panics
/// Must be called from within a Tokio runtime.
pub fn listen(listener: TcpListener) -> impl Stream<Item = Bytes> + Send + Unpin + 'static {
    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    tokio::spawn(accept_loop(listener, tx));
    ReceiverStream::new(rx)
}

#[instrument(skip_all, name = "listener")]
async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Bytes>) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            () = tx.closed() => {
                debug!("inbound consumer gone, closing listener");
                return;
            }
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(stream, codec());
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(frame) => {
                        if tx.send(frame.freeze()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "dropping connection");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unanimous::Message;

    #[tokio::test]
    async fn frames_cross_a_loopback_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut inbound = listen(listener);

        let transport = TcpTransport::new(HashMap::from([("n1".to_owned(), addr)]));
        let exec = Message::Exec {
            artifact: "pic1".into(),
        };
        let ack = Message::Ack {
            artifact: "pic1".into(),
            participant: "n1".into(),
        };
        transport.send(Envelope::new("n1", &exec));
        transport.send(Envelope::new("n1", &ack));

        let mut received = vec![
            unanimous::codec::decode(&inbound.next().await.unwrap()).unwrap(),
            unanimous::codec::decode(&inbound.next().await.unwrap()).unwrap(),
        ];
        received.sort_by_key(|m| m.kind().code());
        assert_eq!(received, [exec, ack]);
    }

    #[tokio::test]
    async fn unknown_peer_is_dropped() {
        let transport = TcpTransport::new(HashMap::new());
        transport.send(Envelope::new(
            "nobody",
            &Message::Abort {
                artifact: "pic1".into(),
            },
        ));
    }

    #[tokio::test]
    async fn delivery_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(deliver(&addr, Bytes::from_static(b"4!pic1@n1\0")).await.is_err());
    }
}
