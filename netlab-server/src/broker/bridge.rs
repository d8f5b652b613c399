//! TCP bridge into the local broker
//!
//! Peers exchange length-prefixed JSON [`Envelope`] frames. An inbound frame
//! is delivered to the queue named by its routing key. Outbound, a peer
//! receives what is published on the reply keys it has used, plus every
//! workspace update.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netlab_protocol::routing::is_update_key;
use netlab_protocol::{Envelope, EnvelopeCodec, StatusReply};

use super::{LocalBroker, Published};

/// Bound bridge listener
#[derive(Debug)]
pub struct Bridge {
    listener: TcpListener,
}

impl Bridge {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept peers until `shutdown` is cancelled
    pub async fn run(self, broker: Arc<LocalBroker>, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Broker bridge listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New bridge peer from {}", peer_addr);
                            tokio::spawn(serve_peer(stream, peer_addr, broker.clone(), shutdown.clone()));
                        }
                        Err(e) => {
                            error!("Bridge accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping broker bridge");
                    break;
                }
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broker: Arc<LocalBroker>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, EnvelopeCodec::new());
    let mut published = broker.watch();
    let mut reply_keys: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            frame = framed.next() => {
                let envelope = match frame {
                    None => break,
                    Some(Ok(envelope)) => envelope,
                    Some(Err(e)) => {
                        warn!(peer = %peer_addr, error = %e, "Dropping bridge peer");
                        break;
                    }
                };

                if let Some(reply_to) = &envelope.reply_to {
                    reply_keys.insert(reply_to.clone());
                }

                let payload = match serde_json::to_vec(&envelope.payload) {
                    Ok(payload) => Bytes::from(payload),
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "Unserializable payload");
                        continue;
                    }
                };

                let Err(e) = broker
                    .deliver(&envelope.routing_key, envelope.reply_to.clone(), payload)
                    .await
                else {
                    continue;
                };

                warn!(peer = %peer_addr, queue = %envelope.routing_key, error = %e, "Undeliverable message");
                if let Some(reply_to) = envelope.reply_to {
                    let reply = serde_json::to_value(StatusReply::error(e.to_string())).unwrap_or_default();
                    if framed.send(Envelope::new(reply_to, reply)).await.is_err() {
                        break;
                    }
                }
            }

            message = published.recv() => {
                match message {
                    Ok(message) => {
                        if !reply_keys.contains(&message.routing_key) && !is_update_key(&message.routing_key) {
                            continue;
                        }
                        if let Err(e) = framed.send(to_envelope(message)).await {
                            debug!(peer = %peer_addr, error = %e, "Bridge peer write failed");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(peer = %peer_addr, skipped, "Bridge peer lagging behind publishes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    debug!(peer = %peer_addr, "Bridge peer disconnected");
}

fn to_envelope(message: Published) -> Envelope {
    let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
    });
    Envelope::new(message.routing_key, payload)
}
