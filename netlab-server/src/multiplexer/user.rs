//! Terminal user attached to a multiplexer

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Inner, READ_BUFFER_SIZE};
use crate::telnet::{escape, ServerHandshake, TelnetSession, CTRL_L};

/// Drive one terminal user until it disconnects or the multiplexer closes
pub(super) async fn serve(inner: Arc<Inner>, id: u64, stream: TcpStream, cancel: CancellationToken) {
    let (mut reader, mut writer) = stream.into_split();
    let mut session = TelnetSession::new(ServerHandshake::new());

    let opening = session.start();
    if let Err(e) = writer.write_all(&opening).await {
        debug!(node = %inner.node, user_id = id, error = %e, "User gone before handshake");
        inner.users.remove(&id);
        return;
    }

    let mut output: Option<broadcast::Receiver<Bytes>> = None;
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(node = %inner.node, user_id = id, error = %e, "User read error");
                        break;
                    }
                };

                let feed = match session.feed(&buf[..n]) {
                    Ok(feed) => feed,
                    Err(e) => {
                        warn!(node = %inner.node, user_id = id, error = %e, "Terminal user rejected");
                        break;
                    }
                };

                if !feed.reply.is_empty() {
                    if let Err(e) = writer.write_all(&feed.reply).await {
                        debug!(node = %inner.node, user_id = id, error = %e, "User write error");
                        break;
                    }
                }

                if feed.became_ready {
                    info!(
                        node = %inner.node,
                        user_id = id,
                        user = session.negotiator().user().unwrap_or_default(),
                        "Terminal user attached"
                    );
                    output = Some(inner.output_tx.subscribe());
                    inner.send_upstream(vec![CTRL_L]).await;
                }

                if !feed.data.is_empty() {
                    inner.send_upstream(feed.data).await;
                }
            }

            chunk = next_output(&mut output) => {
                match chunk {
                    Ok(bytes) => {
                        if let Err(e) = writer.write_all(&escape(&bytes)).await {
                            debug!(node = %inner.node, user_id = id, error = %e, "User write error");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node = %inner.node, user_id = id, skipped, "User lagging behind console output");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    inner.users.remove(&id);
    debug!(node = %inner.node, user_id = id, "User detached");
}

/// Next console chunk, or never if the user is not subscribed yet
async fn next_output(output: &mut Option<broadcast::Receiver<Bytes>>) -> Result<Bytes, RecvError> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
