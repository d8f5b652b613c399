//! Console multiplexer
//!
//! Fans one upstream VM console connection out to any number of terminal
//! users connecting on a local listening port. The multiplexer plays the
//! telnet client towards the VM and the telnet server towards its users.
//!
//! ## State machine
//!
//! `Stopped -> Connecting -> Connected -> Running -> Closing -> Stopped`
//!
//! Terminal users connecting in any state other than `Running` receive the
//! configured not-ready message and are disconnected.

mod user;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ConsoleConfig;
use crate::prompt::PromptDetector;
use crate::telnet::{escape, ClientHandshake, TelnetSession};

/// Read buffer size for console sockets
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the upstream output broadcast
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the user input queue towards the console
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Multiplexer readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerState {
    Stopped,
    Connecting,
    Connected,
    Running,
    Closing,
}

/// Errors surfaced by [`Multiplexer::connect`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    #[error("Multiplexer already running")]
    AlreadyRunning,

    #[error("Failed to bind console listener: {0}")]
    Bind(String),

    #[error("Failed to connect to console {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Console handshake failed: {0}")]
    Handshake(String),

    #[error("Console handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Multiplexer closed while connecting")]
    Closed,
}

/// Sent to the owner when the console connection was closed by the VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerClosed {
    pub node: String,
}

/// Timing and addressing for one multiplexer
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub bind_host: String,
    pub upstream_host: String,
    pub connect_delay: Duration,
    pub handshake_timeout: Duration,
    pub not_ready_message: String,
}

impl From<&ConsoleConfig> for MultiplexerConfig {
    fn from(config: &ConsoleConfig) -> Self {
        Self {
            bind_host: config.bind_host.clone(),
            upstream_host: config.upstream_host.clone(),
            connect_delay: config.connect_delay(),
            handshake_timeout: config.handshake_timeout(),
            not_ready_message: config.not_ready_message.clone(),
        }
    }
}

struct Inner {
    node: String,
    upstream_port: u16,
    config: MultiplexerConfig,
    state: Mutex<MultiplexerState>,
    listen_port: Mutex<Option<u16>>,
    initialized: AtomicBool,
    cancel: Mutex<CancellationToken>,
    output_tx: broadcast::Sender<Bytes>,
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Connected terminal users by id
    users: DashMap<u64, CancellationToken>,
    next_user_id: AtomicU64,
    closed_tx: Option<mpsc::Sender<MultiplexerClosed>>,
}

/// Console multiplexer for one node
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("node", &self.inner.node)
            .field("upstream_port", &self.inner.upstream_port)
            .field("state", &self.state())
            .field("listen_port", &self.listen_port())
            .finish()
    }
}

impl Multiplexer {
    /// Console connection for `node` on `upstream_port`; closure by the VM
    /// is reported on `closed_tx` when given
    pub fn new(
        node: impl Into<String>,
        upstream_port: u16,
        config: MultiplexerConfig,
        closed_tx: Option<mpsc::Sender<MultiplexerClosed>>,
    ) -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                node: node.into(),
                upstream_port,
                config,
                state: Mutex::new(MultiplexerState::Stopped),
                listen_port: Mutex::new(None),
                initialized: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                output_tx,
                input_tx: Mutex::new(None),
                users: DashMap::new(),
                next_user_id: AtomicU64::new(1),
                closed_tx,
            }),
        }
    }

    pub fn state(&self) -> MultiplexerState {
        *self.inner.state.lock()
    }

    /// Port terminal users connect to, once bound
    pub fn listen_port(&self) -> Option<u16> {
        *self.inner.listen_port.lock()
    }

    /// True once the node's shell prompt has been seen on the console
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Queue raw bytes for the console; they are telnet-escaped on the way out
    #[cfg(test)]
    pub async fn send(&self, data: Vec<u8>) {
        self.inner.send_upstream(data).await;
    }

    /// Bind the user listener, dial the console, and run the handshake
    ///
    /// Returns the user listening port once the console is running. On
    /// failure the listener is closed and the multiplexer is back to
    /// `Stopped`.
    pub async fn connect(&self) -> Result<u16, MultiplexerError> {
        {
            let mut state = self.inner.state.lock();
            if *state != MultiplexerState::Stopped {
                return Err(MultiplexerError::AlreadyRunning);
            }
            *state = MultiplexerState::Connecting;
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        self.inner.initialized.store(false, Ordering::SeqCst);

        match self.establish(cancel).await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!(node = %self.inner.node, error = %e, "Console connect failed");
                self.close();
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: CancellationToken) -> Result<u16, MultiplexerError> {
        let inner = &self.inner;

        let listener = TcpListener::bind((inner.config.bind_host.as_str(), 0))
            .await
            .map_err(|e| MultiplexerError::Bind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| MultiplexerError::Bind(e.to_string()))?
            .port();
        *inner.listen_port.lock() = Some(port);
        debug!(node = %inner.node, port, "Console listener bound");

        tokio::spawn(accept_loop(self.inner.clone(), listener, cancel.clone()));

        tokio::select! {
            _ = cancel.cancelled() => return Err(MultiplexerError::Closed),
            _ = tokio::time::sleep(inner.config.connect_delay) => {}
        }

        let timeout = inner.config.handshake_timeout;
        let (stream, session, initial) = tokio::select! {
            _ = cancel.cancelled() => return Err(MultiplexerError::Closed),
            result = tokio::time::timeout(timeout, self.handshake()) => {
                result.map_err(|_| MultiplexerError::Timeout(timeout))??
            }
        };

        {
            let mut state = inner.state.lock();
            if *state != MultiplexerState::Connecting {
                return Err(MultiplexerError::Closed);
            }
            *state = MultiplexerState::Connected;
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        *inner.input_tx.lock() = Some(input_tx);

        let (reader, writer) = stream.into_split();
        tokio::spawn(upstream_loop(
            self.inner.clone(),
            reader,
            writer,
            session,
            initial,
            input_rx,
            cancel,
        ));

        *inner.state.lock() = MultiplexerState::Running;
        info!(node = %inner.node, port, upstream_port = inner.upstream_port, "Console running");
        Ok(port)
    }

    async fn handshake(
        &self,
    ) -> Result<(TcpStream, TelnetSession<ClientHandshake>, Vec<u8>), MultiplexerError> {
        let inner = &self.inner;
        let addr = format!("{}:{}", inner.config.upstream_host, inner.upstream_port);

        let mut stream =
            TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| MultiplexerError::Connect {
                    addr: addr.clone(),
                    message: e.to_string(),
                })?;

        let mut session = TelnetSession::new(ClientHandshake::new());
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| MultiplexerError::Handshake(e.to_string()))?;
            if n == 0 {
                return Err(MultiplexerError::Handshake(
                    "console closed during handshake".into(),
                ));
            }

            let feed = session
                .feed(&buf[..n])
                .map_err(|e| MultiplexerError::Handshake(e.to_string()))?;
            if !feed.reply.is_empty() {
                stream
                    .write_all(&feed.reply)
                    .await
                    .map_err(|e| MultiplexerError::Handshake(e.to_string()))?;
            }
            if feed.became_ready {
                debug!(node = %inner.node, "Console handshake complete");
                return Ok((stream, session, feed.data));
            }
        }
    }

    /// Close the listener, every user, and the console connection
    ///
    /// No-op when already stopped or closing.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Inner {
    fn state(&self) -> MultiplexerState {
        *self.state.lock()
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                MultiplexerState::Stopped | MultiplexerState::Closing => return,
                _ => *state = MultiplexerState::Closing,
            }
        }

        self.cancel.lock().cancel();
        for user in self.users.iter() {
            user.value().cancel();
        }
        self.users.clear();
        *self.input_tx.lock() = None;
        *self.listen_port.lock() = None;

        *self.state.lock() = MultiplexerState::Stopped;
        info!(node = %self.node, "Console closed");
    }

    async fn send_upstream(&self, data: Vec<u8>) {
        let sender = self.input_tx.lock().clone();
        match sender {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    debug!(node = %self.node, "Console gone, dropping input");
                }
            }
            None => debug!(node = %self.node, "Console not connected, dropping input"),
        }
    }

    fn publish(&self, data: Vec<u8>, prompt: &mut PromptDetector) {
        if data.is_empty() {
            return;
        }

        if prompt.observe(&data) && !self.initialized.swap(true, Ordering::SeqCst) {
            info!(node = %self.node, "Shell prompt observed, node initialized");
        }

        // No subscribers is not an error
        let _ = self.output_tx.send(Bytes::from(data));
    }

    async fn notify_closed(&self) {
        if let Some(tx) = &self.closed_tx {
            let notification = MultiplexerClosed {
                node: self.node.clone(),
            };
            if let Err(e) = tx.send(notification).await {
                warn!(node = %self.node, error = %e, "Failed to send console closed notification");
            }
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((mut stream, peer)) => {
                        if inner.state() != MultiplexerState::Running {
                            debug!(node = %inner.node, %peer, "Refusing user, console not ready");
                            let message = inner.config.not_ready_message.clone();
                            tokio::spawn(async move {
                                if let Err(e) = stream.write_all(message.as_bytes()).await {
                                    debug!(error = %e, "Failed to send not-ready message");
                                }
                                let _ = stream.shutdown().await;
                            });
                            continue;
                        }

                        let id = inner.next_user_id.fetch_add(1, Ordering::SeqCst);
                        let user_cancel = cancel.child_token();
                        inner.users.insert(id, user_cancel.clone());
                        debug!(node = %inner.node, user_id = id, %peer, "User connected");
                        tokio::spawn(user::serve(inner.clone(), id, stream, user_cancel));
                    }
                    Err(e) => {
                        warn!(node = %inner.node, error = %e, "Console accept error");
                    }
                }
            }
        }
    }
    debug!(node = %inner.node, "Console listener closed");
}

async fn upstream_loop(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut session: TelnetSession<ClientHandshake>,
    initial: Vec<u8>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut prompt = PromptDetector::new(&inner.node);
    inner.publish(initial, &mut prompt);

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let peer_closed = loop {
        tokio::select! {
            _ = cancel.cancelled() => break false,

            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(node = %inner.node, "Console closed by VM");
                        break true;
                    }
                    Ok(n) => match session.feed(&buf[..n]) {
                        Ok(feed) => {
                            if !feed.reply.is_empty() {
                                if let Err(e) = writer.write_all(&feed.reply).await {
                                    warn!(node = %inner.node, error = %e, "Console write error");
                                }
                            }
                            trace!(node = %inner.node, len = feed.data.len(), "Console output");
                            inner.publish(feed.data, &mut prompt);
                        }
                        Err(e) => {
                            warn!(node = %inner.node, error = %e, "Console negotiation error");
                        }
                    },
                    Err(e) => {
                        warn!(node = %inner.node, error = %e, "Console read error");
                        break true;
                    }
                }
            }

            Some(data) = input_rx.recv() => {
                if let Err(e) = writer.write_all(&escape(&data)).await {
                    warn!(node = %inner.node, error = %e, "Console write error");
                }
            }
        }
    };

    if peer_closed {
        inner.close();
        inner.notify_closed().await;
    }
}
