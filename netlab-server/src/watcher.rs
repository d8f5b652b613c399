//! Network watcher
//!
//! Logs into a node's second console, starts `ip -4 monitor address` once
//! the shell prompt shows up, and turns every reported IPv4 address on an
//! `ethN` interface into a [`WatcherEvent`].

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ConsoleConfig, WatcherConfig};
use crate::prompt::PromptDetector;
use crate::telnet::{ClientHandshake, TelnetSession};

/// Command typed into the watch console
pub const MONITOR_COMMAND: &str = "ip -4 monitor address\r\n";

const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the event channel handed to the owner
const EVENT_CHANNEL_CAPACITY: usize = 64;

lazy_static! {
    static ref ADDRESS_REGEX: Regex =
        Regex::new(r"^\d+: +(eth\d+) +inet +(\d+\.\d+\.\d+\.\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Connecting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    #[error("Watcher already running")]
    AlreadyRunning,

    #[error("Gave up on watch console after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Watcher stopped while connecting")]
    Stopped,
}

/// Events produced by a running watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// An address was assigned to an interface
    Address { interface: String, address: String },
    /// The watch console went away
    Closed,
}

/// Addressing and retry policy for one watcher
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub host: String,
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub handshake_timeout: Duration,
}

impl WatcherOptions {
    pub fn from_config(console: &ConsoleConfig, watcher: &WatcherConfig) -> Self {
        Self {
            host: console.upstream_host.clone(),
            retry_interval: watcher.retry_interval(),
            max_attempts: watcher.max_attempts,
            handshake_timeout: console.handshake_timeout(),
        }
    }
}

/// Address monitor for one node
#[derive(Debug, Clone)]
pub struct Watcher {
    node: String,
    port: u16,
    options: WatcherOptions,
    state: Arc<Mutex<WatcherState>>,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl Watcher {
    pub fn new(node: impl Into<String>, port: u16, options: WatcherOptions) -> Self {
        Self {
            node: node.into(),
            port,
            options,
            state: Arc::new(Mutex::new(WatcherState::Stopped)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    #[cfg(test)]
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    /// Connect with bounded retries and start streaming events
    ///
    /// Each call gets a fresh attempt budget.
    pub async fn connect(&self) -> Result<mpsc::Receiver<WatcherEvent>, WatcherError> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Stopped {
                return Err(WatcherError::AlreadyRunning);
            }
            *state = WatcherState::Connecting;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;
        let (stream, session, initial) = loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => Err("stopped while connecting".to_string()),
                result = self.attempt() => result,
            };

            match result {
                Ok(connected) => break connected,
                Err(e) if cancel.is_cancelled() => {
                    debug!(node = %self.node, error = %e, "Watcher connect abandoned");
                    *self.state.lock() = WatcherState::Stopped;
                    return Err(WatcherError::Stopped);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(node = %self.node, port = self.port, attempts = attempt, error = %e, "Watcher giving up");
                    *self.state.lock() = WatcherState::Stopped;
                    return Err(WatcherError::RetriesExhausted { attempts: attempt });
                }
                Err(e) => {
                    debug!(node = %self.node, attempt, error = %e, "Watcher connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(node = %self.node, "Watcher stopped during backoff");
                            *self.state.lock() = WatcherState::Stopped;
                            return Err(WatcherError::Stopped);
                        }
                        _ = tokio::time::sleep(self.options.retry_interval) => {}
                    }
                }
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.state.lock() = WatcherState::Running;
        info!(node = %self.node, port = self.port, "Watcher running");

        tokio::spawn(run(self.clone(), stream, session, initial, events_tx, cancel));
        Ok(events_rx)
    }

    async fn attempt(
        &self,
    ) -> Result<(TcpStream, TelnetSession<ClientHandshake>, Vec<u8>), String> {
        let addr = format!("{}:{}", self.options.host, self.port);
        let handshake = async {
            let mut stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| e.to_string())?;
            let mut session = TelnetSession::new(ClientHandshake::new());
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                let n = stream.read(&mut buf).await.map_err(|e| e.to_string())?;
                if n == 0 {
                    return Err("console closed during handshake".to_string());
                }
                let feed = session.feed(&buf[..n]).map_err(|e| e.to_string())?;
                if !feed.reply.is_empty() {
                    stream
                        .write_all(&feed.reply)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                if feed.became_ready {
                    return Ok((stream, session, feed.data));
                }
            }
        };

        tokio::time::timeout(self.options.handshake_timeout, handshake)
            .await
            .map_err(|_| "handshake timed out".to_string())?
    }

    /// Stop watching; no close event is reported
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, WatcherState::Stopped | WatcherState::Stopping) {
                return;
            }
            *state = WatcherState::Stopping;
        }
        self.cancel.lock().cancel();
        *self.state.lock() = WatcherState::Stopped;
    }
}

async fn run(
    watcher: Watcher,
    stream: TcpStream,
    mut session: TelnetSession<ClientHandshake>,
    initial: Vec<u8>,
    events: mpsc::Sender<WatcherEvent>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut monitor = Monitor::new(&watcher.node);
    monitor.handle(&initial, &mut writer, &events).await;

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let peer_closed = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break false,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break true,
                Ok(n) => n,
                Err(e) => {
                    warn!(node = %watcher.node, error = %e, "Watch console read error");
                    break true;
                }
            },
        };

        let feed = match session.feed(&buf[..n]) {
            Ok(feed) => feed,
            Err(e) => {
                warn!(node = %watcher.node, error = %e, "Watch console negotiation error");
                continue;
            }
        };
        if !feed.reply.is_empty() {
            if let Err(e) = writer.write_all(&feed.reply).await {
                warn!(node = %watcher.node, error = %e, "Watch console write error");
            }
        }
        monitor.handle(&feed.data, &mut writer, &events).await;
    };

    if peer_closed {
        *watcher.state.lock() = WatcherState::Stopped;
        info!(node = %watcher.node, "Watch console closed");
        if events.send(WatcherEvent::Closed).await.is_err() {
            debug!(node = %watcher.node, "Watcher close event dropped by owner");
        }
    }
}

/// Console text state: waiting for the prompt, then parsing monitor lines
struct Monitor {
    node: String,
    prompt: PromptDetector,
    lines: LineBuffer,
    monitoring: bool,
}

impl Monitor {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            prompt: PromptDetector::new(node),
            lines: LineBuffer::default(),
            monitoring: false,
        }
    }

    async fn handle<W>(&mut self, data: &[u8], writer: &mut W, events: &mpsc::Sender<WatcherEvent>)
    where
        W: AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return;
        }

        if !self.monitoring {
            if self.prompt.observe(data) {
                debug!(node = %self.node, "Starting address monitor");
                if let Err(e) = writer.write_all(MONITOR_COMMAND.as_bytes()).await {
                    warn!(node = %self.node, error = %e, "Watch console write error");
                }
                self.monitoring = true;
            }
            return;
        }

        for line in self.lines.push(data) {
            trace!(node = %self.node, %line, "Watch console line");
            if let Some((interface, address)) = parse_address(&line) {
                debug!(node = %self.node, %interface, %address, "Address change");
                if events
                    .send(WatcherEvent::Address { interface, address })
                    .await
                    .is_err()
                {
                    debug!(node = %self.node, "Watcher events dropped by owner");
                }
            }
        }
    }
}

/// Splits console output into ANSI-free text lines
#[derive(Debug, Default)]
struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.partial.drain(..=end).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let clean = strip_ansi_escapes::strip(&raw);
            lines.push(String::from_utf8_lossy(&clean).into_owned());
        }
        lines
    }
}

/// Extract `(interface, address)` from one `ip monitor` line
pub fn parse_address(line: &str) -> Option<(String, String)> {
    let captures = ADDRESS_REGEX.captures(line)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    use crate::testing::FakeConsole;

    fn options(max_attempts: u32) -> WatcherOptions {
        WatcherOptions {
            host: "127.0.0.1".into(),
            retry_interval: Duration::from_millis(10),
            max_attempts,
            handshake_timeout: Duration::from_secs(2),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WatcherEvent>) -> WatcherEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_parse_address_line() {
        assert_eq!(
            parse_address("3: eth1    inet 10.0.0.2/24 scope global eth1"),
            Some(("eth1".into(), "10.0.0.2".into()))
        );
        assert_eq!(parse_address("3: lo    inet 127.0.0.1/8 scope host lo"), None);
        assert_eq!(parse_address("Deleted 3: eth1 inet 10.0.0.2/24"), None);
        assert_eq!(parse_address("ip -4 monitor address"), None);
    }

    #[test]
    fn test_line_buffer_splits_and_strips() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"2: eth0 in").is_empty());
        let lines = buf.push(b"et 1.2.3.4/8\r\n\x1b[01;32mnext\x1b[0m\n3:");
        assert_eq!(lines, vec!["2: eth0 inet 1.2.3.4/8".to_string(), "next".to_string()]);
        assert_eq!(buf.push(b" x\n"), vec!["3: x".to_string()]);
    }

    #[tokio::test]
    async fn test_reports_addresses_in_order() {
        let mut console = FakeConsole::start("pc1").await;
        let watcher = Watcher::new("pc1", console.port, options(4));
        let mut events = watcher.connect().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);

        console.expect(MONITOR_COMMAND.as_bytes()).await;
        console.send(b"ip -4 monitor address\r\n2: eth0    inet 10.0.0.1/24 scope global eth0\r\n");
        console.send(b"garbage\r\n3: eth1    inet 192.168.1.7/24 brd 192.168.1.255\r\n");

        assert_eq!(
            next_event(&mut events).await,
            WatcherEvent::Address {
                interface: "eth0".into(),
                address: "10.0.0.1".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            WatcherEvent::Address {
                interface: "eth1".into(),
                address: "192.168.1.7".into()
            }
        );
        watcher.stop();
    }

    #[tokio::test]
    async fn test_close_reported_once() {
        let console = FakeConsole::start("pc1").await;
        let watcher = Watcher::new("pc1", console.port, options(4));
        let mut events = watcher.connect().await.unwrap();

        console.halt();
        assert_eq!(next_event(&mut events).await, WatcherEvent::Closed);
        assert!(
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_retry_budget_is_four_attempts() {
        // Accepts and immediately hangs up, so every handshake fails
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let watcher = Watcher::new("pc1", port, options(4));
        let result = watcher.connect().await;
        assert_eq!(result.err(), Some(WatcherError::RetriesExhausted { attempts: 4 }));
        assert_eq!(watcher.state(), WatcherState::Stopped);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 4);
        server.abort();
    }

    #[tokio::test]
    async fn test_stop_during_backoff_returns_promptly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let mut slow = options(4);
        slow.retry_interval = Duration::from_secs(30);
        let watcher = Watcher::new("pc1", port, slow);
        let connecting = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.connect().await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.err(), Some(WatcherError::Stopped));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.state(), WatcherState::Stopped);
        server.abort();
    }

    #[tokio::test]
    async fn test_fresh_connect_resets_budget() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let watcher = Watcher::new("pc1", port, options(2));
        assert_eq!(
            watcher.connect().await.err(),
            Some(WatcherError::RetriesExhausted { attempts: 2 })
        );
        assert_eq!(
            watcher.connect().await.err(),
            Some(WatcherError::RetriesExhausted { attempts: 2 })
        );
    }
}
