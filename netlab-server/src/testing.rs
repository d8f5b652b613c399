//! Test fixtures: a fake VM console, a scripted terminal user, and fake
//! process collaborators that boot fake consoles instead of VMs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use netlab_protocol::NodeSpec;

use crate::driver::process::{
    CommandOutput, CommandRunner, CommandSpec, ProcessHandle, ProcessLauncher,
};
use crate::driver::{Driver, NodeError};
use crate::prompt::shell_prompt;
use crate::workspace::Workspace;
use crate::telnet::{
    DO, ECHO, ENV_IS, ENV_VALUE, ENV_VAR, IAC, NEW_ENVIRON, SB, SE, SUPPRESS_GO_AHEAD, WILL,
    WONT,
};

/// Telnet console server standing in for a booted VM
pub struct FakeConsole {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: broadcast::Sender<Vec<u8>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl FakeConsole {
    /// Serve on an ephemeral port
    pub async fn start(node: &str) -> Self {
        Self::bind(node, 0).await.unwrap()
    }

    /// Serve on a fixed port
    pub async fn bind(node: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let connections = Arc::new(AtomicUsize::new(0));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(64);
        let shutdown = CancellationToken::new();

        let greeting = {
            let mut bytes = vec![
                IAC,
                WILL,
                SUPPRESS_GO_AHEAD,
                IAC,
                DO,
                ECHO,
                IAC,
                WILL,
                ECHO,
            ];
            bytes.extend_from_slice(format!("\r\n{} ", shell_prompt(node)).as_bytes());
            bytes
        };

        let task = tokio::spawn({
            let connections = connections.clone();
            let outbound = outbound.clone();
            let shutdown = shutdown.clone();
            async move {
                loop {
                    let stream = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => break,
                        },
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_console(
                        stream,
                        greeting.clone(),
                        received_tx.clone(),
                        outbound.subscribe(),
                        shutdown.clone(),
                    ));
                }
            }
        });

        Ok(Self {
            port,
            connections,
            received,
            outbound,
            shutdown,
            task,
        })
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Write raw bytes to every connected client
    pub fn send(&self, bytes: &[u8]) {
        let _ = self.outbound.send(bytes.to_vec());
    }

    /// Wait until the bytes received from clients contain `needle`
    pub async fn expect(&mut self, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !contains(&seen, needle) {
                match self.received.recv().await {
                    Some(chunk) => seen.extend(chunk),
                    None => break,
                }
            }
        })
        .await
        .expect("console never received expected bytes");
        assert!(contains(&seen, needle));
        seen
    }

    /// Drop every connection and stop listening, like a halted VM
    pub fn halt(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FakeConsole {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

async fn serve_console(
    stream: TcpStream,
    greeting: Vec<u8>,
    received: mpsc::UnboundedSender<Vec<u8>>,
    mut outbound: broadcast::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    if writer.write_all(&greeting).await.is_err() {
        return;
    }

    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = received.send(buf[..n].to_vec());
                }
            },
            Ok(bytes) = outbound.recv() => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Full terminal-side reply script for the server handshake
pub fn terminal_replies(user: &str) -> Vec<u8> {
    let mut bytes = vec![IAC, WILL, NEW_ENVIRON];
    bytes.extend_from_slice(&[IAC, SB, NEW_ENVIRON, ENV_IS, ENV_VAR]);
    bytes.extend_from_slice(b"USER");
    bytes.push(ENV_VALUE);
    bytes.extend_from_slice(user.as_bytes());
    bytes.extend_from_slice(&[IAC, SE]);
    bytes.extend_from_slice(&[IAC, DO, SUPPRESS_GO_AHEAD]);
    bytes.extend_from_slice(&[IAC, WONT, ECHO]);
    bytes.extend_from_slice(&[IAC, DO, ECHO]);
    bytes
}

/// Connect to a multiplexer as a terminal user and complete the handshake
pub async fn terminal_login(port: u16, user: &str) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    read_until(&mut stream, &[IAC, DO, NEW_ENVIRON]).await;
    stream.write_all(&terminal_replies(user)).await.unwrap();
    stream
}

/// Read from `stream` until the accumulated bytes contain `needle`
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !contains(&seen, needle) {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("stream never produced expected bytes");
    assert!(contains(&seen, needle), "stream closed before expected bytes");
    seen
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Launcher that "boots" a fake console for `<node> --con0=port:<port> ...`
#[derive(Default)]
pub struct FakeLauncher {
    pub spawns: AtomicUsize,
    pub fail_with: Option<String>,
    pub consoles: Mutex<Vec<FakeConsole>>,
}

impl FakeLauncher {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Halt every booted console
    pub fn halt_all(&self) {
        for console in self.consoles.lock().iter() {
            console.halt();
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, String> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(message.clone());
        }

        let node = spec.args[0].clone();
        let port: u16 = spec
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("--con0=port:"))
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| "no console port".to_string())?;
        let console = FakeConsole::bind(&node, port)
            .await
            .map_err(|e| e.to_string())?;
        self.consoles.lock().push(console);
        Ok(ProcessHandle { pid: Some(4242) })
    }
}

/// Runner replaying scripted listing outputs and recording every call
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<String>>,
    pub listings: Mutex<VecDeque<String>>,
}

impl FakeRunner {
    /// Recorded calls by program name and arguments
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut line = spec.name();
        for arg in &spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().push(line);

        let stdout = if spec.name() == "vlist" {
            self.listings.lock().pop_front().unwrap_or_default()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            success: true,
            code: Some(0),
            stdout,
        })
    }
}

/// Driver recording lifecycle calls, with no VMs behind it
pub struct StubDriver {
    name: String,
    running: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl StubDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> netlab_utils::Result<()> {
        self.calls.lock().push("start".into());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> netlab_utils::Result<()> {
        self.calls.lock().push("stop".into());
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn create(&self, workspace: &Workspace) -> netlab_utils::Result<()> {
        self.calls.lock().push(format!("create {}", workspace.id()));
        Ok(())
    }

    async fn destroy(&self, workspace: &Workspace) -> netlab_utils::Result<()> {
        self.calls.lock().push(format!("destroy {}", workspace.id()));
        Ok(())
    }

    async fn start_vm(&self, workspace: &Workspace, node: &NodeSpec) -> Result<u16, NodeError> {
        self.calls
            .lock()
            .push(format!("start_vm {} {}", workspace.id(), node.name));
        Ok(40000)
    }

    async fn stop_vm(&self, workspace: &Workspace, node: &str) -> Result<(), NodeError> {
        self.calls
            .lock()
            .push(format!("stop_vm {} {}", workspace.id(), node));
        Ok(())
    }
}

/// A `NETKIT_HOME` with every command the driver checks for
pub fn netkit_home() -> tempfile::TempDir {
    let home = tempfile::tempdir().unwrap();
    let bin = home.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    for command in ["vstart", "vhalt", "vcrash", "vlist"] {
        std::fs::write(bin.join(command), b"#!/bin/sh\n").unwrap();
    }
    home
}
