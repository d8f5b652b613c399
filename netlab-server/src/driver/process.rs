//! External process collaborators
//!
//! VM processes are launched detached from the daemon; halt/crash/list
//! helpers are run to completion and judged by exit status and output.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// An external command with its environment and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Short name for logs and error messages
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Render as a shell-like line for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Opaque handle to a launched VM process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
}

/// Finished helper command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
}

/// Launches long-running VM processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, String>;
}

/// Runs helper commands to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Spawns processes in their own process group so they outlive the daemon
#[derive(Debug, Default)]
pub struct DetachedLauncher;

#[async_trait]
impl ProcessLauncher for DetachedLauncher {
    async fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, String> {
        debug!(cmd = %spec.command_line(), "Spawning process");

        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("{}: {}", spec.name(), e))?;
        let pid = child.id();
        info!(pid, program = %spec.name(), "Process spawned");

        // Reap the child without tying its lifetime to the caller
        let name = spec.name();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, program = %name, %status, "Process exited"),
                Err(e) => warn!(pid, program = %name, error = %e, "Failed to wait for process"),
            }
        });

        Ok(ProcessHandle { pid })
    }
}

/// Runs helper commands with `tokio::process`
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(cmd = %spec.command_line(), "Running command");
        let output = spec.to_command().stdin(Stdio::null()).output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("/opt/netkit/bin/vhalt")
            .arg("-q")
            .arg("pc1")
            .env("NETKIT_HOME", "/opt/netkit")
            .current_dir("/tmp");

        assert_eq!(spec.name(), "vhalt");
        assert_eq!(spec.command_line(), "/opt/netkit/bin/vhalt -q pc1");
        assert_eq!(spec.env, vec![("NETKIT_HOME".into(), "/opt/netkit".into())]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_system_runner_reports_status_and_output() {
        let ok = SystemRunner
            .run(&CommandSpec::new("sh").arg("-c").arg("echo pc1; exit 0"))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "pc1");

        let failed = SystemRunner
            .run(&CommandSpec::new("sh").arg("-c").arg("exit 3"))
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.code, Some(3));
    }

    #[tokio::test]
    async fn test_detached_launcher_missing_program() {
        let result = DetachedLauncher
            .spawn(&CommandSpec::new("/nonexistent/netlab/vstart"))
            .await;
        assert!(result.unwrap_err().starts_with("vstart:"));
    }
}
