//! Ways to start a sidecar
//!
//! [`ProcessLauncher`] runs the `marmot-sidecar` binary as a child process and
//! talks to it over its stdin/stdout. [`InProcessLauncher`] runs the same serve
//! loop on a task over an in-memory duplex pipe, for tests and for hosts that
//! do not need process isolation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use marmot_group::MarmotEngine;
use marmot_storage_traits::MarmotStorageProvider;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::daemon;
use crate::error::Error;

/// Buffer size of the in-process pipe
const DUPLEX_BUFFER: usize = 1024 * 1024;

/// The running sidecar. Dropping it stops the sidecar.
#[derive(Debug)]
pub enum SidecarHandle {
    /// Child process (killed on drop)
    Process(Child),
    /// In-process serve task (aborted on drop)
    Task(JoinHandle<()>),
}

impl SidecarHandle {
    /// Stop the sidecar abruptly
    pub async fn kill(&mut self) {
        match self {
            Self::Process(child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(target: "marmot_sidecar::launcher", "Failed to kill sidecar: {e}");
                }
            }
            Self::Task(task) => task.abort(),
        }
    }
}

impl Drop for SidecarHandle {
    fn drop(&mut self) {
        if let Self::Task(task) = self {
            task.abort();
        }
    }
}

/// Pipes to a freshly started sidecar
pub struct Connection {
    /// Sidecar output
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Sidecar input
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Lifetime handle
    pub handle: SidecarHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Starts sidecars
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Start one sidecar
    async fn launch(&self) -> Result<Connection, Error>;
}

/// Runs the sidecar binary as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launch `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self) -> Result<Connection, Error> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Launch(format!("spawn {}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Launch("child stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launch("child stdout not piped".to_string()))?;

        tracing::info!(target: "marmot_sidecar::launcher", pid = ?child.id(), "Sidecar process started");
        Ok(Connection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            handle: SidecarHandle::Process(child),
        })
    }
}

/// Runs the serve loop on a task, opening a fresh engine on every launch
pub struct InProcessLauncher<F> {
    open: F,
}

impl<F> std::fmt::Debug for InProcessLauncher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLauncher").finish_non_exhaustive()
    }
}

impl<F> InProcessLauncher<F> {
    /// `open` is called once per launch. A persistent engine reopened from the
    /// same storage models a process restart.
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

#[async_trait]
impl<F, Storage> Launcher for InProcessLauncher<F>
where
    F: Fn() -> anyhow::Result<MarmotEngine<Storage>> + Send + Sync + 'static,
    Storage: MarmotStorageProvider + 'static,
{
    async fn launch(&self) -> Result<Connection, Error> {
        let engine = (self.open)().map_err(|e| Error::Launch(format!("{e:#}")))?;
        let (host, sidecar) = tokio::io::duplex(DUPLEX_BUFFER);

        let task = tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(sidecar);
            match daemon::serve(engine, reader, writer).await {
                Ok(exit) => {
                    tracing::debug!(target: "marmot_sidecar::launcher", ?exit, "In-process sidecar stopped")
                }
                Err(e) => {
                    tracing::warn!(target: "marmot_sidecar::launcher", "In-process sidecar failed: {e:#}")
                }
            }
        });

        let (reader, writer) = tokio::io::split(host);
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            handle: SidecarHandle::Task(task),
        })
    }
}
