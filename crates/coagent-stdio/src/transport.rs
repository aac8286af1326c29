//! Line-delimited JSON transport

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::protocol::{Inbound, Outbound};
use crate::Result;

/// Writing half of an engine connection
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, message: &Outbound) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Reading half of an engine connection
#[async_trait]
pub trait TransportReader: Send {
    /// Next decoded line, or `None` once the engine closed its output
    async fn receive(&mut self) -> Result<Option<Inbound>>;
}

/// Serializes one JSON value per line
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWriter for LineWriter<W> {
    async fn send(&mut self, message: &Outbound) -> Result<()> {
        let mut json = serde_json::to_vec(message)?;
        json.push(b'\n');
        self.inner.write_all(&json).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Decodes one JSON value per line, skipping blank lines
pub struct LineReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportReader for LineReader<R> {
    async fn receive(&mut self) -> Result<Option<Inbound>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Inbound::parse(trimmed).map(Some);
        }
    }
}

/// How to start an engine process
#[derive(Debug, Clone, Default)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Engine child process with piped stdio
pub struct StdioTransport {
    child: Child,
}

impl StdioTransport {
    /// Spawn the engine and split its pipes into a writer and a reader
    pub fn spawn(
        command: &EngineCommand,
    ) -> Result<(Self, LineWriter<ChildStdin>, LineReader<ChildStdout>)> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        debug!(program = %command.program, pid = ?child.id(), "Engine process spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;

        Ok((Self { child }, LineWriter::new(stdin), LineReader::new(stdout)))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the engine if it is still running
    pub async fn close(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => debug!(?status, "Engine process already exited"),
            None => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill engine process: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
