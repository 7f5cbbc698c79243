//! The distbuild wire protocol.
//!
//! Each frame is a single JSON object followed by `\n`; no length prefix.
//! Messages carry a free-form `id` correlating requests and responses.
//! Per connection, frames are strictly FIFO.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

/// Which output stream a piece of text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Every message of the distbuild protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Initiator → controller: start a build.
    BuildRequest {
        /// Request correlation id.
        id: String,
        /// Definitions repository URL.
        repo: String,
        /// Git ref of the definitions.
        #[serde(rename = "ref")]
        ref_name: String,
        /// System morphology name.
        morphology: String,
    },
    /// Initiator → controller: cancel a build.
    BuildCancel {
        /// Request correlation id.
        id: String,
    },
    /// Controller → initiator: scheduling progress.
    BuildProgress {
        /// Request correlation id.
        id: String,
        /// What is happening.
        step: String,
        /// Units finished so far.
        n: usize,
        /// Total units.
        total: usize,
        /// Human-readable detail.
        message: String,
    },
    /// Controller → initiator: build log output.
    BuildOutput {
        /// Request correlation id.
        id: String,
        /// Originating stream.
        stream: Stream,
        /// The text.
        text: String,
    },
    /// Controller → initiator: the build succeeded.
    BuildFinished {
        /// Request correlation id.
        id: String,
    },
    /// Controller → initiator: the build failed (or was cancelled).
    BuildFailed {
        /// Request correlation id.
        id: String,
        /// Why.
        reason: String,
    },
    /// Worker → controller: registration, first frame on the connection.
    WorkerRegister {
        /// Worker name, unique per controller.
        name: String,
        /// Base URL of the worker's local cache server.
        cache_url: String,
    },
    /// Controller → worker: run a subprocess.
    ExecRequest {
        /// Exec correlation id.
        id: String,
        /// Command line to run.
        argv: Vec<String>,
        /// Bytes fed to the subprocess's stdin.
        stdin_contents: String,
    },
    /// Worker → controller: subprocess output.
    ExecOutput {
        /// Exec correlation id.
        id: String,
        /// Originating stream.
        stream: Stream,
        /// The text.
        text: String,
    },
    /// Worker → controller: subprocess exit. Negative values are signal
    /// numbers.
    ExecResponse {
        /// Exec correlation id.
        id: String,
        /// Exit code, `-signal` when killed.
        exit: i32,
    },
    /// Controller → worker: kill the subprocess's whole process group.
    /// Idempotent.
    ExecCancel {
        /// Exec correlation id.
        id: String,
    },
}

impl Message {
    /// The correlation id, if the message carries one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::BuildRequest { id, .. }
            | Self::BuildCancel { id }
            | Self::BuildProgress { id, .. }
            | Self::BuildOutput { id, .. }
            | Self::BuildFinished { id }
            | Self::BuildFailed { id, .. }
            | Self::ExecRequest { id, .. }
            | Self::ExecOutput { id, .. }
            | Self::ExecResponse { id, .. }
            | Self::ExecCancel { id } => Some(id),
            Self::WorkerRegister { .. } => None,
        }
    }
}

/// Reads newline-delimited JSON frames.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a read half.
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next frame. `Ok(None)` on clean EOF.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] on malformed JSON; the caller must close the
    /// connection.
    pub async fn read(&mut self) -> Result<Option<Message>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message: Message = serde_json::from_str(trimmed)
                .map_err(|e| Error::protocol(format!("malformed frame: {e}")))?;
            trace!(?message, "Received frame");
            return Ok(Some(message));
        }
    }
}

/// Writes newline-delimited JSON frames.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a write half.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| Error::protocol(format!("unserialisable message: {e}")))?;
        json.push('\n');
        self.inner.write_all(json.as_bytes()).await?;
        self.inner.flush().await?;
        trace!(?message, "Sent frame");
        Ok(())
    }
}
