//! The exec helper: subprocess supervision with process-group kill.
//!
//! One subprocess per exec request, each in its own process group so that
//! cancellation reaches every descendant. stdout and stderr are read by
//! dedicated tasks and framed as `exec-output` messages, so neither pipe
//! can back up and deadlock the child.

use crate::protocol::{Message, Stream};
use crate::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Supervises subprocesses for exec requests.
#[derive(Default)]
pub struct ExecHelper {
    /// Process-group leaders of running requests, by exec id.
    running: Arc<Mutex<HashMap<String, u32>>>,
}

impl ExecHelper {
    /// Create an idle helper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently running.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Run `argv` for the request `id`, streaming output frames into
    /// `output`, and return the exit code (negative signal number if the
    /// process group was killed).
    ///
    /// # Errors
    ///
    /// Returns an error if the subprocess cannot be spawned; command
    /// failures are reported through the exit code instead.
    pub async fn execute(
        &self,
        id: &str,
        argv: &[String],
        stdin_contents: &str,
        output: mpsc::UnboundedSender<Message>,
    ) -> Result<i32> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::protocol("exec-request with empty argv"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // A fresh process group: cancellation kills the whole tree.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            Error::protocol("subprocess exited before its pid could be read")
        })?;
        self.running.lock().await.insert(id.to_string(), pid);
        info!(id, pid, program = %program, "Started exec subprocess");

        if let Some(mut stdin) = child.stdin.take() {
            let contents = stdin_contents.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&contents).await;
                let _ = stdin.shutdown().await;
            });
        }

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(id, Stream::Stdout, stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(id, Stream::Stderr, stderr, output.clone()));
        }
        drop(output);

        let status = child.wait().await?;
        for reader in readers {
            let _ = reader.await;
        }
        self.running.lock().await.remove(id);

        let exit = exit_code_of(status);
        debug!(id, exit, "Exec subprocess finished");
        Ok(exit)
    }

    /// Kill the whole process group of request `id`. Idempotent: unknown
    /// or already-finished ids are a no-op.
    pub async fn cancel(&self, id: &str) {
        let pid = self.running.lock().await.get(id).copied();
        let Some(pid) = pid else {
            debug!(id, "Cancel for unknown or finished request");
            return;
        };
        warn!(id, pid, "Killing process group");
        kill_process_group(pid);
    }
}

/// Read one pipe line by line into `exec-output` frames.
fn spawn_reader<R>(
    id: &str,
    stream: Stream,
    pipe: R,
    output: mpsc::UnboundedSender<Message>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let id = id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            let frame = Message::ExecOutput {
                id: id.clone(),
                stream,
                text,
            };
            if output.send(frame).is_err() {
                break;
            }
        }
    })
}

/// SIGKILL an entire process group.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: kill(2) with a negative pid signals the process group; the
    // pid came from a child we spawned as a group leader.
    #[expect(unsafe_code, reason = "POSIX process-group kill")]
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

/// Exit code, with signal deaths as negative signal numbers.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(all(unix, test))]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 probes for existence without delivering anything.
    #[expect(unsafe_code, reason = "POSIX liveness probe")]
    unsafe {
        libc::kill(pid as i32, 0) == 0
    }
}
