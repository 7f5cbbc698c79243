//! The worker daemon.
//!
//! A long-lived process that connects to the controller, registers itself,
//! and serves exec requests by delegating to the [`ExecHelper`]. Output and
//! exit frames flow back over the same connection, strictly FIFO.

use crate::helper::ExecHelper;
use crate::protocol::{Message, MessageReader, MessageWriter};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// This worker's name, unique per controller.
    pub name: String,
    /// Controller address (`host:port`).
    pub controller_addr: String,
    /// Base URL of this worker's local cache server.
    pub cache_url: String,
    /// Exec requests run at a time; builds are serialised by default.
    pub parallel_builds: usize,
}

/// The worker daemon.
pub struct WorkerDaemon {
    config: WorkerConfig,
    helper: Arc<ExecHelper>,
    build_slots: Arc<Semaphore>,
    /// Requests cancelled before their slot came up.
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl WorkerDaemon {
    /// Create a worker.
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        let slots = config.parallel_builds.max(1);
        Self {
            config,
            helper: Arc::new(ExecHelper::new()),
            build_slots: Arc::new(Semaphore::new(slots)),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Connect to the controller and serve until the connection closes.
    pub async fn run(self) -> Result<()> {
        let stream = TcpStream::connect(&self.config.controller_addr).await?;
        info!(
            controller = %self.config.controller_addr,
            name = %self.config.name,
            "Connected to controller"
        );
        self.serve(stream).await
    }

    /// Serve one controller connection. Separated from [`run`](Self::run)
    /// so tests can drive an in-memory stream.
    pub async fn serve<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        // All frames leave through one channel so concurrent exec requests
        // interleave whole frames, never bytes.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.send(&message).await {
                    warn!(error = %e, "Failed to write frame; dropping connection");
                    break;
                }
            }
        });

        tx.send(Message::WorkerRegister {
            name: self.config.name.clone(),
            cache_url: self.config.cache_url.clone(),
        })
        .map_err(|_| Error::protocol("writer task gone before registration"))?;

        loop {
            let message = match reader.read().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("Controller closed the connection");
                    break;
                }
                Err(e) => {
                    // Malformed frame: close the connection.
                    drop(tx);
                    let _ = writer_task.await;
                    return Err(e);
                }
            };
            match message {
                Message::ExecRequest {
                    id,
                    argv,
                    stdin_contents,
                } => {
                    let helper = Arc::clone(&self.helper);
                    let slots = Arc::clone(&self.build_slots);
                    let cancelled = Arc::clone(&self.cancelled);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = slots.acquire_owned().await else {
                            return;
                        };
                        // Cancelled while queued: report a kill without
                        // ever starting the subprocess.
                        if cancelled.lock().await.remove(&id) {
                            debug!(id, "Request cancelled before it started");
                            let _ = tx.send(Message::ExecResponse {
                                id,
                                exit: -libc::SIGKILL,
                            });
                            return;
                        }
                        let exit = match helper
                            .execute(&id, &argv, &stdin_contents, tx.clone())
                            .await
                        {
                            Ok(exit) => exit,
                            Err(e) => {
                                warn!(id, error = %e, "Exec request failed to start");
                                127
                            }
                        };
                        cancelled.lock().await.remove(&id);
                        let _ = tx.send(Message::ExecResponse { id, exit });
                    });
                }
                Message::ExecCancel { id } => {
                    self.cancelled.lock().await.insert(id.clone());
                    self.helper.cancel(&id).await;
                }
                other => {
                    drop(tx);
                    let _ = writer_task.await;
                    return Err(Error::protocol(format!(
                        "unexpected message for a worker: {other:?}"
                    )));
                }
            }
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Stream;

    fn worker() -> WorkerDaemon {
        WorkerDaemon::new(WorkerConfig {
            name: "w1".into(),
            controller_addr: "unused".into(),
            cache_url: "http://localhost:8080".into(),
            parallel_builds: 1,
        })
    }

    #[tokio::test]
    async fn registers_then_serves_exec_requests() {
        let (controller_side, worker_side) = tokio::io::duplex(16 * 1024);
        let daemon = worker();
        let serve = tokio::spawn(daemon.serve(worker_side));

        let (read_half, write_half) = tokio::io::split(controller_side);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        let registration = reader.read().await.unwrap().unwrap();
        let Message::WorkerRegister { name, .. } = registration else {
            panic!("expected registration, got {registration:?}")
        };
        assert_eq!(name, "w1");

        writer
            .send(&Message::ExecRequest {
                id: "u1".into(),
                argv: vec!["sh".into(), "-c".into(), "echo built".into()],
                stdin_contents: String::new(),
            })
            .await
            .unwrap();

        let mut saw_output = false;
        loop {
            let message = reader.read().await.unwrap().unwrap();
            match message {
                Message::ExecOutput {
                    id,
                    stream: Stream::Stdout,
                    text,
                } => {
                    assert_eq!(id, "u1");
                    assert_eq!(text, "built");
                    saw_output = true;
                }
                Message::ExecResponse { id, exit } => {
                    assert_eq!(id, "u1");
                    assert_eq!(exit, 0);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_output);

        drop(writer);
        drop(reader);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_request() {
        let (controller_side, worker_side) = tokio::io::duplex(16 * 1024);
        let serve = tokio::spawn(worker().serve(worker_side));

        let (read_half, write_half) = tokio::io::split(controller_side);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);
        let _ = reader.read().await.unwrap().unwrap(); // registration

        writer
            .send(&Message::ExecRequest {
                id: "u2".into(),
                argv: vec!["sh".into(), "-c".into(), "echo started; sleep 30".into()],
                stdin_contents: String::new(),
            })
            .await
            .unwrap();

        // Wait for the first output so the subprocess surely exists.
        loop {
            let message = reader.read().await.unwrap().unwrap();
            if matches!(message, Message::ExecOutput { .. }) {
                break;
            }
        }
        writer
            .send(&Message::ExecCancel { id: "u2".into() })
            .await
            .unwrap();

        loop {
            let message = reader.read().await.unwrap().unwrap();
            if let Message::ExecResponse { id, exit } = message {
                assert_eq!(id, "u2");
                assert_eq!(exit, -libc::SIGKILL);
                break;
            }
        }

        drop(writer);
        drop(reader);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unexpected_message_closes_the_connection() {
        let (controller_side, worker_side) = tokio::io::duplex(4096);
        let serve = tokio::spawn(worker().serve(worker_side));

        let (read_half, write_half) = tokio::io::split(controller_side);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);
        let _ = reader.read().await.unwrap().unwrap(); // registration

        writer
            .send(&Message::BuildFinished { id: "x".into() })
            .await
            .unwrap();
        let err = serve.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "{err}");
    }
}
