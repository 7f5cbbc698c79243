//! The initiator side of the protocol: what `morph distbuild` speaks.

use crate::protocol::{Message, MessageReader, MessageWriter, Stream};
use crate::{Error, Result};
use tokio::net::TcpStream;
use tracing::info;
use uuid::Uuid;

/// What happened to a distributed build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistbuildOutcome {
    /// The build finished; every artifact is in the shared cache.
    Finished,
    /// The build failed (or was cancelled).
    Failed {
        /// The controller's reason.
        reason: String,
    },
}

/// Submit one build request and stream its output until it terminates.
///
/// `on_event` receives every progress and output message as it arrives.
pub async fn run_distbuild<F>(
    controller_addr: &str,
    repo: &str,
    ref_name: &str,
    morphology: &str,
    mut on_event: F,
) -> Result<DistbuildOutcome>
where
    F: FnMut(&Message),
{
    let stream = TcpStream::connect(controller_addr).await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read_half);
    let mut writer = MessageWriter::new(write_half);

    let request_id = Uuid::new_v4().to_string();
    info!(request = %request_id, controller = controller_addr, "Submitting build request");
    writer
        .send(&Message::BuildRequest {
            id: request_id.clone(),
            repo: repo.to_string(),
            ref_name: ref_name.to_string(),
            morphology: morphology.to_string(),
        })
        .await?;

    loop {
        let Some(message) = reader.read().await? else {
            return Err(Error::protocol("controller closed before a terminal message"));
        };
        match &message {
            Message::BuildProgress { id, .. } | Message::BuildOutput { id, .. }
                if *id == request_id =>
            {
                on_event(&message);
            }
            Message::BuildFinished { id } if *id == request_id => {
                return Ok(DistbuildOutcome::Finished);
            }
            Message::BuildFailed { id, reason } if *id == request_id => {
                return Ok(DistbuildOutcome::Failed {
                    reason: reason.clone(),
                });
            }
            _ => {}
        }
    }
}

/// Pretty-print a streamed message the way the CLI does.
#[must_use]
pub fn render_event(message: &Message) -> Option<String> {
    match message {
        Message::BuildProgress {
            n, total, message, ..
        } => Some(format!("[{n}/{total}] {message}")),
        Message::BuildOutput { stream, text, .. } => match stream {
            Stream::Stdout => Some(text.clone()),
            Stream::Stderr => Some(format!("! {text}")),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_progress_and_output() {
        let progress = Message::BuildProgress {
            id: "r".into(),
            step: "build".into(),
            n: 2,
            total: 5,
            message: "built hello".into(),
        };
        assert_eq!(render_event(&progress).unwrap(), "[2/5] built hello");

        let output = Message::BuildOutput {
            id: "r".into(),
            stream: Stream::Stderr,
            text: "warning: deprecated".into(),
        };
        assert_eq!(render_event(&output).unwrap(), "! warning: deprecated");

        assert!(render_event(&Message::BuildFinished { id: "r".into() }).is_none());
    }
}
