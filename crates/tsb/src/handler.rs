//! Message handling: runs the pipeline for one incoming event and reports
//! failures back to the conversation.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use tsb_core::{
    domain::MessageEvent,
    pipeline::{BatchReport, Pipeline, PipelineError},
    ports::MessagePort,
};

/// Accepts both a bare message event and the Events API callback wrapper.
#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Wrapped { event: MessageEvent },
    Bare(MessageEvent),
}

pub fn parse_event(raw: &[u8]) -> serde_json::Result<MessageEvent> {
    Ok(match serde_json::from_slice::<Incoming>(raw)? {
        Incoming::Wrapped { event } => event,
        Incoming::Bare(event) => event,
    })
}

/// Text posted to the conversation when a batch fails.
pub fn failure_text(e: &PipelineError) -> String {
    let mut text = format!(
        "Failed to process file {} ({}): {}",
        e.attachment.id(),
        e.stage,
        e.source
    );
    if !e.delivered.is_empty() {
        let ids = e
            .delivered
            .iter()
            .map(|id| id.0.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(&format!("\nAlready delivered: {ids}"));
    }
    text
}

pub struct AttachmentHandler {
    pipeline: Pipeline,
    messenger: Arc<dyn MessagePort>,
}

impl AttachmentHandler {
    pub fn new(pipeline: Pipeline, messenger: Arc<dyn MessagePort>) -> Self {
        Self {
            pipeline,
            messenger,
        }
    }

    /// `Ok(None)` when the message carries no files.
    pub async fn handle(
        &self,
        event: &MessageEvent,
        cancel: &CancellationToken,
    ) -> Result<Option<BatchReport>, PipelineError> {
        if event.files.is_empty() {
            tracing::debug!(channel = %event.channel, "message without files ignored");
            return Ok(None);
        }

        let attachments = event.attachments();
        tracing::info!(
            channel = %event.channel,
            files = attachments.len(),
            "files received"
        );

        match self.pipeline.process_message(&attachments, cancel).await {
            Ok(report) => {
                tracing::info!(
                    channel = %event.channel,
                    delivered = report.delivered.len(),
                    "all files processed"
                );
                Ok(Some(report))
            }
            Err(e) => {
                tracing::error!("{e}");
                let text = failure_text(&e);
                if let Err(send_err) = self
                    .messenger
                    .send_message(e.attachment.conversation(), &text)
                    .await
                {
                    tracing::warn!("failed to report error to conversation: {send_err}");
                }
                Err(e)
            }
        }
    }
}
