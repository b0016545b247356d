use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use tsb_core::{
    config::Config,
    domain::MessageEvent,
    pipeline::{Pipeline, PipelineSettings},
    transform::CommandTransformer,
};
use tsb_slack::SlackClient;

mod handler;

use handler::{parse_event, AttachmentHandler};

/// Usage: `tsb [EVENT_JSON_PATH]`. Reads the event from stdin without a path.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tsb_core::logging::init("tsb")?;

    let cfg = Config::load().context("failed to load configuration")?;
    let event = read_event(std::env::args_os().nth(1).map(PathBuf::from)).await?;

    let slack = Arc::new(SlackClient::from_config(&cfg)?);
    let transformer = Arc::new(CommandTransformer::new(cfg.transform.clone()));
    let pipeline = Pipeline::new(
        PipelineSettings::from_config(&cfg),
        slack.clone(),
        slack.clone(),
        transformer,
    );
    tracing::debug!(
        supported = %pipeline.supported_types().describe(),
        staging = %pipeline.staging().root().display(),
        "pipeline ready"
    );
    let handler = AttachmentHandler::new(pipeline, slack);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        }
    });

    handler.handle(&event, &cancel).await?;
    Ok(())
}

async fn read_event(path: Option<PathBuf>) -> anyhow::Result<MessageEvent> {
    let raw = match path {
        Some(p) => tokio::fs::read(&p)
            .await
            .with_context(|| format!("failed to read {}", p.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("failed to read event from stdin")?;
            buf
        }
    };
    parse_event(&raw).context("invalid message event")
}
