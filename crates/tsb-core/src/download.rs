use std::{path::PathBuf, sync::Arc};

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::{archive::ArchiveKind, ports::Transport, Result};

/// Fetches attachments into uniquely-named temporary files.
///
/// The body is streamed straight to disk; memory use does not grow with the
/// attachment size. The returned file is deleted when dropped.
#[derive(Clone)]
pub struct Downloader {
    transport: Arc<dyn Transport>,
    temp_dir: PathBuf,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            temp_dir: temp_dir.into(),
        }
    }

    pub async fn download(&self, url: &str, kind: ArchiveKind) -> Result<NamedTempFile> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let tmp = tempfile::Builder::new()
            .prefix("tsb-")
            .suffix(kind.suffix())
            .tempfile_in(&self.temp_dir)?;

        let mut dst = tokio::fs::File::from_std(tmp.reopen()?);
        let written = self.transport.download_to(url, &mut dst).await?;
        dst.flush().await?;

        tracing::debug!(
            url,
            bytes = written,
            path = %tmp.path().display(),
            "attachment downloaded"
        );
        Ok(tmp)
    }
}
