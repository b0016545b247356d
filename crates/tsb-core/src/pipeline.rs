//! Attachment pipeline: validate → download → extract → transform → repackage
//! → upload → cleanup.
//!
//! A message's attachments are validated together, then processed strictly one
//! after another. The first failure aborts the rest of the batch; attachments
//! delivered before it stay delivered.

use std::{fmt, path::PathBuf, sync::Arc, time::Instant};

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{build_archive, safe_extract, ArchiveKind, ExtractLimits},
    audit::{AuditEvent, AuditLogger},
    config::Config,
    domain::{Attachment, AttachmentId},
    download::Downloader,
    errors::Error,
    ports::{FileUploadPort, Transport},
    staging::{StagingArea, StagingManager},
    transform::TransformRunner,
    upload::Uploader,
    validate::{validate_batch, SupportedTypes},
};

/// Where in the pipeline a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Validation,
    Download,
    Extraction,
    Transform,
    Packaging,
    Upload,
    Cleanup,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Download => "download",
            Stage::Extraction => "extraction",
            Stage::Transform => "transform",
            Stage::Packaging => "packaging",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one attachment. `Failed` is reachable from every other
/// non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentState {
    Received,
    Validated,
    Downloaded,
    Extracted,
    Transformed,
    Repackaged,
    Uploaded,
    CleanedUp,
    Failed,
}

#[derive(Debug, thiserror::Error)]
#[error("attachment {} failed during {stage}: {source}", .attachment.id())]
pub struct PipelineError {
    pub attachment: Attachment,
    pub stage: Stage,
    #[source]
    pub source: Error,
    /// Attachments of the same batch delivered before this failure. They are
    /// not rolled back.
    pub delivered: Vec<AttachmentId>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    pub delivered: Vec<AttachmentId>,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub supported: SupportedTypes,
    pub temp_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub limits: ExtractLimits,
    pub audit: Option<AuditLogger>,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            supported: cfg.supported_types.clone(),
            temp_dir: cfg.temp_dir.clone(),
            staging_dir: cfg.staging_dir.clone(),
            limits: cfg.extract_limits,
            audit: cfg
                .audit_log_path
                .as_ref()
                .map(|p| AuditLogger::new(p.clone(), cfg.audit_log_json)),
        }
    }
}

type StageResult<T> = std::result::Result<T, (Stage, Error)>;

fn at(stage: Stage) -> impl FnOnce(Error) -> (Stage, Error) {
    move |e| (stage, e)
}

fn ensure_live(cancel: &CancellationToken, next: Stage) -> StageResult<()> {
    if cancel.is_cancelled() {
        return Err((next, Error::Cancelled));
    }
    Ok(())
}

fn advance(att: &Attachment, state: &mut AttachmentState, next: AttachmentState) {
    tracing::debug!(attachment = %att.id(), from = ?*state, to = ?next, "attachment state");
    *state = next;
}

/// Runs the attachment pipeline. Collaborators are injected; nothing global.
#[derive(Clone)]
pub struct Pipeline {
    supported: SupportedTypes,
    downloader: Downloader,
    staging: StagingManager,
    transformer: Arc<dyn TransformRunner>,
    uploader: Uploader,
    limits: ExtractLimits,
    audit: Option<AuditLogger>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        transport: Arc<dyn Transport>,
        upload_port: Arc<dyn FileUploadPort>,
        transformer: Arc<dyn TransformRunner>,
    ) -> Self {
        Self {
            supported: settings.supported,
            downloader: Downloader::new(transport, settings.temp_dir),
            staging: StagingManager::new(settings.staging_dir),
            transformer,
            uploader: Uploader::new(upload_port),
            limits: settings.limits,
            audit: settings.audit,
        }
    }

    pub fn supported_types(&self) -> &SupportedTypes {
        &self.supported
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Process every attachment of one message, in order.
    pub async fn process_message(
        &self,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        tracing::debug!(count = attachments.len(), "processing attachments");

        if let Err((att, source)) = validate_batch(&self.supported, attachments) {
            if let Some(audit) = &self.audit {
                audit.record(AuditEvent::rejected(att, &source.to_string()));
            }
            return Err(PipelineError {
                attachment: att.clone(),
                stage: Stage::Validation,
                source,
                delivered: Vec::new(),
            });
        }

        let mut report = BatchReport::default();
        for att in attachments {
            if let Err(mut e) = self.process_attachment(att, cancel).await {
                e.delivered = report.delivered;
                return Err(e);
            }
            report.delivered.push(att.id().clone());
        }
        Ok(report)
    }

    /// Process a single attachment end to end.
    pub async fn process_attachment(
        &self,
        att: &Attachment,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let mut state = AttachmentState::Received;

        let res = self.run(att, &mut state, cancel).await;
        let elapsed = started.elapsed();

        match res {
            Ok(()) => {
                tracing::info!(
                    attachment = %att.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "attachment processed"
                );
                if let Some(audit) = &self.audit {
                    audit.record(AuditEvent::processed(att, elapsed));
                }
                Ok(())
            }
            Err((stage, source)) => {
                tracing::warn!(
                    attachment = %att.id(),
                    stage = %stage,
                    last_state = ?state,
                    "attachment failed: {source}"
                );
                advance(att, &mut state, AttachmentState::Failed);
                if let Some(audit) = &self.audit {
                    audit.record(AuditEvent::failed(
                        att,
                        stage.as_str(),
                        &source.to_string(),
                        elapsed,
                    ));
                }
                Err(PipelineError {
                    attachment: att.clone(),
                    stage,
                    source,
                    delivered: Vec::new(),
                })
            }
        }
    }

    async fn run(
        &self,
        att: &Attachment,
        state: &mut AttachmentState,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let kind = self
            .supported
            .resolve(att.file_type())
            .map_err(at(Stage::Validation))?;
        advance(att, state, AttachmentState::Validated);

        ensure_live(cancel, Stage::Download)?;
        let archive = self
            .downloader
            .download(att.url(), kind)
            .await
            .map_err(at(Stage::Download))?;
        advance(att, state, AttachmentState::Downloaded);

        let area = self
            .staging
            .create_for(att.id())
            .map_err(at(Stage::Extraction))?;

        let res = self
            .run_staged(att, kind, &area, archive, state, cancel)
            .await;

        match res {
            Ok(()) => {
                area.teardown().map_err(at(Stage::Cleanup))?;
                advance(att, state, AttachmentState::CleanedUp);
                Ok(())
            }
            Err(e) => {
                // The stage failure wins over a cleanup failure.
                if let Err(cleanup) = area.teardown() {
                    tracing::warn!(
                        attachment = %att.id(),
                        "failed to remove staging area after error: {cleanup}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_staged(
        &self,
        att: &Attachment,
        kind: ArchiveKind,
        area: &StagingArea,
        archive: NamedTempFile,
        state: &mut AttachmentState,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let extracted = area.extracted_dir();
        let report = tokio::task::spawn_blocking({
            let dest = extracted.clone();
            let limits = self.limits;
            // The download is deleted as soon as it has been unpacked.
            move || {
                let res = safe_extract(kind, archive.path(), &dest, limits);
                drop(archive);
                res
            }
        })
        .await
        .map_err(|e| (Stage::Extraction, Error::External(format!("extract task failed: {e}"))))?
        .map_err(at(Stage::Extraction))?;
        tracing::info!(
            attachment = %att.id(),
            files = report.extracted_files.len(),
            bytes = report.total_bytes,
            "archive extracted"
        );
        advance(att, state, AttachmentState::Extracted);

        ensure_live(cancel, Stage::Transform)?;
        self.transformer
            .run(&extracted, cancel)
            .await
            .map_err(at(Stage::Transform))?;
        advance(att, state, AttachmentState::Transformed);

        // The downloaded payload must never end up in the result.
        area.remove_subtree(&extracted).map_err(at(Stage::Cleanup))?;

        let result_path = area.result_path(kind);
        let built = tokio::task::spawn_blocking({
            let src = area.root().to_path_buf();
            let out = result_path.clone();
            move || build_archive(kind, &src, &out)
        })
        .await
        .map_err(|e| (Stage::Packaging, Error::External(format!("packaging task failed: {e}"))))?
        .map_err(at(Stage::Packaging))?;
        tracing::debug!(
            attachment = %att.id(),
            files = built.files,
            dirs = built.dirs,
            path = %result_path.display(),
            "result packaged"
        );
        advance(att, state, AttachmentState::Repackaged);

        ensure_live(cancel, Stage::Upload)?;
        self.uploader
            .upload(att.conversation(), &result_path, &kind.result_file_name())
            .await
            .map_err(at(Stage::Upload))?;
        advance(att, state, AttachmentState::Uploaded);

        Ok(())
    }
}
