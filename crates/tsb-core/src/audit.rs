use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;

use crate::{domain::Attachment, errors::Error, Result};

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AuditEvent {
    fn for_attachment(event: &str, att: &Attachment) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            conversation: Some(att.conversation().0.clone()),
            attachment_id: Some(att.id().0.clone()),
            file_type: Some(att.file_type().to_string()),
            stage: None,
            error: None,
            elapsed_ms: None,
        }
    }

    pub fn processed(att: &Attachment, elapsed: Duration) -> Self {
        Self {
            elapsed_ms: Some(elapsed.as_millis() as u64),
            ..Self::for_attachment("attachment_processed", att)
        }
    }

    pub fn failed(att: &Attachment, stage: &str, error: &str, elapsed: Duration) -> Self {
        Self {
            stage: Some(stage.to_string()),
            error: Some(error.to_string()),
            elapsed_ms: Some(elapsed.as_millis() as u64),
            ..Self::for_attachment("attachment_failed", att)
        }
    }

    /// A batch refused up front because `att` has an unsupported type.
    pub fn rejected(att: &Attachment, error: &str) -> Self {
        Self {
            stage: Some("validation".to_string()),
            error: Some(error.to_string()),
            ..Self::for_attachment("batch_rejected", att)
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.error {
            event.error = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text blocks for humans tailing the file.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Write, logging instead of failing; audit trouble never stops the pipeline.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(event) {
            tracing::warn!(path = %self.path.display(), "failed to write audit event: {e}");
        }
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
