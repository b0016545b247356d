use std::collections::BTreeSet;

use crate::{archive::ArchiveKind, domain::Attachment, errors::Error, Result};

/// The archive kinds this deployment accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportedTypes {
    kinds: Vec<ArchiveKind>,
}

impl Default for SupportedTypes {
    fn default() -> Self {
        Self::new([ArchiveKind::Zip])
    }
}

impl SupportedTypes {
    pub fn new(kinds: impl IntoIterator<Item = ArchiveKind>) -> Self {
        let mut out: Vec<ArchiveKind> = Vec::new();
        for k in kinds {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        Self { kinds: out }
    }

    /// Parse a CSV list such as `zip,gzip`.
    pub fn parse_csv(v: &str) -> Result<Self> {
        let mut kinds = Vec::new();
        for raw in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = ArchiveKind::from_file_type(raw)
                .ok_or_else(|| Error::Config(format!("unknown archive type: {raw}")))?;
            kinds.push(kind);
        }
        if kinds.is_empty() {
            return Err(Error::Config("no supported file types configured".to_string()));
        }
        Ok(Self::new(kinds))
    }

    pub fn kinds(&self) -> &[ArchiveKind] {
        &self.kinds
    }

    /// Resolve a declared file type to an enabled archive kind.
    pub fn resolve(&self, file_type: &str) -> Result<ArchiveKind> {
        match ArchiveKind::from_file_type(file_type) {
            Some(kind) if self.kinds.contains(&kind) => Ok(kind),
            _ => Err(Error::UnsupportedType(file_type.to_string())),
        }
    }

    /// Human-readable list for error messages (`zip, tar.gz`).
    pub fn describe(&self) -> String {
        self.kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Check the whole batch before anything is downloaded.
///
/// Returns the first attachment with an unsupported type, paired with the error.
pub fn validate_batch<'a>(
    supported: &SupportedTypes,
    attachments: &'a [Attachment],
) -> std::result::Result<(), (&'a Attachment, Error)> {
    for att in attachments {
        if let Err(e) = supported.resolve(att.file_type()) {
            tracing::warn!(
                attachment = %att.id(),
                file_type = att.file_type(),
                supported = %supported.describe(),
                "unsupported attachment type"
            );
            return Err((att, e));
        }
    }
    Ok(())
}
