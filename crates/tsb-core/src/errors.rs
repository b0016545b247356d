use std::{path::PathBuf, time::Duration};

/// Core error type.
///
/// Adapter crates map their transport-specific errors into this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("request failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("{}", transform_exit_message(.code, .stderr))]
    TransformExit { code: Option<i32>, stderr: String },

    #[error("transform timed out after {0:?}")]
    TransformTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("nothing to package in {0}")]
    EmptyArchive(PathBuf),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn transform_exit_message(code: &Option<i32>, stderr: &str) -> String {
    let mut msg = match code {
        Some(code) => format!("transform exited with status {code}"),
        None => "transform terminated by signal".to_string(),
    };
    if !stderr.trim().is_empty() {
        msg.push_str("\nstderr (tail):\n");
        msg.push_str(stderr);
    }
    msg
}
