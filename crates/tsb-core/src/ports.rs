use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::{domain::ConversationId, Result};

/// HTTP method subset used against the chat platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

/// Authenticated transport to the chat platform.
///
/// Implementations must report status codes >= 400 as `Error::HttpStatus`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Single request; returns the response body and status code.
    async fn request(&self, method: Method, url: &str, body: &[u8]) -> Result<(Vec<u8>, u16)>;

    /// GET `url` and stream the body into `dst`. Returns bytes written.
    async fn download_to(
        &self,
        url: &str,
        dst: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}

/// Delivers a local file into a conversation.
#[async_trait]
pub trait FileUploadPort: Send + Sync {
    async fn attach_file(
        &self,
        conversation: &ConversationId,
        path: &Path,
        display_name: &str,
    ) -> Result<()>;
}

/// Plain-text messages back into a conversation (used for failure reports).
#[async_trait]
pub trait MessagePort: Send + Sync {
    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<()>;
}
