use std::{path::Path, sync::Arc};

use crate::{domain::ConversationId, ports::FileUploadPort, Result};

/// Hands result archives to the upload port. Single attempt, no retry.
#[derive(Clone)]
pub struct Uploader {
    port: Arc<dyn FileUploadPort>,
}

impl Uploader {
    pub fn new(port: Arc<dyn FileUploadPort>) -> Self {
        Self { port }
    }

    pub async fn upload(
        &self,
        conversation: &ConversationId,
        path: &Path,
        display_name: &str,
    ) -> Result<()> {
        self.port
            .attach_file(conversation, path, display_name)
            .await?;
        tracing::info!(
            conversation = %conversation,
            file = display_name,
            "result uploaded"
        );
        Ok(())
    }
}
