use std::fmt;

use serde::{Deserialize, Serialize};

/// Slack file id (e.g. `F0123ABCD`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(pub String);

/// Slack channel / DM id the message arrived in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File entry as delivered on a message event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub id: AttachmentId,
    pub url_private: String,
    pub filetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Incoming message carrying zero or more files.
#[derive(Clone, Debug, Deserialize)]
pub struct MessageEvent {
    pub channel: ConversationId,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub files: Vec<AttachmentDescriptor>,
}

impl MessageEvent {
    /// Attachments in delivery order, each tagged with the owning conversation.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.files
            .iter()
            .map(|d| Attachment::from_descriptor(d.clone(), self.channel.clone()))
            .collect()
    }
}

/// An attachment bound to the conversation it came from. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    id: AttachmentId,
    url: String,
    file_type: String,
    conversation: ConversationId,
}

impl Attachment {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        file_type: impl Into<String>,
        conversation: ConversationId,
    ) -> Self {
        Self {
            id: AttachmentId(id.into()),
            url: url.into(),
            file_type: file_type.into(),
            conversation,
        }
    }

    pub fn from_descriptor(d: AttachmentDescriptor, conversation: ConversationId) -> Self {
        Self {
            id: d.id,
            url: d.url_private,
            file_type: d.filetype,
            conversation,
        }
    }

    pub fn id(&self) -> &AttachmentId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }
}
