//! Slack Web API payloads. Only the fields the bot reads are modeled.

use serde::{Deserialize, Serialize};

/// Common `{ "ok": bool, "error": "..." }` envelope of every Web API response.
#[derive(Clone, Debug, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatPostMessageRequest<'a> {
    pub channel: &'a str,
    pub text: &'a str,
    pub as_user: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatPostMessageResponse {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FilesUploadResponse {
    #[serde(default)]
    pub file: Option<UploadedFile>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConversationsListResponse {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UsersListResponse {
    #[serde(default)]
    pub members: Vec<Member>,
}
