//! Slack adapter (Web API over reqwest).
//!
//! Implements the `tsb-core` transport, upload and message ports.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use tsb_core::{
    config::Config,
    domain::ConversationId,
    errors::Error,
    ports::{FileUploadPort, MessagePort, Method, Transport},
    Result,
};

pub mod types;

use types::{
    ChatPostMessageRequest, ChatPostMessageResponse, ConversationsListResponse, Envelope,
    FilesUploadResponse, UsersListResponse,
};

const ERROR_BODY_MAX_CHARS: usize = 200;

#[derive(Clone, Debug)]
pub struct SlackClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl SlackClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        // The timeout bounds API calls only; downloads may take longer.
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("slack client build error: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.slack_base_url, &cfg.slack_oauth_token, cfg.http_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs (file `url_private`) are used as-is; anything else is an
    /// API method joined to the base URL.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    pub async fn post(&self, endpoint: &str, body: &[u8]) -> Result<(Vec<u8>, u16)> {
        self.request(Method::Post, endpoint, body).await
    }

    pub async fn put(&self, endpoint: &str, body: &[u8]) -> Result<(Vec<u8>, u16)> {
        self.request(Method::Put, endpoint, body).await
    }

    pub async fn get(&self, endpoint: &str) -> Result<(Vec<u8>, u16)> {
        self.request(Method::Get, endpoint, &[]).await
    }

    pub async fn conversations_list(&self) -> Result<ConversationsListResponse> {
        let (body, _) = self.get("conversations.list").await?;
        parse_ok("conversations.list", &body)
    }

    pub async fn users_list(&self) -> Result<UsersListResponse> {
        let (body, _) = self.get("users.list").await?;
        parse_ok("users.list", &body)
    }

    pub async fn post_message(
        &self,
        channel: &ConversationId,
        text: &str,
    ) -> Result<ChatPostMessageResponse> {
        let payload = serde_json::to_vec(&ChatPostMessageRequest {
            channel: &channel.0,
            text,
            as_user: true,
        })?;
        let (body, _) = self.post("chat.postMessage", &payload).await?;
        parse_ok("chat.postMessage", &body)
    }

    pub async fn upload_file(
        &self,
        channel: &ConversationId,
        path: &Path,
        display_name: &str,
    ) -> Result<FilesUploadResponse> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len();

        let form = reqwest::multipart::Form::new()
            .text("channels", channel.0.clone())
            .text("filename", display_name.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(display_name.to_string()),
            );

        let url = self.endpoint_url("files.upload");
        tracing::debug!(url = %url, channel = %channel, bytes = size, "slack upload");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(map_err)?;
        let (body, _) = read_checked(resp).await?;
        parse_ok("files.upload", &body)
    }
}

#[async_trait]
impl Transport for SlackClient {
    async fn request(&self, method: Method, url: &str, body: &[u8]) -> Result<(Vec<u8>, u16)> {
        let url = self.endpoint_url(url);
        tracing::debug!(method = method.as_str(), url = %url, "slack request");

        let mut req = self
            .http
            .request(to_reqwest(method), &url)
            .bearer_auth(&self.token)
            .timeout(self.timeout);
        if !body.is_empty() {
            req = req
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(body.to_vec());
        }

        let resp = req.send().await.map_err(map_err)?;
        let (bytes, status) = read_checked(resp).await?;
        // Empty bodies read as an empty JSON object.
        let bytes = if bytes.is_empty() {
            b"{}".to_vec()
        } else {
            bytes
        };
        Ok((bytes, status))
    }

    async fn download_to(
        &self,
        url: &str,
        dst: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let url = self.endpoint_url(url);
        tracing::debug!(url = %url, "slack download");

        let mut resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_err)?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(map_err)? {
            dst.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dst.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl FileUploadPort for SlackClient {
    async fn attach_file(
        &self,
        conversation: &ConversationId,
        path: &Path,
        display_name: &str,
    ) -> Result<()> {
        let resp = self.upload_file(conversation, path, display_name).await?;
        if let Some(file) = resp.file {
            tracing::debug!(file_id = %file.id, "slack file created");
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePort for SlackClient {
    async fn send_message(&self, conversation: &ConversationId, text: &str) -> Result<()> {
        self.post_message(conversation, text).await?;
        Ok(())
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
    }
}

fn map_err(e: reqwest::Error) -> Error {
    Error::External(format!("slack request error: {e}"))
}

fn status_error(status: u16, body: &str) -> Error {
    tracing::warn!(status, "bad status code received");
    Error::HttpStatus {
        status,
        body: body.chars().take(ERROR_BODY_MAX_CHARS).collect(),
    }
}

async fn read_checked(resp: reqwest::Response) -> Result<(Vec<u8>, u16)> {
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.map_err(map_err)?;
    if status >= 400 {
        return Err(status_error(status, &String::from_utf8_lossy(&bytes)));
    }
    Ok((bytes.to_vec(), status))
}

/// Decode a Web API response, turning `{"ok": false}` into an error.
pub fn parse_ok<T: DeserializeOwned>(api_method: &str, body: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if !envelope.ok {
        let reason = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
        return Err(Error::External(format!("{api_method} failed: {reason}")));
    }
    Ok(serde_json::from_slice(body)?)
}
