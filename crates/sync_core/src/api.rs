use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use shared::{
    domain::{ConversationId, Credential, MessageId, ReactionId},
    error::ApiException,
    protocol::{
        ArchiveRequest, ConversationPayload, CreateReactionRequest, EditMessageRequest,
        MarkReadRequest, MessagePage, MessagePayload, Reaction, SendMessageRequest,
        UploadResponse,
    },
};

/// REST boundary consumed by the engine. Pages are ordered newest-last and carry a
/// `next` cursor toward older messages.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_conversation(&self, conversation_id: ConversationId)
        -> Result<ConversationPayload>;
    /// `None` fetches the newest page; `Some` replays a normalised `next` cursor.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
    ) -> Result<MessagePage>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload>;
    async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<MessagePayload>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn create_reaction(&self, message_id: MessageId, symbol: &str) -> Result<Reaction>;
    async fn delete_reaction(&self, reaction_id: ReactionId) -> Result<()>;
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        last_read_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_archived(&self, conversation_id: ConversationId, archived: bool) -> Result<()>;
    fn update_credential(&self, _credential: Credential) {}
}

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// External blob upload service; returns the URL to attach to a message.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, media: MediaUpload) -> Result<String>;
}

pub struct MissingMediaUploader;

#[async_trait]
impl MediaUploader for MissingMediaUploader {
    async fn upload(&self, _media: MediaUpload) -> Result<String> {
        Err(anyhow!("media upload service is unavailable"))
    }
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    page_size: u32,
    credential: RwLock<Credential>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, credential: Credential, page_size: u32) -> Self {
        Self::with_client(Client::new(), base_url, credential, page_size)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        credential: Credential,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.clamp(1, 100),
            credential: RwLock::new(credential),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .credential
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_str()
            .to_string();
        request.bearer_auth(token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .authorized(self.http.get(self.url(path)))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let response = self
            .authorized(self.http.request(method.clone(), self.url(path)))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{method} {path}"))?;
        check_status(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .authorized(self.http.delete(self.url(path)))
            .send()
            .await
            .with_context(|| format!("DELETE {path}"))?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), &body).into())
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationPayload> {
        self.get_json(&format!("/api/conversations/{conversation_id}/"))
            .await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        match cursor {
            Some(cursor) => self.get_json(cursor).await,
            None => {
                self.get_json(&format!(
                    "/api/conversations/{conversation_id}/messages/?page_size={}",
                    self.page_size
                ))
                .await
            }
        }
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .send_json(
                reqwest::Method::POST,
                &format!("/api/conversations/{conversation_id}/messages/"),
                request,
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<MessagePayload> {
        let response = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/api/messages/{message_id}/"),
                &EditMessageRequest {
                    content: content.to_string(),
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.delete(&format!("/api/messages/{message_id}/")).await
    }

    async fn create_reaction(&self, message_id: MessageId, symbol: &str) -> Result<Reaction> {
        let response = self
            .send_json(
                reqwest::Method::POST,
                &format!("/api/messages/{message_id}/reactions/"),
                &CreateReactionRequest {
                    symbol: symbol.to_string(),
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_reaction(&self, reaction_id: ReactionId) -> Result<()> {
        self.delete(&format!("/api/reactions/{reaction_id}/")).await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        last_read_at: DateTime<Utc>,
    ) -> Result<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/conversations/{conversation_id}/read/"),
            &MarkReadRequest { last_read_at },
        )
        .await?;
        Ok(())
    }

    async fn set_archived(&self, conversation_id: ConversationId, archived: bool) -> Result<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/conversations/{conversation_id}/archive/"),
            &ArchiveRequest {
                is_archived: archived,
            },
        )
        .await?;
        Ok(())
    }

    fn update_credential(&self, credential: Credential) {
        *self
            .credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential;
    }
}

pub struct HttpMediaUploader {
    http: Client,
    base_url: String,
    credential: Credential,
}

impl HttpMediaUploader {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }
}

#[async_trait]
impl MediaUploader for HttpMediaUploader {
    async fn upload(&self, media: MediaUpload) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/api/uploads/", self.base_url))
            .bearer_auth(self.credential.as_str())
            .query(&[
                ("filename", media.filename.clone()),
                (
                    "mime_type",
                    media
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(media.bytes)
            .send()
            .await
            .with_context(|| format!("upload {}", media.filename))?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        Ok(uploaded.url)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
