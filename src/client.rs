//! HTTP side of a chat turn: authentication, conversation setup and opening
//! the answer stream.

use crate::config::{AppConfig, Credential};
use crate::error::{ChatError, ChatResult};
use crate::store::{CredentialStore, StoredToken};
use crate::types::ChatMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::Arc;

pub const TENANT_HEADER: &str = "x-tenant-subdomain";

pub type ByteStream = Pin<Box<dyn Stream<Item = ChatResult<Bytes>> + Send>>;

/// Body of a query request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryRequest {
    pub message: String,
    pub context_history: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_groups: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enabled_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Something that can turn a query into a stream of SSE bytes.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &QueryRequest) -> ChatResult<ByteStream>;

    /// Obtains a conversation id when the deployment needs one.
    async fn start_conversation(&self) -> ChatResult<Option<String>> {
        Ok(None)
    }
}

#[derive(Deserialize)]
struct StreamPointer {
    stream_url: Option<String>,
    query_id: Option<Value>,
}

pub struct HubClient {
    http: Client,
    config: AppConfig,
    store: Arc<dyn CredentialStore>,
}

impl HubClient {
    pub fn new(config: AppConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http: Client::new(),
            config,
            store,
        }
    }

    /// Exchanges email and password for a bearer token and caches it.
    pub async fn login(&self) -> ChatResult<String> {
        let Credential::Login { email, password } = &self.config.credential else {
            return Err(ChatError::Auth(
                "login requires HA_API_EMAIL and HA_API_PASSWORD".to_string(),
            ));
        };

        let url = self.config.endpoint(&self.config.login_path);
        tracing::info!(%url, "logging in to AI hub");
        let request = self
            .with_tenant(self.http.post(url))
            .json(&json!({ "email": email, "password": password }));
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Auth(format!("HTTP {status}: {body}")));
        }

        let parsed: Value = serde_json::from_str(&body)?;
        let token = ["access_token", "token"]
            .iter()
            .find_map(|key| {
                parsed
                    .get(*key)
                    .or_else(|| parsed.get("data").and_then(|data| data.get(*key)))
                    .and_then(Value::as_str)
            })
            .ok_or_else(|| ChatError::Auth("login response carried no token".to_string()))?
            .to_string();

        let stored = StoredToken::new(
            token.clone(),
            time::Duration::days(self.config.token_expiry_days),
        );
        self.store.save_token(&stored)?;
        Ok(token)
    }

    fn can_refresh(&self) -> bool {
        matches!(self.config.credential, Credential::Login { .. })
    }

    async fn bearer(&self, force_refresh: bool) -> ChatResult<String> {
        match &self.config.credential {
            Credential::ApiKey(key) => Ok(key.clone()),
            Credential::Login { .. } => {
                if !force_refresh && let Some(cached) = self.store.token() {
                    return Ok(cached.token);
                }
                self.login().await
            }
        }
    }

    fn with_tenant(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.tenant_subdomain {
            Some(tenant) => request.header(TENANT_HEADER, tenant),
            None => request,
        }
    }

    /// Sends an authorized request. A 401 with login credentials triggers one
    /// fresh login and a single retry.
    async fn send_authorized<F>(&self, build: F) -> ChatResult<Response>
    where
        F: Fn(&str) -> RequestBuilder + Sync,
    {
        let mut token = self.bearer(false).await?;
        let mut refreshed = false;
        loop {
            let request = self.with_tenant(build(&token)).bearer_auth(&token);
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed && self.can_refresh() {
                tracing::warn!("hub rejected bearer token, logging in again");
                refreshed = true;
                token = self.bearer(true).await?;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::Http { status, body });
            }
            return Ok(response);
        }
    }

    async fn into_byte_stream(&self, response: Response) -> ChatResult<ByteStream> {
        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"));

        if !is_json {
            return Ok(bytes_of(response));
        }

        let pointer: StreamPointer = serde_json::from_str(&response.text().await?)?;
        let url = match (pointer.stream_url, pointer.query_id) {
            (Some(url), _) => self.config.endpoint(&url),
            (None, Some(id)) => {
                let id = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
                format!("{}/{}", self.config.endpoint(&self.config.query_path), id)
            }
            (None, None) => {
                return Err(ChatError::Stream(
                    "hub answered with JSON but no stream_url or query_id".to_string(),
                ));
            }
        };

        tracing::debug!(%url, "following stream pointer");
        let response = self
            .send_authorized(|_| {
                self.http
                    .get(&url)
                    .header(header::ACCEPT, "text/event-stream")
            })
            .await?;
        Ok(bytes_of(response))
    }
}

fn bytes_of(response: Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|item| item.map_err(ChatError::from)),
    )
}

#[async_trait]
impl ChatTransport for HubClient {
    async fn open_stream(&self, request: &QueryRequest) -> ChatResult<ByteStream> {
        let url = self.config.endpoint(&self.config.query_path);
        tracing::debug!(%url, history = request.context_history.len(), "opening answer stream");
        let response = self
            .send_authorized(|_| {
                self.http
                    .post(&url)
                    .header(header::ACCEPT, "text/event-stream")
                    .json(request)
            })
            .await?;
        self.into_byte_stream(response).await
    }

    async fn start_conversation(&self) -> ChatResult<Option<String>> {
        let Some(path) = &self.config.session_path else {
            return Ok(None);
        };
        let url = self.config.endpoint(path);
        let body = match &self.config.mode {
            Some(mode) => json!({ "mode": mode }),
            None => json!({}),
        };
        let response = self
            .send_authorized(|_| self.http.post(&url).json(&body))
            .await?;
        let parsed: Value = serde_json::from_str(&response.text().await?)?;
        let id = ["conversation_id", "session_id", "id"]
            .iter()
            .find_map(|key| parsed.get(*key))
            .map(|value| match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            });
        if id.is_none() {
            tracing::warn!("session endpoint returned no conversation id");
        }
        Ok(id)
    }
}
