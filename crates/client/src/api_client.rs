//! REST client for the chat server.
//!
//! Every response is wrapped in an [`ApiResponse`] envelope. [`ApiClient`]
//! does the HTTP and envelope decoding; the [`RemoteApi`] trait is the
//! boundary the rest of the client talks to, where any failure collapses to
//! `None` / `false` after being logged.

use async_trait::async_trait;
use chasper_shared::{
    rejection_reason, ApiError, ApiResponse, Channel, CreateChannelRequest, GetChannelsResponse,
    GetMessagesRequest, Message, PaginatedResponse, SendMessageRequest, SendMessageResponse,
    UpdateMessageRequest,
};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Remote procedure boundary. Implementations never return partial results.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send_message(&self, request: &SendMessageRequest) -> Option<Message>;
    async fn get_messages(&self, request: &GetMessagesRequest) -> Option<PaginatedResponse<Message>>;
    async fn update_message(&self, message_id: &str, content: &str) -> Option<Message>;
    async fn delete_message(&self, message_id: &str) -> bool;
    async fn get_channels(&self) -> Option<Vec<Channel>>;
    async fn get_channel(&self, channel_id: &str) -> Option<Channel>;
    async fn create_channel(&self, request: &CreateChannelRequest) -> Option<Channel>;
    async fn join_channel(&self, channel_id: &str) -> bool;
    async fn leave_channel(&self, channel_id: &str) -> bool;
}

/// HTTP client for the chat server's REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send `token` as a bearer credential on every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    /// GET and decode the envelope
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<TRes>, ApiError> {
        self.request(Method::GET, path, None).await
    }

    /// POST a JSON body and decode the envelope
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<ApiResponse<TRes>, ApiError> {
        self.request(Method::POST, path, Some(encode(body)?)).await
    }

    /// POST without a body
    pub async fn post_empty<TRes: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<TRes>, ApiError> {
        self.request(Method::POST, path, None).await
    }

    /// PUT a JSON body and decode the envelope
    pub async fn put_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<ApiResponse<TRes>, ApiError> {
        self.request(Method::PUT, path, Some(encode(body)?)).await
    }

    /// DELETE and decode the envelope
    pub async fn delete<TRes: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<TRes>, ApiError> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request<TRes: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ApiResponse<TRes>, ApiError> {
        let url = self.url(path);
        let mut rb = self.client.request(method, &url);

        if let Some(token) = &self.token {
            rb = rb.bearer_auth(token);
        }
        if let Some(bytes) = body {
            rb = rb.body(bytes).header("Content-Type", "application/json");
        }

        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        decode_envelope(&text)
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))
}

/// An empty 2xx body counts as a bare success.
fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<ApiResponse<T>, ApiError> {
    if text.trim().is_empty() {
        return Ok(ApiResponse {
            success: true,
            data: None,
            error: None,
            message: None,
        });
    }
    serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
}

/// The envelope's payload, or why there is none.
fn into_data<T>(resp: ApiResponse<T>) -> Result<T, ApiError> {
    if !resp.success {
        return Err(ApiError::Rejected(rejection_reason(&resp)));
    }
    resp.data
        .ok_or_else(|| ApiError::Deserialize("response carried no data".to_string()))
}

fn into_ack<T>(resp: ApiResponse<T>) -> Result<(), ApiError> {
    if resp.success {
        Ok(())
    } else {
        Err(ApiError::Rejected(rejection_reason(&resp)))
    }
}

/// Log a failed call and collapse it to `None`.
fn settle<T>(what: &str, result: Result<T, ApiError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            crate::log_error!("Failed to {}: {}", what, e);
            None
        }
    }
}

fn messages_query(request: &GetMessagesRequest) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("channelId", &request.channel_id);
    if let Some(page) = request.page {
        query.append_pair("page", &page.to_string());
    }
    if let Some(limit) = request.limit {
        query.append_pair("limit", &limit.to_string());
    }
    if let Some(before) = &request.before {
        query.append_pair("before", before);
    }
    query.finish()
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn send_message(&self, request: &SendMessageRequest) -> Option<Message> {
        let result = self
            .post_json::<_, SendMessageResponse>("/messages", request)
            .await
            .and_then(into_data);
        settle("send message", result).map(|resp| resp.message)
    }

    async fn get_messages(&self, request: &GetMessagesRequest) -> Option<PaginatedResponse<Message>> {
        let path = format!("/messages?{}", messages_query(request));
        settle("get messages", self.get_json(&path).await.and_then(into_data))
    }

    async fn update_message(&self, message_id: &str, content: &str) -> Option<Message> {
        let body = UpdateMessageRequest {
            content: content.to_string(),
        };
        let result = self
            .put_json(&format!("/messages/{message_id}"), &body)
            .await
            .and_then(into_data);
        settle("update message", result)
    }

    async fn delete_message(&self, message_id: &str) -> bool {
        let result = self
            .delete::<serde_json::Value>(&format!("/messages/{message_id}"))
            .await
            .and_then(into_ack);
        settle("delete message", result).is_some()
    }

    async fn get_channels(&self) -> Option<Vec<Channel>> {
        let result = self
            .get_json::<GetChannelsResponse>("/channels")
            .await
            .and_then(into_data);
        settle("get channels", result).map(|resp| resp.channels)
    }

    async fn get_channel(&self, channel_id: &str) -> Option<Channel> {
        let result = self
            .get_json(&format!("/channels/{channel_id}"))
            .await
            .and_then(into_data);
        settle("get channel", result)
    }

    async fn create_channel(&self, request: &CreateChannelRequest) -> Option<Channel> {
        settle(
            "create channel",
            self.post_json("/channels", request).await.and_then(into_data),
        )
    }

    async fn join_channel(&self, channel_id: &str) -> bool {
        let result = self
            .post_empty::<serde_json::Value>(&format!("/channels/{channel_id}/join"))
            .await
            .and_then(into_ack);
        settle("join channel", result).is_some()
    }

    async fn leave_channel(&self, channel_id: &str) -> bool {
        let result = self
            .post_empty::<serde_json::Value>(&format!("/channels/{channel_id}/leave"))
            .await
            .and_then(into_ack);
        settle("leave channel", result).is_some()
    }
}
