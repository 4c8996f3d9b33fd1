//! [`ChatApi`] over the portal's JSON endpoints.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | call                 | request                                          |
//! |----------------------|--------------------------------------------------|
//! | `issue_ticket`       | `POST chat/ticket`                               |
//! | `fetch_rooms`        | `GET chat/rooms`                                 |
//! | `fetch_page`         | `GET chat/rooms/{code}/messages?page=&size=`     |
//! | `mark_read`          | `POST chat/rooms/{code}/read`                    |
//! | `fetch_unread_counts`| `GET chat/unread`                                |
//!
//! Requests carry the caller's existing portal credential as a bearer token.

use std::collections::BTreeMap;
use std::time::Duration;

use concierge_proto::message::{MessagePage, RoomCode, RoomSummary, Seq};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiError, ChatApi};
use crate::transport::Ticket;

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    last_read_seq: Seq,
}

/// HTTP client for the portal's chat API.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: url::Url,
    credential: Option<String>,
}

impl std::fmt::Debug for HttpChatApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatApi")
            .field("base_url", &self.base_url.as_str())
            .field("credential", &self.credential.as_ref().map(|_| ".."))
            .finish_non_exhaustive()
    }
}

impl HttpChatApi {
    /// Create a client for `base_url` (for example `https://portal.example.com/api/`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Network`] if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: &str,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        // Joining relative paths drops the last segment unless it ends in '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = url::Url::parse(&normalized)
            .map_err(|e| ApiError::Network(format!("invalid API base URL {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            credential,
        })
    }

    fn url(&self, path: &str) -> Result<url::Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Network(format!("invalid path {path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "chat API request failed");
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
            _ => ApiError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: url::Url) -> Result<T, ApiError> {
        self.send(self.client.get(url))
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl ChatApi for HttpChatApi {
    async fn issue_ticket(&self) -> Result<Ticket, ApiError> {
        let url = self.url("chat/ticket")?;
        let body: TicketResponse = self
            .send(self.client.post(url))
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Ticket::new(body.ticket))
    }

    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>, ApiError> {
        self.get_json(self.url("chat/rooms")?).await
    }

    async fn fetch_page(
        &self,
        room: &RoomCode,
        page_index: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiError> {
        let mut url = self.url(&format!("chat/rooms/{room}/messages"))?;
        url.query_pairs_mut()
            .append_pair("page", &page_index.to_string())
            .append_pair("size", &page_size.to_string());
        match self.get_json(url).await {
            Err(ApiError::Status { status: 404, .. }) => Err(ApiError::RoomNotFound(room.clone())),
            other => other,
        }
    }

    async fn mark_read(&self, room: &RoomCode, last_read_seq: Seq) -> Result<(), ApiError> {
        let url = self.url(&format!("chat/rooms/{room}/read"))?;
        self.send(self.client.post(url).json(&ReadRequest { last_read_seq }))
            .await?;
        Ok(())
    }

    async fn fetch_unread_counts(&self) -> Result<BTreeMap<RoomCode, u32>, ApiError> {
        self.get_json(self.url("chat/unread")?).await
    }
}
