//! HTTP implementation of the delivery contract.
//!
//! - `POST {base}/events` with body `{"events": [...]}` and an
//!   `Idempotency-Key` header
//! - `GET {base}/events?since=<millis>[&operation=<id>]`, answered with either
//!   a bare event array or `{"events": [...], "cursor": <millis>}`

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use opsync_core::{CorrelationId, OperationId, Timestamp};
use opsync_events::Event;

use crate::config::SyncConfig;
use crate::transport::{FetchBatch, RemotePeer, TransportError};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Serialize)]
struct SendBody<'a> {
    events: &'a [Event],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FetchBody {
    Batch(FetchBatch),
    Events(Vec<Event>),
}

impl From<FetchBody> for FetchBatch {
    fn from(body: FetchBody) -> Self {
        match body {
            FetchBody::Batch(batch) => batch,
            FetchBody::Events(events) => FetchBatch { events, cursor: None },
        }
    }
}

/// Remote peer reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::NotConfigured(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Client for `config.remote_url` using `config.request_timeout`.
    pub fn from_config(config: &SyncConfig) -> Result<Self, TransportError> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or_else(|| TransportError::NotConfigured("no remote url".to_string()))?;
        Self::new(url, config.request_timeout)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn fetch_query(operation: Option<OperationId>, since: Option<Timestamp>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(since) = since {
        query.push(("since", since.as_millis().to_string()));
    }
    if let Some(operation) = operation {
        query.push(("operation", operation.to_string()));
    }
    query
}

fn map_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

async fn reject(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    TransportError::Rejected { status, body }
}

#[async_trait]
impl RemotePeer for HttpRemote {
    async fn send(&self, idempotency_key: CorrelationId, events: &[Event]) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.events_url())
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(&SendBody { events });
        let response = self.authorize(request).send().await.map_err(map_request_error)?;
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        tracing::debug!(key = %idempotency_key, events = events.len(), "batch delivered");
        Ok(())
    }

    async fn fetch(
        &self,
        operation: Option<OperationId>,
        since: Option<Timestamp>,
    ) -> Result<FetchBatch, TransportError> {
        let request = self.client.get(self.events_url()).query(&fetch_query(operation, since));
        let response = self.authorize(request).send().await.map_err(map_request_error)?;
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        let body: FetchBody = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(body.into())
    }
}
