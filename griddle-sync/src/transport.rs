use crate::types::{GetParams, GetResponse};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Transport failures, classified so the sync loop can decide which ones
/// count as "the peer is simply gone".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("no response from peer: {0}")]
    NoResponse(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("peer returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// The error classes that mean the peer is unreachable rather than
    /// disagreeing: connection-level failures plus HTTP 503 and 404.
    pub fn is_unreachable(&self) -> bool {
        match self {
            TransportError::ConnectRefused(_)
            | TransportError::ConnectTimeout(_)
            | TransportError::NoResponse(_)
            | TransportError::Socket(_) => true,
            TransportError::Status { status, .. } => *status == 503 || *status == 404,
            TransportError::Malformed(_) => false,
        }
    }
}

/// The shard RPC seam peer sync talks through. Production uses
/// [`HttpSyncClient`]; tests substitute in-process fakes.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn get(&self, replica: &str, params: &GetParams) -> Result<GetResponse, TransportError>;
}

/// HTTP client for a peer's `/get` endpoint.
pub struct HttpSyncClient {
    http: reqwest::Client,
}

impl Default for HttpSyncClient {
    fn default() -> Self {
        HttpSyncClient::new()
    }
}

impl HttpSyncClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpSyncClient { http }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncClient {
    async fn get(&self, replica: &str, params: &GetParams) -> Result<GetResponse, TransportError> {
        let url = format!("{}/get", replica.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .query(&params.to_query_pairs())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: format!("from {}", replica),
            });
        }

        response
            .json::<GetResponse>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::ConnectTimeout(e.to_string())
    } else if e.is_connect() {
        TransportError::ConnectRefused(e.to_string())
    } else if e.is_request() {
        TransportError::Socket(e.to_string())
    } else {
        TransportError::NoResponse(e.to_string())
    }
}
