//! Network transport used for manifest and artifact transfers.
//!
//! The engine only needs two things from the network: fetch a small document
//! in one piece, and open a byte stream starting at an offset. Both report the
//! fingerprint of the certificate the server presented so callers can apply
//! host pinning.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::error::{NetworkError, UpdateError};
use crate::trust::fingerprint_of;

/// Body of an open transfer.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetworkError>> + Send>>;

/// A small document fetched in one piece.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: Bytes,
    pub peer_fingerprint: Option<String>,
}

/// Request for a byte stream starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: Url,
    pub offset: u64,
}

/// An open transfer.
pub struct TransferResponse {
    /// Offset the body starts at. Zero when the server ignored the range.
    pub offset: u64,
    /// Full resource length, when the server reported it
    pub total: Option<u64>,
    pub peer_fingerprint: Option<String>,
    pub body: ChunkStream,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("offset", &self.offset)
            .field("total", &self.total)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .finish_non_exhaustive()
    }
}

/// Network access for the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a whole document.
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, NetworkError>;

    /// Open a byte stream, resuming at `request.offset` when the server
    /// supports ranges.
    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse, NetworkError>;
}

/// reqwest-backed HTTPS transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client that only speaks HTTPS and records the peer
    /// certificate of every response.
    pub fn new(connect_timeout: Duration) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .https_only(true)
            .tls_info(true)
            .user_agent(format!("update-engine/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn peer_fingerprint(response: &reqwest::Response) -> Option<String> {
        response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(fingerprint_of)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url) -> Result<FetchedDocument, NetworkError> {
        debug!(url = %url, "Fetching document");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
            });
        }

        let peer_fingerprint = Self::peer_fingerprint(&response);
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "Fetched document");
        Ok(FetchedDocument {
            body,
            peer_fingerprint,
        })
    }

    async fn open(&self, request: &TransferRequest) -> Result<TransferResponse, NetworkError> {
        let mut builder = self.client.get(request.url.clone());
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
            });
        }

        let offset = if status == StatusCode::PARTIAL_CONTENT {
            request.offset
        } else {
            if request.offset > 0 {
                warn!(url = %request.url, "Server does not support range requests, restarting transfer");
            }
            0
        };

        let total = response.content_length().map(|len| offset + len);
        let peer_fingerprint = Self::peer_fingerprint(&response);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(NetworkError::from))
            .boxed();

        Ok(TransferResponse {
            offset,
            total,
            peer_fingerprint,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_plain_http_refused() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let url = Url::parse("http://127.0.0.1:9/manifest.json").unwrap();
        assert!(transport.fetch(&url).await.is_err());
    }
}
