use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Acknowledgement for one delivered segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IngestReceipt {
    /// Number of payload bytes the endpoint accepted
    pub size: u64,
}

/// Failures from the ingestion endpoint.
///
/// A structured remote error renders as `"<code>: <message>"`; a non-2xx
/// response without a structured body falls back to the HTTP status.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    #[error("upload failed with HTTP status {0}")]
    Http(u16),

    #[error("network error: {0}")]
    Network(String),
}

/// Structured error body some ingestion responses carry
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Map a non-2xx response to an `IngestError`, preferring the structured
/// `{code, message}` body when one is present.
pub fn error_from_response(status: u16, body: &str) -> IngestError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => IngestError::Remote {
            code: parsed.code,
            message: parsed.message,
        },
        Err(_) => IngestError::Http(status),
    }
}

/// Remote ingestion endpoint for audio segments
#[async_trait]
pub trait IngestionEndpoint: Send + Sync {
    /// Issue a single transfer attempt for one segment.
    async fn upload(
        &self,
        session_id: &str,
        sequence: u64,
        payload: &[u8],
    ) -> Result<IngestReceipt, IngestError>;
}

/// HTTP-backed ingestion endpoint
pub struct HttpIngestionEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIngestionEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn segment_url(&self, session_id: &str, sequence: u64) -> String {
        format!(
            "{}/sessions/{}/segments/{}",
            self.base_url.trim_end_matches('/'),
            session_id,
            sequence
        )
    }
}

#[async_trait]
impl IngestionEndpoint for HttpIngestionEndpoint {
    async fn upload(
        &self,
        session_id: &str,
        sequence: u64,
        payload: &[u8],
    ) -> Result<IngestReceipt, IngestError> {
        let url = self.segment_url(session_id, sequence);
        debug!("uploading segment {} ({} bytes) to {}", sequence, payload.len(), url);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<IngestReceipt>()
                .await
                .map_err(|e| IngestError::Network(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(error_from_response(status.as_u16(), &body))
        }
    }
}
