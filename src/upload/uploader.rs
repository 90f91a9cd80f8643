use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::cache::SegmentCache;
use super::endpoint::IngestionEndpoint;

/// Retry policy for segment delivery
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Transfer attempts per segment before falling back to the cache
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// What happened to one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The endpoint accepted the segment
    Delivered { size: u64 },
    /// All attempts failed; the payload is in the durable cache
    Cached,
}

/// Delivers segments to the ingestion endpoint, with bounded retry and a
/// durable local fallback for segments that cannot be delivered.
pub struct SegmentUploader {
    endpoint: Arc<dyn IngestionEndpoint>,
    cache: SegmentCache,
    config: UploaderConfig,
    session_id: String,
    cached_notifier: Option<mpsc::UnboundedSender<u64>>,
}

impl SegmentUploader {
    pub fn new(
        endpoint: Arc<dyn IngestionEndpoint>,
        cache: SegmentCache,
        session_id: impl Into<String>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            endpoint,
            cache,
            config,
            session_id: session_id.into(),
            cached_notifier: None,
        }
    }

    /// Subscribe to cached-segment notifications, fired once per segment
    /// that exhausted its attempts. The orchestration layer uses this to
    /// schedule a later bulk retry.
    pub fn cached_events(&mut self) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cached_notifier = Some(tx);
        rx
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// Deliver one segment. Retries up to the configured bound; exhaustion
    /// writes the payload to the durable cache instead of dropping it.
    pub async fn upload_segment(&self, sequence: u64, payload: &[u8]) -> Result<UploadOutcome> {
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            match self
                .endpoint
                .upload(&self.session_id, sequence, payload)
                .await
            {
                Ok(receipt) => {
                    info!(
                        "segment {} delivered ({} bytes accepted)",
                        sequence, receipt.size
                    );
                    // A success clears any cached copy from an earlier failure.
                    self.cache.remove(sequence);
                    return Ok(UploadOutcome::Delivered { size: receipt.size });
                }
                Err(e) => {
                    warn!(
                        "upload attempt {}/{} for segment {} failed: {}",
                        attempt, self.config.max_attempts, sequence, e
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        warn!(
            "segment {} undeliverable after {} attempts ({}), caching",
            sequence,
            self.config.max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        self.cache.store(sequence, payload)?;
        if let Some(notifier) = &self.cached_notifier {
            let _ = notifier.send(sequence);
        }
        Ok(UploadOutcome::Cached)
    }

    /// Retry every cached segment once (a single attempt per entry per
    /// call, to avoid retry storms). Returns how many were delivered.
    pub async fn retry_failed_segments(&self) -> Result<usize> {
        let entries = self.cache.entries()?;
        if entries.is_empty() {
            return Ok(0);
        }

        info!("retrying {} cached segments", entries.len());
        let mut delivered = 0;

        for sequence in entries {
            let payload = match self.cache.load(sequence) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("skipping cached segment {}: {}", sequence, e);
                    continue;
                }
            };

            match self
                .endpoint
                .upload(&self.session_id, sequence, &payload)
                .await
            {
                Ok(_) => {
                    self.cache.remove(sequence);
                    delivered += 1;
                }
                Err(e) => {
                    warn!("cached segment {} still undeliverable: {}", sequence, e);
                }
            }
        }

        info!("cached segment retry complete: {} delivered", delivered);
        Ok(delivered)
    }
}
