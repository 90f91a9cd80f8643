use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since the engine started
    pub timestamp_ms: u64,
}

/// One capture-engine instance.
///
/// Engines are cheap to arm (`start`) but expensive to construct; the
/// segmenter keeps a pre-built standby so the stop/start pair at a segment
/// boundary never pays construction cost. `stop` flushes whatever the engine
/// has buffered by closing the frame channel.
#[async_trait]
pub trait CaptureEngine: Send {
    /// Arm the engine and begin delivering frames.
    ///
    /// Returns a channel receiver that will receive audio frames. A
    /// permission or platform-capability failure surfaces here.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing. Flushes buffered frames and closes the channel.
    async fn stop(&mut self) -> Result<()>;

    /// Check if the engine is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get engine name for logging
    fn name(&self) -> &str;
}

/// Builds capture engines and owns the underlying media stream.
///
/// The segmenter calls `create` once per segment to rebuild the standby
/// slot; `release` lets `cleanup` drop the shared media stream when the
/// whole pipeline is torn down.
#[async_trait]
pub trait CaptureEngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn CaptureEngine>>;

    /// Release the underlying media stream. Default: nothing to release.
    async fn release(&self) {}
}
