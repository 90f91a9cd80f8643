use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::engine::{AudioFrame, CaptureEngine, CaptureEngineFactory};

/// Segmenter configuration
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Duration of each segment (default: 10 seconds)
    pub segment_duration: Duration,
    /// Sample rate of emitted segments
    pub sample_rate: u32,
    /// Channel count of emitted segments
    pub channels: u16,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(10),
            sample_rate: 16000,
            channels: 1,
        }
    }
}

/// One independently decodable unit of captured audio.
///
/// The payload is a complete WAV container with its own header; decoding
/// segment N never requires segments 0..N-1. Immutable once produced;
/// ownership moves to the uploader on emission.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Complete WAV bytes
    pub payload: Vec<u8>,
    /// Emission order, starting at 0
    pub sequence_number: u64,
    /// When capture of this segment began
    pub captured_at: DateTime<Utc>,
    /// Audible length derived from the sample count
    pub duration_ms: u64,
}

/// Events delivered to the segmenter's consumer
#[derive(Debug)]
pub enum SegmenterEvent {
    Segment(AudioSegment),
    /// A runtime engine failure. The recording flag has already been
    /// flipped false; the caller is responsible for unwinding.
    Error(String),
}

/// Standby slot: either an engine ready to promote, or one still being
/// built in the background.
enum StandbySlot {
    Ready(Box<dyn CaptureEngine>),
    Building(JoinHandle<Result<Box<dyn CaptureEngine>>>),
}

impl StandbySlot {
    async fn take(self) -> Result<Box<dyn CaptureEngine>> {
        match self {
            StandbySlot::Ready(engine) => Ok(engine),
            StandbySlot::Building(handle) => handle
                .await
                .context("standby engine build task panicked")?,
        }
    }
}

/// Slices continuous capture into fixed-duration, self-contained segments.
///
/// Two capture engines are kept: one current, one pre-built standby. At each
/// segment boundary the current engine is stopped (flushing its buffered
/// frames into a complete, headered WAV) and the standby takes over, so the
/// stop/start gap is milliseconds rather than engine-construction cost. A
/// replacement standby is built asynchronously off the critical path.
pub struct AudioSegmenter {
    config: SegmenterConfig,
    factory: Arc<dyn CaptureEngineFactory>,
    is_recording: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    driver: Option<JoinHandle<()>>,
}

impl AudioSegmenter {
    pub fn new(config: SegmenterConfig, factory: Arc<dyn CaptureEngineFactory>) -> Self {
        Self {
            config,
            factory,
            is_recording: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            driver: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    /// Start segmented capture.
    ///
    /// Builds and arms the current engine and pre-builds the standby; an
    /// initialization failure (permission, platform capability) aborts here
    /// before any event is emitted.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<SegmenterEvent>> {
        if self.is_recording() {
            anyhow::bail!("segmenter already recording");
        }

        let mut current = self
            .factory
            .create()
            .await
            .context("failed to create capture engine")?;
        let current_rx = current
            .start()
            .await
            .context("failed to start capture engine")?;
        let standby = self
            .factory
            .create()
            .await
            .context("failed to pre-build standby engine")?;

        info!(
            "segmenter started: {} ({}s segments)",
            current.name(),
            self.config.segment_duration.as_secs()
        );

        self.is_recording.store(true, Ordering::SeqCst);

        let (event_tx, event_rx) = mpsc::channel(32);
        let driver = tokio::spawn(drive(
            self.config.clone(),
            self.factory.clone(),
            current,
            current_rx,
            Some(StandbySlot::Ready(standby)),
            event_tx,
            self.is_recording.clone(),
            self.shutdown.clone(),
        ));
        self.driver = Some(driver);

        Ok(event_rx)
    }

    /// Stop capture: tears down the swap timer and both engines, flushing
    /// the trailing partial segment first. Idempotent.
    pub async fn stop(&mut self) {
        if !self.is_recording.swap(false, Ordering::SeqCst) && self.driver.is_none() {
            return;
        }
        self.shutdown.notify_one();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("segmenter driver task panicked: {}", e);
            }
        }
        info!("segmenter stopped");
    }

    /// Stop (if needed) and release the underlying media stream.
    pub async fn cleanup(&mut self) {
        self.stop().await;
        self.factory.release().await;
    }
}

/// The segment loop. Owns both engines for the lifetime of the recording.
#[allow(clippy::too_many_arguments)]
async fn drive(
    config: SegmenterConfig,
    factory: Arc<dyn CaptureEngineFactory>,
    mut current: Box<dyn CaptureEngine>,
    mut current_rx: mpsc::Receiver<AudioFrame>,
    mut standby: Option<StandbySlot>,
    events: mpsc::Sender<SegmenterEvent>,
    is_recording: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut sequence: u64 = 0;

    'segments: loop {
        let captured_at = Utc::now();
        let swap_at = tokio::time::Instant::now() + config.segment_duration;
        let mut samples: Vec<i16> = Vec::new();
        let mut stopping = false;

        // Collect frames until the swap timer fires or we are told to stop.
        loop {
            tokio::select! {
                frame = current_rx.recv() => {
                    match frame {
                        Some(frame) => samples.extend_from_slice(&frame.samples),
                        None => {
                            // The engine died mid-segment: its channel closed
                            // before we asked it to stop.
                            is_recording.store(false, Ordering::SeqCst);
                            let _ = events
                                .send(SegmenterEvent::Error(format!(
                                    "capture engine {} stopped unexpectedly",
                                    current.name()
                                )))
                                .await;
                            break 'segments;
                        }
                    }
                }
                _ = tokio::time::sleep_until(swap_at) => break,
                _ = shutdown.notified() => {
                    stopping = true;
                    break;
                }
            }
        }

        // Stop the current engine; its stop flushes the final buffered
        // frames through the channel before closing it.
        if let Err(e) = current.stop().await {
            warn!("error stopping capture engine: {}", e);
        }
        while let Some(frame) = current_rx.recv().await {
            samples.extend_from_slice(&frame.samples);
        }

        match encode_segment(&config, &samples, sequence, captured_at) {
            Ok(Some(segment)) => {
                info!(
                    "segment {} complete: {}ms, {} bytes",
                    segment.sequence_number,
                    segment.duration_ms,
                    segment.payload.len()
                );
                sequence += 1;
                if events.send(SegmenterEvent::Segment(segment)).await.is_err() {
                    break 'segments;
                }
            }
            Ok(None) => {
                info!("segment window closed with no audio, nothing emitted");
            }
            Err(e) => {
                error!("failed to encode segment {}: {}", sequence, e);
                is_recording.store(false, Ordering::SeqCst);
                let _ = events
                    .send(SegmenterEvent::Error(format!(
                        "failed to encode segment {}: {}",
                        sequence, e
                    )))
                    .await;
                break 'segments;
            }
        }

        if stopping || !is_recording.load(Ordering::SeqCst) {
            break;
        }

        // Promote the standby: the only work on the critical path is the
        // start call itself.
        let promoted_result = match standby.take() {
            Some(slot) => slot.take().await,
            None => Err(anyhow::anyhow!("standby slot is empty")),
        };
        let mut promoted = match promoted_result {
            Ok(engine) => engine,
            Err(e) => {
                is_recording.store(false, Ordering::SeqCst);
                let _ = events
                    .send(SegmenterEvent::Error(format!(
                        "standby engine unavailable: {}",
                        e
                    )))
                    .await;
                break;
            }
        };
        current_rx = match promoted.start().await {
            Ok(rx) => rx,
            Err(e) => {
                is_recording.store(false, Ordering::SeqCst);
                let _ = events
                    .send(SegmenterEvent::Error(format!(
                        "failed to start promoted engine: {}",
                        e
                    )))
                    .await;
                break;
            }
        };
        current = promoted;

        // Rebuild the standby off the critical path.
        let rebuild_factory = factory.clone();
        standby = Some(StandbySlot::Building(tokio::spawn(async move {
            rebuild_factory.create().await
        })));
    }

    // Teardown: make sure neither engine outlives the loop.
    if current.is_capturing() {
        if let Err(e) = current.stop().await {
            warn!("error stopping capture engine during teardown: {}", e);
        }
    }
    if let Some(StandbySlot::Building(handle)) = standby {
        handle.abort();
    }
    is_recording.store(false, Ordering::SeqCst);
}

/// Encode one window of samples as a complete, self-contained WAV.
///
/// Returns `None` when the window produced no audio at all.
fn encode_segment(
    config: &SegmenterConfig,
    samples: &[i16],
    sequence: u64,
    captured_at: DateTime<Utc>,
) -> Result<Option<AudioSegment>> {
    if samples.is_empty() {
        return Ok(None);
    }

    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("failed to create WAV writer")?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .context("failed to write sample to WAV")?;
        }
        writer.finalize().context("failed to finalize WAV")?;
    }

    let frames = samples.len() as u64 / config.channels.max(1) as u64;
    let duration_ms = frames * 1000 / config.sample_rate.max(1) as u64;

    Ok(Some(AudioSegment {
        payload: cursor.into_inner(),
        sequence_number: sequence,
        captured_at,
        duration_ms,
    }))
}
