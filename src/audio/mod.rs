//! Segmented audio capture
//!
//! Capture engines sit behind the `CaptureEngine` trait; the `AudioSegmenter`
//! runs a two-slot engine pool that emits fixed-duration, independently
//! decodable WAV segments.

pub mod engine;
pub mod segmenter;

pub use engine::{AudioFrame, CaptureEngine, CaptureEngineFactory};
pub use segmenter::{AudioSegment, AudioSegmenter, SegmenterConfig, SegmenterEvent};
