use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub stream: StreamSettings,
    pub ingest: IngestSettings,
    pub audio: AudioSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamSettings {
    /// Base websocket URL; the session id is appended as a path segment
    pub url: String,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    #[serde(default = "default_reconnect_base_seconds")]
    pub reconnect_base_seconds: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct IngestSettings {
    /// Base HTTP URL of the segment ingestion service
    pub url: String,
    #[serde(default = "default_upload_attempts")]
    pub max_upload_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageSettings {
    /// Root directory for the durable segment cache
    pub cache_dir: String,
}

fn default_heartbeat_seconds() -> u64 {
    10
}

fn default_ready_timeout_seconds() -> u64 {
    5
}

fn default_reconnect_base_seconds() -> u64 {
    2
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_segment_seconds() -> u64 {
    10
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NOTESTREAM").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn stream_config(&self) -> crate::stream::StreamConfig {
        crate::stream::StreamConfig {
            heartbeat_interval: Duration::from_secs(self.stream.heartbeat_seconds),
            ready_timeout: Duration::from_secs(self.stream.ready_timeout_seconds),
            reconnect_base: Duration::from_secs(self.stream.reconnect_base_seconds),
            max_reconnect_attempts: self.stream.max_reconnect_attempts,
            ..crate::stream::StreamConfig::default()
        }
    }

    pub fn flow_config(&self) -> crate::flow::FlowConfig {
        crate::flow::FlowConfig {
            segmenter: crate::audio::SegmenterConfig {
                segment_duration: Duration::from_secs(self.audio.segment_seconds),
                sample_rate: self.audio.sample_rate,
                channels: self.audio.channels,
            },
            uploader: crate::upload::UploaderConfig {
                max_attempts: self.ingest.max_upload_attempts,
                ..crate::upload::UploaderConfig::default()
            },
            cache_dir: self.storage.cache_dir.clone().into(),
            ..crate::flow::FlowConfig::default()
        }
    }
}
