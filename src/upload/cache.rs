use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Durable on-disk fallback for segments that could not be delivered.
///
/// One file per segment, keyed by sequence number. Entries are removed only
/// when a later upload of that sequence succeeds.
pub struct SegmentCache {
    dir: PathBuf,
}

impl SegmentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("failed to create segment cache directory")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("segment-{:05}.wav", sequence))
    }

    /// Persist a segment payload. Overwrites any stale entry for the same
    /// sequence.
    pub fn store(&self, sequence: u64, payload: &[u8]) -> Result<()> {
        let path = self.path_for(sequence);
        fs::write(&path, payload)
            .with_context(|| format!("failed to cache segment {} at {:?}", sequence, path))?;
        info!("cached segment {} ({} bytes)", sequence, payload.len());
        Ok(())
    }

    pub fn load(&self, sequence: u64) -> Result<Vec<u8>> {
        let path = self.path_for(sequence);
        fs::read(&path).with_context(|| format!("failed to read cached segment {}", sequence))
    }

    /// Remove the cached entry for a sequence, if present.
    pub fn remove(&self, sequence: u64) {
        let path = self.path_for(sequence);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove cached segment {}: {}", sequence, e);
            }
        }
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.path_for(sequence).exists()
    }

    /// Sequence numbers of every cached segment, ascending.
    pub fn entries(&self) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for entry in fs::read_dir(&self.dir).context("failed to read segment cache directory")? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(seq) = name
                .strip_prefix("segment-")
                .and_then(|rest| rest.strip_suffix(".wav"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }
}
