// src/ingest/manifest.rs

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::stem::{StemRecord, sort_stems};

pub const MANIFEST_VERSION: u32 = 1;

/// A track as the ingestion step leaves it on disk: its stems with their
/// durations and peaks, ready to open without decoding anything again.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackManifest {
    pub version: u32,
    pub title: String,
    pub stems: Vec<StemRecord>,
}

impl TrackManifest {
    /// Ingest every file; a file that fails to decode is skipped with a warning.
    pub fn from_audio_files<P: AsRef<Path>>(title: &str, paths: &[P], peak_count: usize) -> Self {
        let mut stems = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let path = path.as_ref();
            match super::ingest_stem(path, i as i32, peak_count) {
                Ok(stem) => stems.push(stem),
                Err(e) => log::warn!("skipping {}: {e:#}", path.display()),
            }
        }
        Self {
            version: MANIFEST_VERSION,
            title: title.to_string(),
            stems,
        }
    }

    /// Stems in display order.
    pub fn into_stems(mut self) -> Vec<StemRecord> {
        sort_stems(&mut self.stems);
        self.stems
    }

    pub fn save_to_disk(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load_from_disk(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let reader = BufReader::new(file);
        let manifest = serde_json::from_reader(reader)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::write_wav;

    #[test]
    fn builds_from_files_and_skips_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        let drums = dir.path().join("drums.wav");
        let bass = dir.path().join("bass.wav");
        let junk = dir.path().join("junk.wav");
        write_wav(&drums, 8_000, 2, 16_000, 0.8);
        write_wav(&bass, 8_000, 1, 8_000, 0.4);
        std::fs::write(&junk, b"nope").unwrap();

        let manifest = TrackManifest::from_audio_files("Demo", &[&drums, &junk, &bass], 50);
        assert_eq!(manifest.stems.len(), 2);
        assert_eq!(manifest.stems[0].name, "drums");
        assert_eq!(manifest.stems[1].sort_order, 2);
        assert_eq!(manifest.stems[1].duration, Some(1.0));

        let path = dir.path().join("track.json");
        manifest.save_to_disk(&path).unwrap();
        let loaded = TrackManifest::load_from_disk(&path).unwrap();
        assert_eq!(loaded, manifest);
    }
}
