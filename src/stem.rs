// src/stem.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a stem. Stable across the ingestion store and comments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StemId(pub String);

impl StemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemKind {
    Vocals,
    Drums,
    Bass,
    Guitar,
    Keys,
    Synth,
    Fx,
    #[default]
    Other,
}

impl StemKind {
    pub fn default_color(self) -> &'static str {
        match self {
            StemKind::Vocals => "#f6bbd6",
            StemKind::Drums => "#348c32",
            StemKind::Bass => "#d4573b",
            StemKind::Guitar => "#f8a01c",
            StemKind::Keys => "#8b5cf6",
            StemKind::Synth => "#06b6d4",
            StemKind::Fx => "#a78bfa",
            StemKind::Other => "#94a3b8",
        }
    }

    /// Best-effort guess from a file or stem name ("Lead Vocals.wav" -> Vocals).
    pub fn guess(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let table = [
            ("vocal", StemKind::Vocals),
            ("vox", StemKind::Vocals),
            ("drum", StemKind::Drums),
            ("bass", StemKind::Bass),
            ("guitar", StemKind::Guitar),
            ("keys", StemKind::Keys),
            ("piano", StemKind::Keys),
            ("synth", StemKind::Synth),
            ("fx", StemKind::Fx),
        ];
        table
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or_default()
    }
}

/// A stem as handed over by the ingestion store. Read-only to the playback core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StemRecord {
    pub id: StemId,
    pub name: String,
    #[serde(default)]
    pub kind: StemKind,
    #[serde(default)]
    pub color: Option<String>,
    /// File path or URI of the audio source.
    pub audio_source: String,
    /// Seconds. Absent until the ingestion pipeline (or the engine) has measured it.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Per-block max absolute amplitude. Presentation only, never used for timing.
    #[serde(default)]
    pub peaks: Vec<f32>,
    #[serde(default)]
    pub sort_order: i32,
}

impl StemRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, audio_source: impl Into<String>) -> Self {
        Self {
            id: StemId::new(id),
            name: name.into(),
            kind: StemKind::Other,
            color: None,
            audio_source: audio_source.into(),
            duration: None,
            peaks: Vec::new(),
            sort_order: 0,
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn color(&self) -> &str {
        self.color
            .as_deref()
            .unwrap_or_else(|| self.kind.default_color())
    }
}

/// Stems of one track are iterated in `sort_order`. Stable for equal keys.
pub fn sort_stems(stems: &mut [StemRecord]) {
    stems.sort_by_key(|s| s.sort_order);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_sort_order_keeping_ties_stable() {
        let mut stems = vec![
            StemRecord::new("c", "Keys", "c.wav").with_sort_order(2),
            StemRecord::new("a", "Drums", "a.wav").with_sort_order(0),
            StemRecord::new("b1", "Bass", "b1.wav").with_sort_order(1),
            StemRecord::new("b2", "Bass DI", "b2.wav").with_sort_order(1),
        ];
        sort_stems(&mut stems);
        let ids: Vec<&str> = stems.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b1", "b2", "c"]);
    }

    #[test]
    fn falls_back_to_kind_color() {
        let mut stem = StemRecord::new("v", "Lead Vocals", "v.wav");
        stem.kind = StemKind::guess(&stem.name);
        assert_eq!(stem.kind, StemKind::Vocals);
        assert_eq!(stem.color(), "#f6bbd6");

        stem.color = Some("#ffffff".into());
        assert_eq!(stem.color(), "#ffffff");
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let json = r#"{ "id": "s1", "name": "Drums", "audio_source": "drums.flac" }"#;
        let stem: StemRecord = serde_json::from_str(json).unwrap();
        assert_eq!(stem.id, StemId::new("s1"));
        assert_eq!(stem.kind, StemKind::Other);
        assert!(stem.duration.is_none());
        assert!(stem.peaks.is_empty());
    }
}
