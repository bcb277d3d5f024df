// src/annotations/mod.rs

//! Timestamp-anchored comments on a stem's timeline.
//!
//! Comments are immutable once created; the only mutation is deletion by
//! their author. Validation happens here, before the store is contacted.

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

pub use store::{CommentStore, InMemoryCommentStore, JsonFileCommentStore};

use crate::error::AnnotationError;
use crate::stem::{StemId, StemRecord};
use crate::timeline;
use crate::transport::SeekTarget;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub String);

impl CommentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(pub String);

impl AuthorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub stem_id: StemId,
    /// Seconds from the start of the stem.
    pub timestamp: f64,
    pub author_id: AuthorId,
    pub content: String,
}

/// A validated comment on its way to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub stem_id: StemId,
    pub timestamp: f64,
    pub author_id: AuthorId,
    pub content: String,
}

/// What a click on a stem's timeline means.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClickMode {
    #[default]
    Seek,
    Annotate,
}

impl ClickMode {
    pub fn toggled(self) -> Self {
        match self {
            ClickMode::Seek => ClickMode::Annotate,
            ClickMode::Annotate => ClickMode::Seek,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClickAction {
    /// The transport was told to seek here.
    Seeked(f64),
    /// Annotate mode: the caller should collect the text and call `create_comment`.
    Annotate { stem: StemId, timestamp: f64 },
    /// Click fell outside a usable timeline (no width or no duration yet).
    Ignored,
}

/// A comment marker placed on a rendered strip.
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    pub comment: CommentId,
    pub x: f64,
}

pub struct AnnotationLayer<S> {
    store: S,
    durations: HashMap<StemId, Option<f64>>,
    comments: BTreeMap<StemId, Vec<Comment>>,
}

impl<S: CommentStore> AnnotationLayer<S> {
    pub fn new(store: S, stems: &[StemRecord]) -> Self {
        Self {
            store,
            durations: stems.iter().map(|s| (s.id.clone(), s.duration)).collect(),
            comments: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stems without an ingested duration learn it once their engine loads.
    pub fn set_stem_duration(&mut self, stem: &StemId, duration: f64) {
        if let Some(slot) = self.durations.get_mut(stem) {
            *slot = Some(duration);
        }
    }

    /// Replace the cached comments of `stem` with the store's list.
    pub async fn load(&mut self, stem: &StemId) -> Result<usize, AnnotationError> {
        if !self.durations.contains_key(stem) {
            return Err(AnnotationError::UnknownStem(stem.clone()));
        }
        let mut list = self.store.list(stem).await?;
        sort_by_time(&mut list);
        let count = list.len();
        self.comments.insert(stem.clone(), list);
        debug!("loaded {count} comments for stem {stem}");
        Ok(count)
    }

    pub async fn load_all(&mut self) -> Result<usize, AnnotationError> {
        let stems: Vec<StemId> = self.durations.keys().cloned().collect();
        let mut total = 0;
        for stem in &stems {
            total += self.load(stem).await?;
        }
        Ok(total)
    }

    pub async fn create_comment(
        &mut self,
        stem: &StemId,
        timestamp: f64,
        content: &str,
        author: &AuthorId,
    ) -> Result<&Comment, AnnotationError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AnnotationError::EmptyContent);
        }
        let duration = match self.durations.get(stem) {
            None => return Err(AnnotationError::UnknownStem(stem.clone())),
            Some(None) => return Err(AnnotationError::DurationUnknown(stem.clone())),
            Some(Some(d)) => *d,
        };
        if !timestamp.is_finite() || timestamp < 0.0 || timestamp > duration {
            return Err(AnnotationError::InvalidTimestamp { timestamp, duration });
        }

        let created = self
            .store
            .create(NewComment {
                stem_id: stem.clone(),
                timestamp,
                author_id: author.clone(),
                content: content.to_string(),
            })
            .await?;
        info!(
            "comment {} added on {stem} at {}",
            created.id,
            timeline::format_time(created.timestamp)
        );

        let list = self.comments.entry(stem.clone()).or_default();
        let at = list.partition_point(|c| c.timestamp <= created.timestamp);
        list.insert(at, created);
        Ok(&list[at])
    }

    /// Only the author may delete. Nothing is sent to the store otherwise.
    pub async fn delete_comment(
        &mut self,
        id: &CommentId,
        requester: &AuthorId,
    ) -> Result<(), AnnotationError> {
        let comment = self
            .find(id)
            .ok_or_else(|| AnnotationError::NotFound(id.clone()))?;
        if &comment.author_id != requester {
            return Err(AnnotationError::PermissionDenied {
                comment: id.clone(),
                requester: requester.clone(),
                author: comment.author_id.clone(),
            });
        }
        let stem = comment.stem_id.clone();

        self.store.delete(id).await?;
        if let Some(list) = self.comments.get_mut(&stem) {
            list.retain(|c| &c.id != id);
        }
        info!("comment {id} deleted by {requester}");
        Ok(())
    }

    pub fn comments_for(&self, stem: &StemId) -> &[Comment] {
        self.comments.get(stem).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every loaded comment across stems, by timestamp.
    pub fn comments_sorted(&self) -> Vec<&Comment> {
        let mut all: Vec<&Comment> = self.comments.values().flatten().collect();
        all.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        all
    }

    pub fn find(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.values().flatten().find(|c| &c.id == id)
    }

    /// Same click, two meanings: seek the transport, or start a new comment.
    pub fn click<T: SeekTarget>(
        &self,
        mode: ClickMode,
        stem: &StemId,
        pixel_x: f64,
        width: f64,
        duration: f64,
        target: &mut T,
    ) -> ClickAction {
        let Some(timestamp) = timeline::hit_test(pixel_x, width, duration) else {
            return ClickAction::Ignored;
        };
        match mode {
            ClickMode::Seek => {
                target.seek(timestamp);
                ClickAction::Seeked(timestamp)
            }
            ClickMode::Annotate => ClickAction::Annotate {
                stem: stem.clone(),
                timestamp,
            },
        }
    }

    pub fn seek_to_comment<T: SeekTarget>(
        &self,
        id: &CommentId,
        target: &mut T,
    ) -> Result<f64, AnnotationError> {
        let comment = self
            .find(id)
            .ok_or_else(|| AnnotationError::NotFound(id.clone()))?;
        target.seek(comment.timestamp);
        Ok(comment.timestamp)
    }

    /// Marker positions for `stem` against the shared duration.
    pub fn markers(&self, stem: &StemId, duration: f64, width: f64) -> Vec<Marker> {
        self.comments_for(stem)
            .iter()
            .map(|c| Marker {
                comment: c.id.clone(),
                x: timeline::time_to_x(c.timestamp, duration, width),
            })
            .collect()
    }
}

fn sort_by_time(list: &mut [Comment]) {
    list.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
}
