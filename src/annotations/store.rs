// src/annotations/store.rs

//! The comment persistence collaborator. The playback core only needs
//! list/create/delete; where the comments actually live is up to the
//! implementation.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::{Comment, CommentId, NewComment};
use crate::error::StoreError;
use crate::stem::StemId;

pub trait CommentStore: Send + Sync {
    /// Comments of one stem, ordered by timestamp.
    fn list(&self, stem: &StemId) -> impl Future<Output = Result<Vec<Comment>, StoreError>> + Send;

    /// Persist a new comment; the store assigns its id.
    fn create(&self, comment: NewComment) -> impl Future<Output = Result<Comment, StoreError>> + Send;

    fn delete(&self, id: &CommentId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommentDocument {
    next_id: u64,
    comments: BTreeMap<CommentId, Comment>,
}

impl CommentDocument {
    fn list(&self, stem: &StemId) -> Vec<Comment> {
        let mut out: Vec<Comment> = self
            .comments
            .values()
            .filter(|c| &c.stem_id == stem)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        out
    }

    fn insert(&mut self, new: NewComment) -> Comment {
        self.next_id += 1;
        let comment = Comment {
            id: CommentId::new(format!("c{}", self.next_id)),
            stem_id: new.stem_id,
            timestamp: new.timestamp,
            author_id: new.author_id,
            content: new.content,
        };
        self.comments.insert(comment.id.clone(), comment.clone());
        comment
    }

    fn remove(&mut self, id: &CommentId) -> Result<(), StoreError> {
        self.comments
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::Rejected(format!("no comment with id {id}")))
    }
}

/// Process-local store. Used headless and in tests.
#[derive(Debug, Default)]
pub struct InMemoryCommentStore {
    doc: Mutex<CommentDocument>,
}

impl InMemoryCommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .comments
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommentStore for InMemoryCommentStore {
    async fn list(&self, stem: &StemId) -> Result<Vec<Comment>, StoreError> {
        let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(doc.list(stem))
    }

    async fn create(&self, comment: NewComment) -> Result<Comment, StoreError> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(doc.insert(comment))
    }

    async fn delete(&self, id: &CommentId) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        doc.remove(id)
    }
}

/// Comments kept in one JSON document next to the track manifest.
/// Every operation re-reads the file, so several viewers on the same
/// machine see each other's comments after a reload.
pub struct JsonFileCommentStore {
    path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl JsonFileCommentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_doc(&self) -> Result<CommentDocument, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(CommentDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CommentDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_doc(&self, doc: &CommentDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl CommentStore for JsonFileCommentStore {
    async fn list(&self, stem: &StemId) -> Result<Vec<Comment>, StoreError> {
        let _guard = self.io_lock.lock().await;
        Ok(self.read_doc().await?.list(stem))
    }

    async fn create(&self, comment: NewComment) -> Result<Comment, StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_doc().await?;
        let created = doc.insert(comment);
        self.write_doc(&doc).await?;
        Ok(created)
    }

    async fn delete(&self, id: &CommentId) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut doc = self.read_doc().await?;
        doc.remove(id)?;
        self.write_doc(&doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AuthorId;

    fn draft(stem: &str, t: f64, text: &str) -> NewComment {
        NewComment {
            stem_id: StemId::new(stem),
            timestamp: t,
            author_id: AuthorId::new("u1"),
            content: text.to_string(),
        }
    }

    #[tokio::test]
    async fn memory_store_lists_per_stem_in_time_order() {
        let store = InMemoryCommentStore::new();
        store.create(draft("bass", 30.0, "late")).await.unwrap();
        store.create(draft("bass", 10.0, "early")).await.unwrap();
        store.create(draft("drums", 5.0, "other")).await.unwrap();

        let bass = store.list(&StemId::new("bass")).await.unwrap();
        let times: Vec<f64> = bass.iter().map(|c| c.timestamp).collect();
        assert_eq!(times, vec![10.0, 30.0]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comments.json");

        let store = JsonFileCommentStore::new(&path);
        let created = store.create(draft("vox", 42.5, "nice take")).await.unwrap();
        drop(store);

        let reopened = JsonFileCommentStore::new(&path);
        let listed = reopened.list(&StemId::new("vox")).await.unwrap();
        assert_eq!(listed, vec![created.clone()]);

        reopened.delete(&created.id).await.unwrap();
        assert!(reopened.list(&StemId::new("vox")).await.unwrap().is_empty());
        assert!(reopened.delete(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comments.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileCommentStore::new(&path);
        assert!(matches!(
            store.list(&StemId::new("vox")).await,
            Err(StoreError::Format(_))
        ));
    }
}
