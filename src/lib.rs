// src/lib.rs

pub mod annotations;
pub mod audio;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod session;
pub mod stem;
pub mod sync;
pub mod timeline;
pub mod transport;

pub use annotations::{AnnotationLayer, AuthorId, Comment, CommentId, CommentStore};
pub use config::PlayerConfig;
pub use controller::DeckController;
pub use engine::{EngineFactory, StemEngine, StreamEngineFactory, VirtualEngineFactory};
pub use ingest::manifest::TrackManifest;
pub use session::{Deck, SessionEvent, TrackSession};
pub use stem::{StemId, StemRecord};
pub use transport::{TransportState, TransportStore};
