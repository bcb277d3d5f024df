// src/engine/mod.rs

//! One playback engine per stem, and the arena that owns them.

pub mod stream;
pub mod virtual_engine;

pub use stream::{StreamEngine, StreamEngineFactory};
pub use virtual_engine::{EngineCommand, VirtualEngine, VirtualEngineFactory, VirtualProbe};

use crate::error::EngineError;
use crate::stem::{StemId, StemRecord};

/// Decode and output pipeline for a single stem.
///
/// Commands apply immediately and are idempotent. Positions are best-effort:
/// they may lag the transport by the engine's own buffering latency.
pub trait StemEngine: Send {
    fn play(&mut self) -> Result<(), EngineError>;
    fn pause(&mut self) -> Result<(), EngineError>;
    /// Valid while playing and while paused.
    fn seek(&mut self, t: f64) -> Result<(), EngineError>;

    fn position_seconds(&self) -> f64;
    /// Playing and not yet at the end of its source.
    fn is_playing(&self) -> bool;
    fn duration(&self) -> f64;

    fn set_volume(&mut self, volume: f32);
    fn set_muted(&mut self, muted: bool);
    fn set_rate(&mut self, rate: f32);

    /// Release decoder and device resources. Safe to call more than once.
    fn unload(&mut self);
}

/// Creates engines. `load` blocks (file probing, device setup) and is run
/// off the async runtime, one call per stem.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: StemEngine + 'static;

    fn load(&self, stem: &StemRecord) -> Result<Self::Engine, EngineError>;
}

/// Live engines keyed by stem id, kept in load order.
pub struct EngineArena<E> {
    slots: Vec<(StemId, E)>,
}

impl<E> Default for EngineArena<E> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<E: StemEngine> EngineArena<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an engine. A previous engine for the same stem is unloaded first.
    pub fn insert(&mut self, id: StemId, engine: E) {
        if let Some(mut old) = self.remove(&id) {
            old.unload();
        }
        self.slots.push((id, engine));
    }

    pub fn remove(&mut self, id: &StemId) -> Option<E> {
        let idx = self.slots.iter().position(|(s, _)| s == id)?;
        Some(self.slots.remove(idx).1)
    }

    pub fn get(&self, id: &StemId) -> Option<&E> {
        self.slots.iter().find(|(s, _)| s == id).map(|(_, e)| e)
    }

    pub fn get_mut(&mut self, id: &StemId) -> Option<&mut E> {
        self.slots.iter_mut().find(|(s, _)| s == id).map(|(_, e)| e)
    }

    pub fn contains(&self, id: &StemId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StemId, &E)> {
        self.slots.iter().map(|(s, e)| (s, e))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StemId, &mut E)> {
        self.slots.iter_mut().map(|(s, e)| (&*s, e))
    }

    /// First engine in load order that is still playing.
    pub fn reference(&self) -> Option<(&StemId, &E)> {
        self.iter().find(|(_, e)| e.is_playing())
    }

    /// Unloads and drops every engine, in load order.
    pub fn unload_all(&mut self) {
        for (_, mut engine) in self.slots.drain(..) {
            engine.unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(duration: f64) -> (VirtualEngine, VirtualProbe) {
        let engine = VirtualEngine::new(duration);
        let probe = engine.probe();
        (engine, probe)
    }

    #[test]
    fn keeps_load_order_and_replaces_duplicates() {
        let mut arena = EngineArena::new();
        let (a, a_probe) = engine(10.0);
        let (b, _) = engine(10.0);
        let (a2, _) = engine(20.0);
        arena.insert(StemId::new("a"), a);
        arena.insert(StemId::new("b"), b);
        arena.insert(StemId::new("a"), a2);

        let order: Vec<&str> = arena.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert!(a_probe.is_unloaded());
        assert_eq!(arena.get(&StemId::new("a")).map(|e| e.duration()), Some(20.0));
    }

    #[test]
    fn reference_is_first_playing_engine() {
        let mut arena = EngineArena::new();
        let (a, _) = engine(10.0);
        let (mut b, _) = engine(10.0);
        b.play().unwrap();
        arena.insert(StemId::new("a"), a);
        arena.insert(StemId::new("b"), b);
        assert_eq!(arena.reference().map(|(id, _)| id.as_str()), Some("b"));

        arena.get_mut(&StemId::new("a")).unwrap().play().unwrap();
        assert_eq!(arena.reference().map(|(id, _)| id.as_str()), Some("a"));
    }

    #[test]
    fn unload_all_empties_arena() {
        let mut arena = EngineArena::new();
        let (a, pa) = engine(10.0);
        let (b, pb) = engine(10.0);
        arena.insert(StemId::new("a"), a);
        arena.insert(StemId::new("b"), b);
        arena.unload_all();
        assert!(arena.is_empty());
        assert!(pa.is_unloaded() && pb.is_unloaded());
    }
}
