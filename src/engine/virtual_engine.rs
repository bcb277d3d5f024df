// src/engine/virtual_engine.rs

//! A stem engine with no audio device: position is derived from the tokio
//! clock. Used for `--headless` runs and to drive the synchronizer in tests,
//! where paused tokio time makes positions deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use super::{EngineFactory, StemEngine};
use crate::error::EngineError;
use crate::stem::{StemId, StemRecord};

/// Every command an engine received, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCommand {
    Play,
    Pause,
    Seek(f64),
    Volume(f32),
    Muted(bool),
    Rate(f32),
    Unload,
}

#[derive(Debug)]
struct VirtualState {
    duration: f64,
    playing: bool,
    /// Position at `anchor`.
    base: f64,
    anchor: Instant,
    rate: f64,
    volume: f32,
    muted: bool,
    unloaded: bool,
    fail_commands: bool,
    log: Vec<EngineCommand>,
}

impl VirtualState {
    fn position(&self) -> f64 {
        let pos = if self.playing {
            self.base + self.anchor.elapsed().as_secs_f64() * self.rate
        } else {
            self.base
        };
        pos.clamp(0.0, self.duration)
    }

    /// Freeze the running position into `base` before changing rate or play state.
    fn rebase(&mut self) {
        self.base = self.position();
        self.anchor = Instant::now();
    }

    fn check(&self, what: &str) -> Result<(), EngineError> {
        if self.unloaded {
            return Err(EngineError::Unloaded);
        }
        if self.fail_commands {
            return Err(EngineError::Command(format!("{what} rejected by device")));
        }
        Ok(())
    }
}

pub struct VirtualEngine {
    shared: Arc<Mutex<VirtualState>>,
}

/// Test/diagnostic handle onto a `VirtualEngine` that stays usable after
/// the engine has moved into an arena.
#[derive(Clone)]
pub struct VirtualProbe {
    shared: Arc<Mutex<VirtualState>>,
}

fn lock(shared: &Mutex<VirtualState>) -> MutexGuard<'_, VirtualState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VirtualEngine {
    pub fn new(duration: f64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(VirtualState {
                duration: duration.max(0.0),
                playing: false,
                base: 0.0,
                anchor: Instant::now(),
                rate: 1.0,
                volume: 1.0,
                muted: false,
                unloaded: false,
                fail_commands: false,
                log: Vec::new(),
            })),
        }
    }

    pub fn probe(&self) -> VirtualProbe {
        VirtualProbe {
            shared: self.shared.clone(),
        }
    }
}

impl StemEngine for VirtualEngine {
    fn play(&mut self) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        st.check("play")?;
        st.log.push(EngineCommand::Play);
        if !st.playing {
            st.rebase();
            st.playing = true;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        st.check("pause")?;
        st.log.push(EngineCommand::Pause);
        if st.playing {
            st.rebase();
            st.playing = false;
        }
        Ok(())
    }

    fn seek(&mut self, t: f64) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        st.check("seek")?;
        st.log.push(EngineCommand::Seek(t));
        st.base = t.clamp(0.0, st.duration);
        st.anchor = Instant::now();
        Ok(())
    }

    fn position_seconds(&self) -> f64 {
        lock(&self.shared).position()
    }

    fn is_playing(&self) -> bool {
        let st = lock(&self.shared);
        st.playing && st.position() < st.duration
    }

    fn duration(&self) -> f64 {
        lock(&self.shared).duration
    }

    fn set_volume(&mut self, volume: f32) {
        let mut st = lock(&self.shared);
        st.volume = volume;
        st.log.push(EngineCommand::Volume(volume));
    }

    fn set_muted(&mut self, muted: bool) {
        let mut st = lock(&self.shared);
        st.muted = muted;
        st.log.push(EngineCommand::Muted(muted));
    }

    fn set_rate(&mut self, rate: f32) {
        let mut st = lock(&self.shared);
        st.rebase();
        st.rate = rate as f64;
        st.log.push(EngineCommand::Rate(rate));
    }

    fn unload(&mut self) {
        let mut st = lock(&self.shared);
        if !st.unloaded {
            st.rebase();
            st.playing = false;
            st.unloaded = true;
            st.log.push(EngineCommand::Unload);
        }
    }
}

impl Drop for VirtualEngine {
    fn drop(&mut self) {
        self.unload();
    }
}

impl VirtualProbe {
    pub fn commands(&self) -> Vec<EngineCommand> {
        lock(&self.shared).log.clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.shared).log.clear();
    }

    pub fn seeks(&self) -> Vec<f64> {
        lock(&self.shared)
            .log
            .iter()
            .filter_map(|c| match c {
                EngineCommand::Seek(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self) -> f64 {
        lock(&self.shared).position()
    }

    /// Move the engine without logging a command, as buffering jitter would.
    pub fn set_position(&self, t: f64) {
        let mut st = lock(&self.shared);
        st.base = t.clamp(0.0, st.duration);
        st.anchor = Instant::now();
    }

    pub fn nudge(&self, delta: f64) {
        let now = self.position();
        self.set_position(now + delta);
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.shared).fail_commands = failing;
    }

    pub fn volume(&self) -> f32 {
        lock(&self.shared).volume
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.shared).muted
    }

    pub fn rate(&self) -> f64 {
        lock(&self.shared).rate
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared).playing
    }

    pub fn is_unloaded(&self) -> bool {
        lock(&self.shared).unloaded
    }
}

/// Builds virtual engines from the stem record's ingested duration.
#[derive(Default)]
pub struct VirtualEngineFactory {
    failing: HashSet<StemId>,
    durations: HashMap<StemId, f64>,
    probes: Mutex<HashMap<StemId, VirtualProbe>>,
}

impl VirtualEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loading this stem fails as an unreachable source would.
    pub fn fail_stem(mut self, id: impl Into<String>) -> Self {
        self.failing.insert(StemId::new(id));
        self
    }

    /// Overrides the duration reported for a stem.
    pub fn with_duration(mut self, id: impl Into<String>, duration: f64) -> Self {
        self.durations.insert(StemId::new(id), duration);
        self
    }

    pub fn probe(&self, id: &StemId) -> Option<VirtualProbe> {
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl EngineFactory for VirtualEngineFactory {
    type Engine = VirtualEngine;

    fn load(&self, stem: &StemRecord) -> Result<VirtualEngine, EngineError> {
        if self.failing.contains(&stem.id) {
            return Err(EngineError::Open {
                location: stem.audio_source.clone(),
                reason: "source unreachable".into(),
            });
        }
        let duration = self
            .durations
            .get(&stem.id)
            .copied()
            .or(stem.duration)
            .ok_or_else(|| EngineError::Open {
                location: stem.audio_source.clone(),
                reason: "no duration to simulate".into(),
            })?;

        let engine = VirtualEngine::new(duration);
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stem.id.clone(), engine.probe());
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn position_follows_clock_and_rate() {
        let mut engine = VirtualEngine::new(60.0);
        engine.play().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((engine.position_seconds() - 2.0).abs() < 1e-9);

        engine.set_rate(2.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((engine.position_seconds() - 4.0).abs() < 1e-9);

        engine.pause().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((engine.position_seconds() - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_end_of_source() {
        let mut engine = VirtualEngine::new(3.0);
        engine.play().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(engine.position_seconds(), 3.0);
        assert!(!engine.is_playing());

        engine.seek(1.0).unwrap();
        assert!(engine.is_playing());
    }

    #[test]
    fn failing_engine_rejects_commands() {
        let mut engine = VirtualEngine::new(3.0);
        let probe = engine.probe();
        probe.set_failing(true);
        assert!(matches!(engine.seek(1.0), Err(EngineError::Command(_))));
        probe.set_failing(false);
        engine.unload();
        assert!(matches!(engine.play(), Err(EngineError::Unloaded)));
    }

    #[test]
    fn dropping_an_engine_unloads_it() {
        let engine = VirtualEngine::new(3.0);
        let probe = engine.probe();
        drop(engine);
        assert!(probe.is_unloaded());
        assert_eq!(probe.commands(), vec![EngineCommand::Unload]);
    }

    #[test]
    fn factory_fails_marked_stems() {
        let factory = VirtualEngineFactory::new().fail_stem("bad");
        let good = StemRecord::new("good", "Good", "good.wav").with_duration(5.0);
        let bad = StemRecord::new("bad", "Bad", "bad.wav").with_duration(5.0);
        assert!(factory.load(&good).is_ok());
        assert!(factory.load(&bad).is_err());
        assert!(factory.probe(&StemId::new("good")).is_some());
    }
}
