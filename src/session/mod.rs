// src/session/mod.rs

//! One open track: the transport store, its engines and the two periodic
//! tasks that keep them moving.
//!
//! `Deck` is the synchronous core and can be driven directly (tests,
//! headless tools). `TrackSession` wraps it for the async runtime: one
//! load task per stem, the UI clock, the drift corrector, and teardown in
//! a fixed order.

pub mod tasks;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub use tasks::PeriodicTask;

use crate::config::PlayerConfig;
use crate::engine::{EngineArena, EngineFactory, StemEngine};
use crate::error::EngineError;
use crate::stem::{StemId, StemRecord, sort_stems};
use crate::sync::{DriftPlan, Synchronizer};
use crate::transport::{Advance, SeekTarget, TransportState, TransportStore};

#[derive(Clone, Debug, PartialEq)]
pub enum StemStatus {
    Loading,
    Ready { duration: f64 },
    Failed(String),
}

/// Notifications for the UI. Load results are per stem, never global.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StemReady { stem: StemId, duration: f64 },
    StemFailed { stem: StemId, reason: String },
    EndOfTrack,
    LoopWrapped { to: f64 },
}

pub struct Deck<E> {
    store: TransportStore,
    sync: Synchronizer<E>,
    stems: Vec<StemRecord>,
    status: BTreeMap<StemId, StemStatus>,
}

impl<E: StemEngine> Deck<E> {
    pub fn new(mut stems: Vec<StemRecord>, config: &PlayerConfig) -> Self {
        sort_stems(&mut stems);
        let mut store = TransportStore::new();
        store.register_stems(stems.iter().map(|s| s.id.clone()));
        let mut sync = Synchronizer::new(config.drift_tolerance_secs);
        sync.apply(store.state());
        let status = stems
            .iter()
            .map(|s| (s.id.clone(), StemStatus::Loading))
            .collect();
        Self {
            store,
            sync,
            stems,
            status,
        }
    }

    pub fn state(&self) -> &TransportState {
        self.store.state()
    }

    /// Stems in display order.
    pub fn stems(&self) -> &[StemRecord] {
        &self.stems
    }

    pub fn status(&self, stem: &StemId) -> Option<&StemStatus> {
        self.status.get(stem)
    }

    pub fn engines(&self) -> &EngineArena<E> {
        self.sync.engines()
    }

    /// Run one store transition and let the synchronizer react to it.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut TransportStore) -> R) -> R {
        let out = f(&mut self.store);
        self.sync.apply(self.store.state());
        out
    }

    /// Every stem has settled and none of them loaded.
    pub fn nothing_playable(&self) -> bool {
        self.sync.engines().is_empty()
            && !self.status.values().any(|s| *s == StemStatus::Loading)
    }

    pub fn play(&mut self) {
        if self.nothing_playable() {
            warn!("play ignored: no stem of this track loaded");
            return;
        }
        self.update(TransportStore::play);
    }

    pub fn pause(&mut self) {
        self.update(TransportStore::pause);
    }

    pub fn toggle_play(&mut self) {
        if self.state().is_playing {
            self.pause();
        } else {
            self.play();
        }
    }

    pub fn seek(&mut self, t: f64) {
        self.update(|s| s.seek(t));
    }

    pub fn skip(&mut self, delta: f64) {
        self.update(|s| s.skip(delta));
    }

    pub fn toggle_mute(&mut self, stem: &StemId) -> bool {
        let applied = self.update(|s| s.toggle_mute(stem));
        if !applied {
            debug!("mute toggle on {stem} ignored while soloed");
        }
        applied
    }

    pub fn set_volume(&mut self, stem: &StemId, volume: f32) {
        self.update(|s| s.set_volume(stem, volume));
    }

    pub fn set_solo(&mut self, stem: Option<&StemId>) -> bool {
        let changed = self.update(|s| s.set_solo(stem));
        if changed {
            debug!("solo is now {:?}", self.state().solo_stem);
        }
        changed
    }

    /// Solo `stem`, or clear solo if it is already the soloed one.
    pub fn toggle_solo(&mut self, stem: &StemId) -> bool {
        if self.state().solo_stem.as_ref() == Some(stem) {
            self.set_solo(None)
        } else {
            self.set_solo(Some(stem))
        }
    }

    pub fn mute_all(&mut self) -> bool {
        self.update(TransportStore::mute_all)
    }

    pub fn unmute_all(&mut self) {
        self.update(TransportStore::unmute_all);
    }

    pub fn set_playback_speed(&mut self, speed: f32) {
        self.update(|s| s.set_playback_speed(speed));
    }

    pub fn step_speed(&mut self, up: bool) {
        self.update(|s| s.step_speed(up));
    }

    pub fn toggle_loop(&mut self) {
        self.update(TransportStore::toggle_loop);
    }

    pub fn set_loop_region(&mut self, region: Option<(f64, f64)>) -> bool {
        self.update(|s| s.set_loop_region(region))
    }

    /// A stem's load finished. Success adds its engine to the session and
    /// grows the timeline; failure only marks that stem.
    pub fn stem_loaded(&mut self, stem: StemId, result: Result<E, EngineError>) -> SessionEvent {
        let Some(status) = self.status.get_mut(&stem) else {
            if let Ok(mut engine) = result {
                engine.unload();
            }
            warn!("dropping engine for unknown stem {stem}");
            return SessionEvent::StemFailed {
                stem,
                reason: "stem is not part of this track".into(),
            };
        };

        match result {
            Ok(engine) => {
                let duration = engine.duration();
                *status = StemStatus::Ready { duration };
                if let Some(record) = self.stems.iter_mut().find(|s| s.id == stem) {
                    record.duration = Some(duration);
                }
                self.store.set_duration(duration);
                self.sync.attach(stem.clone(), engine, self.store.state());
                self.sync.apply(self.store.state());
                info!("stem {stem} ready ({duration:.2}s)");
                SessionEvent::StemReady { stem, duration }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("stem {stem} failed to load: {reason}");
                *status = StemStatus::Failed(reason.clone());
                if self.state().is_playing && self.nothing_playable() {
                    warn!("no stem of this track loaded, pausing transport");
                    self.pause();
                }
                SessionEvent::StemFailed { stem, reason }
            }
        }
    }

    /// One UI clock frame: read the reference engine and advance the transport.
    pub fn tick_clock(&mut self) -> Option<SessionEvent> {
        if !self.state().is_playing {
            return None;
        }
        let position = self.sync.clock_position()?;
        let advance = self.store.advance_time(position);
        self.sync.apply(self.store.state());
        match advance {
            Advance::Moved => None,
            Advance::Wrapped => {
                let to = self.state().current_time;
                debug!("loop wrapped to {to:.3}s");
                Some(SessionEvent::LoopWrapped { to })
            }
            Advance::Ended => {
                info!("end of track");
                Some(SessionEvent::EndOfTrack)
            }
        }
    }

    pub fn correct_drift(&mut self) -> Option<DriftPlan> {
        self.sync.correct_drift(self.store.state())
    }

    /// Unload every engine, then reset the transport.
    pub fn teardown(&mut self) {
        self.sync.teardown();
        self.store.reset();
        self.status.clear();
    }
}

impl<E: StemEngine> SeekTarget for Deck<E> {
    fn seek(&mut self, t: f64) {
        Deck::seek(self, t);
    }
}

fn lock<E>(deck: &Mutex<Deck<E>>) -> MutexGuard<'_, Deck<E>> {
    deck.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TrackSession<E> {
    deck: Arc<Mutex<Deck<E>>>,
    loads: JoinSet<()>,
    clock: Option<PeriodicTask>,
    drift: Option<PeriodicTask>,
}

impl<E: StemEngine + 'static> TrackSession<E> {
    /// Open a track: start one independent load per stem plus the UI clock
    /// and drift tasks. Must be called from within a tokio runtime.
    pub fn open<F>(
        stems: Vec<StemRecord>,
        factory: Arc<F>,
        config: &PlayerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>)
    where
        F: EngineFactory<Engine = E>,
    {
        let deck = Arc::new(Mutex::new(Deck::new(stems, config)));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut loads = JoinSet::new();
        let ordered = lock(&deck).stems().to_vec();
        for stem in ordered {
            let factory = factory.clone();
            let deck = deck.clone();
            let tx = tx.clone();
            loads.spawn(async move {
                let id = stem.id.clone();
                debug!("loading stem {id} from {}", stem.audio_source);
                let result = match tokio::task::spawn_blocking(move || factory.load(&stem)).await {
                    Ok(result) => result,
                    Err(e) => Err(EngineError::Open {
                        location: id.to_string(),
                        reason: format!("load task failed: {e}"),
                    }),
                };
                let event = lock(&deck).stem_loaded(id, result);
                let _ = tx.send(event);
            });
        }

        let clock = {
            let deck = deck.clone();
            let tx = tx.clone();
            PeriodicTask::spawn("ui clock", config.clock_interval(), move || {
                let Ok(mut deck) = deck.lock() else {
                    return;
                };
                if let Some(event) = deck.tick_clock() {
                    let _ = tx.send(event);
                }
            })
        };

        let drift = {
            let deck = deck.clone();
            PeriodicTask::spawn("drift corrector", config.drift_interval(), move || {
                if let Ok(mut deck) = deck.lock() {
                    deck.correct_drift();
                }
            })
        };

        let session = Self {
            deck,
            loads,
            clock: Some(clock),
            drift: Some(drift),
        };
        (session, rx)
    }

    pub fn with_deck<R>(&self, f: impl FnOnce(&mut Deck<E>) -> R) -> R {
        f(&mut lock(&self.deck))
    }

    pub fn state(&self) -> TransportState {
        lock(&self.deck).state().clone()
    }

    /// Cancel the UI clock, then the drift task, abort pending loads,
    /// unload every engine and reset the transport, in that order.
    pub async fn close(mut self) {
        if let Some(clock) = self.clock.take() {
            clock.cancel().await;
        }
        if let Some(drift) = self.drift.take() {
            drift.cancel().await;
        }
        self.loads.abort_all();
        while self.loads.join_next().await.is_some() {}
        lock(&self.deck).teardown();
        info!("track session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{VirtualEngine, VirtualEngineFactory};

    fn stems() -> Vec<StemRecord> {
        vec![
            StemRecord::new("bass", "Bass", "bass.wav").with_duration(25.0).with_sort_order(1),
            StemRecord::new("drums", "Drums", "drums.wav").with_duration(30.0).with_sort_order(0),
        ]
    }

    fn loaded_deck() -> Deck<VirtualEngine> {
        let factory = VirtualEngineFactory::new();
        let mut deck = Deck::new(stems(), &PlayerConfig::default());
        for stem in deck.stems().to_vec() {
            let engine = factory.load(&stem);
            deck.stem_loaded(stem.id.clone(), engine);
        }
        deck
    }

    #[test]
    fn stems_are_kept_in_sort_order() {
        let deck: Deck<VirtualEngine> = Deck::new(stems(), &PlayerConfig::default());
        let ids: Vec<&str> = deck.stems().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["drums", "bass"]);
        assert_eq!(deck.status(&StemId::new("bass")), Some(&StemStatus::Loading));
    }

    #[test]
    fn duration_is_longest_loaded_stem() {
        let deck = loaded_deck();
        assert_eq!(deck.state().duration, 30.0);
        assert_eq!(
            deck.status(&StemId::new("bass")),
            Some(&StemStatus::Ready { duration: 25.0 })
        );
    }

    #[test]
    fn failed_stem_is_excluded() {
        let factory = VirtualEngineFactory::new().fail_stem("bass");
        let mut deck = Deck::new(stems(), &PlayerConfig::default());
        for stem in deck.stems().to_vec() {
            let engine = factory.load(&stem);
            deck.stem_loaded(stem.id.clone(), engine);
        }
        assert!(matches!(
            deck.status(&StemId::new("bass")),
            Some(StemStatus::Failed(_))
        ));
        assert_eq!(deck.engines().len(), 1);

        deck.play();
        assert!(deck.state().is_playing);
        assert!(deck.engines().iter().all(|(_, e)| e.is_playing()));
    }

    #[test]
    fn playback_stops_once_every_stem_failed() {
        let factory = VirtualEngineFactory::new().fail_stem("bass").fail_stem("drums");
        let mut deck: Deck<VirtualEngine> = Deck::new(stems(), &PlayerConfig::default());
        deck.play();
        assert!(deck.state().is_playing);

        for stem in deck.stems().to_vec() {
            let engine = factory.load(&stem);
            deck.stem_loaded(stem.id.clone(), engine);
        }
        assert!(deck.nothing_playable());
        assert!(!deck.state().is_playing);

        deck.play();
        deck.toggle_play();
        assert!(!deck.state().is_playing);
        assert_eq!(deck.tick_clock(), None);
    }

    #[test]
    fn engine_arriving_after_teardown_is_unloaded() {
        let factory = VirtualEngineFactory::new();
        let mut deck = loaded_deck();
        deck.play();
        deck.teardown();

        let late = StemRecord::new("bass", "Bass", "bass.wav").with_duration(25.0);
        let engine = factory.load(&late);
        let probe = factory.probe(&late.id).unwrap();
        let event = deck.stem_loaded(late.id.clone(), engine);

        assert!(matches!(event, SessionEvent::StemFailed { .. }));
        assert!(probe.is_unloaded());
        assert!(deck.engines().is_empty());
        assert_eq!(*deck.state(), TransportState::default());
    }

    #[test]
    fn toggle_solo_switches_and_clears() {
        let mut deck = loaded_deck();
        let bass = StemId::new("bass");
        assert!(deck.toggle_solo(&bass));
        assert_eq!(deck.state().solo_stem, Some(bass.clone()));
        assert!(!deck.toggle_mute(&StemId::new("drums")));
        assert!(deck.toggle_solo(&bass));
        assert!(deck.state().solo_stem.is_none());
        assert!(deck.state().muted_stems.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_reaches_end_of_track() {
        let mut deck = loaded_deck();
        deck.play();
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert_eq!(deck.tick_clock(), None);
        assert!((deck.state().current_time - 10.0).abs() < 1e-9);

        tokio::time::advance(std::time::Duration::from_secs(25)).await;
        assert_eq!(deck.tick_clock(), Some(SessionEvent::EndOfTrack));
        assert!(!deck.state().is_playing);
        assert_eq!(deck.state().current_time, 0.0);
        assert!(deck.engines().iter().all(|(_, e)| !e.is_playing()));
    }

    #[tokio::test(start_paused = true)]
    async fn clock_wraps_loop_and_repositions_engines() {
        let mut deck = loaded_deck();
        assert!(deck.set_loop_region(Some((4.0, 6.0))));
        deck.toggle_loop();
        deck.seek(4.0);
        deck.play();

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert_eq!(deck.tick_clock(), Some(SessionEvent::LoopWrapped { to: 4.0 }));
        assert!(deck.state().is_playing);
        for (_, engine) in deck.engines().iter() {
            assert!((engine.position_seconds() - 4.0).abs() < 1e-9);
        }
    }

    #[test]
    fn teardown_resets_everything() {
        let mut deck = loaded_deck();
        deck.play();
        deck.teardown();
        assert!(deck.engines().is_empty());
        assert_eq!(*deck.state(), TransportState::default());
    }
}
