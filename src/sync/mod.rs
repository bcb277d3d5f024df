// src/sync/mod.rs

//! Drives the engine set from transport state.
//!
//! The synchronizer keeps the last state it acted on and, on every pass,
//! reacts to what changed since. Engines are commanded one after another;
//! a command that fails is logged and left for the next drift pass.

pub mod drift;

use std::fmt::Display;

use log::{debug, warn};

pub use drift::{DriftPlan, plan_corrections};

use crate::engine::{EngineArena, StemEngine};
use crate::error::EngineError;
use crate::stem::StemId;
use crate::transport::TransportState;

pub struct Synchronizer<E> {
    engines: EngineArena<E>,
    observed: Option<TransportState>,
    drift_tolerance: f64,
}

fn report(stem: &StemId, op: impl Display, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!("stem {stem}: {op} failed: {e}");
    }
}

/// Bring one engine fully in line with `state`.
fn align<E: StemEngine>(stem: &StemId, engine: &mut E, state: &TransportState) {
    engine.set_volume(state.volume_of(stem));
    engine.set_muted(state.is_muted(stem));
    engine.set_rate(state.playback_speed);
    report(stem, "seek", engine.seek(state.current_time));
    if state.is_playing {
        if !engine.is_playing() {
            report(stem, "play", engine.play());
        }
    } else {
        report(stem, "pause", engine.pause());
    }
}

impl<E: StemEngine> Synchronizer<E> {
    pub fn new(drift_tolerance: f64) -> Self {
        Self {
            engines: EngineArena::new(),
            observed: None,
            drift_tolerance,
        }
    }

    pub fn engines(&self) -> &EngineArena<E> {
        &self.engines
    }

    /// Adopt a freshly loaded engine and align it with the transport at once.
    pub fn attach(&mut self, stem: StemId, mut engine: E, state: &TransportState) {
        align(&stem, &mut engine, state);
        self.engines.insert(stem, engine);
    }

    /// React to a transport change.
    pub fn apply(&mut self, state: &TransportState) {
        let Some(prev) = self.observed.replace(state.clone()) else {
            for (stem, engine) in self.engines.iter_mut() {
                align(stem, engine, state);
            }
            return;
        };

        if state.muted_stems != prev.muted_stems {
            for (stem, engine) in self.engines.iter_mut() {
                engine.set_muted(state.is_muted(stem));
            }
        }
        if state.stem_volumes != prev.stem_volumes {
            for (stem, engine) in self.engines.iter_mut() {
                engine.set_volume(state.volume_of(stem));
            }
        }
        if state.playback_speed != prev.playback_speed {
            for (_, engine) in self.engines.iter_mut() {
                engine.set_rate(state.playback_speed);
            }
        }

        let jumped = state.seek_epoch != prev.seek_epoch;
        match (prev.is_playing, state.is_playing) {
            (false, true) => {
                // Re-align everything at the moment playback starts.
                for (stem, engine) in self.engines.iter_mut() {
                    report(stem, "seek", engine.seek(state.current_time));
                    if !engine.is_playing() {
                        report(stem, "play", engine.play());
                    }
                }
            }
            (true, false) => {
                for (stem, engine) in self.engines.iter_mut() {
                    report(stem, "pause", engine.pause());
                }
                if state.current_time != prev.current_time || jumped {
                    self.seek_all(state.current_time);
                }
            }
            (true, true) => {
                if jumped {
                    self.seek_all(state.current_time);
                }
            }
            (false, false) => {
                if state.current_time != prev.current_time || jumped {
                    self.seek_all(state.current_time);
                }
            }
        }
    }

    fn seek_all(&mut self, t: f64) {
        for (stem, engine) in self.engines.iter_mut() {
            report(stem, "seek", engine.seek(t));
        }
    }

    /// Position for the UI clock.
    ///
    /// Reads the reference engine (first loaded that is still playing).
    /// When every engine has stopped, reports the furthest position so a
    /// track whose stems all ended reaches the end of the timeline.
    pub fn clock_position(&self) -> Option<f64> {
        if let Some((_, engine)) = self.engines.reference() {
            return Some(engine.position_seconds());
        }
        self.engines
            .iter()
            .map(|(_, e)| e.position_seconds())
            .reduce(f64::max)
    }

    /// One drift pass. Only playing engines are sampled; the reference
    /// engine counts toward the mean like any other.
    pub fn correct_drift(&mut self, state: &TransportState) -> Option<DriftPlan> {
        if !state.is_playing {
            return None;
        }

        let samples: Vec<(StemId, f64)> = self
            .engines
            .iter()
            .filter(|(_, e)| e.is_playing())
            .map(|(id, e)| (id.clone(), e.position_seconds()))
            .collect();
        let plan = plan_corrections(&samples, self.drift_tolerance);

        if let Some(plan) = &plan {
            for stem in &plan.reseek {
                if let Some(engine) = self.engines.get_mut(stem) {
                    debug!(
                        "drift: {stem} at {:.3}s, mean {:.3}s",
                        engine.position_seconds(),
                        plan.mean
                    );
                    report(stem, "drift seek", engine.seek(plan.mean));
                }
            }
        }

        // Engines that should be playing but are not, after a rejected command.
        let target = plan.as_ref().map_or(state.current_time, |p| p.mean);
        for (stem, engine) in self.engines.iter_mut() {
            if engine.is_playing() || target >= engine.duration() {
                continue;
            }
            debug!("drift: restarting stalled engine {stem} at {target:.3}s");
            report(stem, "realign seek", engine.seek(target));
            report(stem, "realign play", engine.play());
        }

        plan
    }

    /// Unload every engine and forget the observed state.
    pub fn teardown(&mut self) {
        self.engines.unload_all();
        self.observed = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::{EngineCommand, VirtualEngine, VirtualProbe};
    use crate::transport::TransportStore;

    struct Rig {
        store: TransportStore,
        sync: Synchronizer<VirtualEngine>,
        probes: Vec<VirtualProbe>,
    }

    fn rig(durations: &[(&str, f64)]) -> Rig {
        let mut store = TransportStore::new();
        let mut sync = Synchronizer::new(0.05);
        store.register_stems(durations.iter().map(|(id, _)| StemId::new(*id)));
        sync.apply(store.state());
        let mut probes = Vec::new();
        for (id, d) in durations {
            let engine = VirtualEngine::new(*d);
            probes.push(engine.probe());
            store.set_duration(*d);
            sync.attach(StemId::new(*id), engine, store.state());
        }
        sync.apply(store.state());
        for p in &probes {
            p.clear_commands();
        }
        Rig { store, sync, probes }
    }

    impl Rig {
        fn mutate(&mut self, f: impl FnOnce(&mut TransportStore)) {
            f(&mut self.store);
            self.sync.apply(self.store.state());
        }
    }

    #[test]
    fn play_seeks_every_engine_then_plays() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.mutate(|s| s.seek(12.0));
        for p in &rig.probes {
            assert_eq!(p.commands(), vec![EngineCommand::Seek(12.0)]);
            p.clear_commands();
        }

        rig.mutate(|s| s.play());
        for p in &rig.probes {
            assert_eq!(p.commands(), vec![EngineCommand::Seek(12.0), EngineCommand::Play]);
        }
    }

    #[test]
    fn pause_does_not_seek() {
        let mut rig = rig(&[("a", 60.0)]);
        rig.mutate(|s| s.play());
        rig.probes[0].clear_commands();
        rig.mutate(|s| s.pause());
        assert_eq!(rig.probes[0].commands(), vec![EngineCommand::Pause]);
    }

    #[test]
    fn explicit_seek_while_playing_repositions() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.mutate(|s| s.play());
        rig.probes.iter().for_each(VirtualProbe::clear_commands);

        rig.mutate(|s| s.seek(30.0));
        for p in &rig.probes {
            assert_eq!(p.seeks(), vec![30.0]);
        }

        // Plain clock advances do not touch the engines.
        rig.probes.iter().for_each(VirtualProbe::clear_commands);
        rig.mutate(|s| {
            s.advance_time(30.5);
        });
        assert!(rig.probes[0].commands().is_empty());
    }

    #[test]
    fn mute_volume_and_rate_propagate() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.mutate(|s| {
            s.toggle_mute(&StemId::new("a"));
        });
        assert!(rig.probes[0].is_muted());
        assert!(!rig.probes[1].is_muted());

        rig.mutate(|s| s.set_volume(&StemId::new("b"), 0.25));
        assert_eq!(rig.probes[1].volume(), 0.25);

        rig.mutate(|s| s.set_playback_speed(1.5));
        assert!(rig.probes.iter().all(|p| p.rate() == 1.5));
    }

    #[test]
    fn attach_aligns_late_engine() {
        let mut rig = rig(&[("a", 60.0)]);
        rig.mutate(|s| {
            s.seek(20.0);
            s.set_volume(&StemId::new("late"), 0.5);
            s.play();
        });

        let late = VirtualEngine::new(90.0);
        let probe = late.probe();
        rig.sync.attach(StemId::new("late"), late, rig.store.state());
        assert_eq!(probe.seeks(), vec![20.0]);
        assert!(probe.is_playing());
        assert_eq!(probe.volume(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn drift_pass_pulls_outliers_to_mean() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0), ("c", 60.0)]);
        rig.mutate(|s| s.play());
        rig.probes[0].set_position(10.00);
        rig.probes[1].set_position(10.08);
        rig.probes[2].set_position(9.90);
        rig.probes.iter().for_each(VirtualProbe::clear_commands);

        let plan = rig.sync.correct_drift(rig.store.state()).unwrap();
        assert_eq!(plan.reseek, vec![StemId::new("b"), StemId::new("c")]);
        assert!(rig.probes[0].seeks().is_empty());
        for p in &rig.probes[1..] {
            let seeks = p.seeks();
            assert_eq!(seeks.len(), 1);
            assert!((seeks[0] - 9.99333).abs() < 1e-4);
        }
    }

    #[test]
    fn drift_is_idle_while_paused() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.probes[1].set_position(5.0);
        assert!(rig.sync.correct_drift(rig.store.state()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_reference_then_next_engine() {
        let mut rig = rig(&[("short", 2.0), ("long", 10.0)]);
        rig.mutate(|s| s.play());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((rig.sync.clock_position().unwrap() - 1.0).abs() < 1e-9);

        // Short stem ended: the long one becomes the reference.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((rig.sync.clock_position().unwrap() - 3.0).abs() < 1e-9);

        // Everything ended: clock reports the longest end.
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(rig.sync.clock_position(), Some(10.0));
    }

    #[test]
    fn failed_command_is_retried_by_drift_pass() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.probes[1].set_failing(true);
        rig.mutate(|s| s.play());
        assert!(!rig.probes[1].is_playing());

        rig.probes[1].set_failing(false);
        rig.sync.correct_drift(rig.store.state());
        assert!(rig.probes[1].is_playing());
    }

    #[test]
    fn teardown_unloads_everything() {
        let mut rig = rig(&[("a", 60.0), ("b", 60.0)]);
        rig.sync.teardown();
        assert!(rig.sync.engines().is_empty());
        assert!(rig.probes.iter().all(VirtualProbe::is_unloaded));
        assert_eq!(rig.sync.clock_position(), None);
    }
}
