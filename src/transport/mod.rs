// src/transport/mod.rs

//! The transport store: single source of truth for the shared playhead,
//! play state, loop state, speed and per-stem mute/volume/solo.
//!
//! Every transition is a total function over `TransportState`: invalid input
//! is clamped or ignored, never stored. The store does no I/O; the
//! synchronizer observes its state and drives the engines.

use std::collections::{BTreeMap, BTreeSet};

use crate::stem::StemId;

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

/// Values offered by the speed selector.
pub const SPEED_PRESETS: [f32; 6] = [0.5, 0.75, 1.0, 1.25, 1.5, 2.0];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopRegion {
    pub start: f64,
    pub end: f64,
}

impl LoopRegion {
    pub fn clamp(&self, t: f64) -> f64 {
        t.clamp(self.start, self.end)
    }

    pub fn len(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportState {
    pub is_playing: bool,
    /// Authoritative shared playhead, seconds.
    pub current_time: f64,
    /// Longest reported stem duration, seconds.
    pub duration: f64,
    pub muted_stems: BTreeSet<StemId>,
    pub stem_volumes: BTreeMap<StemId, f32>,
    pub solo_stem: Option<StemId>,
    /// Mutes captured when solo was engaged; restored when it is cleared.
    pub previous_muted_stems: BTreeSet<StemId>,
    pub playback_speed: f32,
    pub is_looping: bool,
    pub loop_region: Option<LoopRegion>,
    /// Bumped on every discontinuous playhead jump (explicit seek, loop wrap).
    pub seek_epoch: u64,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            muted_stems: BTreeSet::new(),
            stem_volumes: BTreeMap::new(),
            solo_stem: None,
            previous_muted_stems: BTreeSet::new(),
            playback_speed: 1.0,
            is_looping: false,
            loop_region: None,
            seek_epoch: 0,
        }
    }
}

impl TransportState {
    pub fn volume_of(&self, stem: &StemId) -> f32 {
        self.stem_volumes.get(stem).copied().unwrap_or(1.0)
    }

    pub fn is_muted(&self, stem: &StemId) -> bool {
        self.muted_stems.contains(stem)
    }
}

/// Outcome of an `advance_time` call from the UI clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    Moved,
    /// Loop end reached; playhead jumped back to the loop start.
    Wrapped,
    /// Track end reached; playback stopped and the playhead rewound to 0.
    Ended,
}

/// Anything the annotation layer or a timeline click can reposition.
pub trait SeekTarget {
    fn seek(&mut self, t: f64);
}

#[derive(Debug, Default)]
pub struct TransportStore {
    state: TransportState,
    known_stems: BTreeSet<StemId>,
}

impl TransportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    pub fn known_stems(&self) -> &BTreeSet<StemId> {
        &self.known_stems
    }

    /// Declare the stems of the open track. Solo mutes every known stem but one.
    pub fn register_stems<I>(&mut self, stems: I)
    where
        I: IntoIterator<Item = StemId>,
    {
        for stem in stems {
            if let Some(solo) = &self.state.solo_stem {
                if *solo != stem {
                    self.state.muted_stems.insert(stem.clone());
                }
            }
            self.known_stems.insert(stem);
        }
    }

    // --- PLAYBACK ---

    pub fn play(&mut self) {
        self.state.is_playing = true;
    }

    pub fn pause(&mut self) {
        self.state.is_playing = false;
    }

    pub fn toggle_play(&mut self) {
        self.state.is_playing = !self.state.is_playing;
    }

    /// Explicit seek: clamp into `[0, duration]`, then into the loop region if one is set.
    pub fn seek(&mut self, t: f64) {
        let t = if t.is_finite() { t } else { 0.0 };
        let mut t = t.clamp(0.0, self.state.duration);
        if let Some(region) = &self.state.loop_region {
            t = region.clamp(t);
        }
        self.state.current_time = t;
        self.state.seek_epoch = self.state.seek_epoch.wrapping_add(1);
    }

    /// Relative seek (skip back / forward), clamped like `seek`.
    pub fn skip(&mut self, delta: f64) {
        self.seek(self.state.current_time + delta);
    }

    /// The shared timeline is as long as the longest stem; it only ever grows.
    pub fn set_duration(&mut self, d: f64) {
        if d.is_finite() && d > self.state.duration {
            self.state.duration = d;
        }
    }

    /// Called by the UI clock with the reference engine's position.
    pub fn advance_time(&mut self, t: f64) -> Advance {
        let t = if t.is_finite() { t.max(0.0) } else { 0.0 };

        if self.state.is_looping {
            let region = match self.state.loop_region {
                Some(region) => Some(region),
                None if self.state.duration > 0.0 => Some(LoopRegion {
                    start: 0.0,
                    end: self.state.duration,
                }),
                None => None,
            };
            if let Some(region) = region {
                if t >= region.end {
                    self.state.current_time = region.start;
                    self.state.seek_epoch = self.state.seek_epoch.wrapping_add(1);
                    return Advance::Wrapped;
                }
                self.state.current_time = t.min(self.state.duration);
                return Advance::Moved;
            }
        }

        if t >= self.state.duration {
            self.state.is_playing = false;
            self.state.current_time = 0.0;
            return Advance::Ended;
        }

        self.state.current_time = t;
        Advance::Moved
    }

    // --- STEM CONTROLS ---

    /// Rejected while a stem is soloed. Returns whether the toggle was applied.
    pub fn toggle_mute(&mut self, stem: &StemId) -> bool {
        if self.state.solo_stem.is_some() {
            return false;
        }
        if !self.state.muted_stems.remove(stem) {
            self.state.muted_stems.insert(stem.clone());
        }
        true
    }

    pub fn set_volume(&mut self, stem: &StemId, volume: f32) {
        if volume.is_nan() {
            return;
        }
        self.state
            .stem_volumes
            .insert(stem.clone(), volume.clamp(0.0, 1.0));
    }

    /// `Some(id)` solos a known stem, `None` clears solo and restores the
    /// pre-solo mutes. Switching solo target keeps the original snapshot.
    /// Returns whether the state changed.
    pub fn set_solo(&mut self, stem: Option<&StemId>) -> bool {
        match stem {
            None => {
                if self.state.solo_stem.take().is_none() {
                    return false;
                }
                self.state.muted_stems = std::mem::take(&mut self.state.previous_muted_stems);
                true
            }
            Some(id) => {
                if !self.known_stems.contains(id) {
                    return false;
                }
                if self.state.solo_stem.is_none() {
                    self.state.previous_muted_stems = self.state.muted_stems.clone();
                }
                self.state.muted_stems = self
                    .known_stems
                    .iter()
                    .filter(|s| *s != id)
                    .cloned()
                    .collect();
                self.state.solo_stem = Some(id.clone());
                true
            }
        }
    }

    /// Mute every known stem. Rejected while soloed, like `toggle_mute`.
    pub fn mute_all(&mut self) -> bool {
        if self.state.solo_stem.is_some() {
            return false;
        }
        self.state.muted_stems = self.known_stems.clone();
        true
    }

    /// Clear every mute and any solo.
    pub fn unmute_all(&mut self) {
        self.state.muted_stems.clear();
        self.state.previous_muted_stems.clear();
        self.state.solo_stem = None;
    }

    // --- SPEED / LOOP ---

    pub fn set_playback_speed(&mut self, speed: f32) {
        if speed.is_nan() {
            return;
        }
        self.state.playback_speed = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    /// Step to the next faster (`up`) or slower preset.
    pub fn step_speed(&mut self, up: bool) {
        let current = self.state.playback_speed;
        let next = if up {
            SPEED_PRESETS.iter().copied().find(|s| *s > current + f32::EPSILON)
        } else {
            SPEED_PRESETS
                .iter()
                .rev()
                .copied()
                .find(|s| *s < current - f32::EPSILON)
        };
        if let Some(speed) = next {
            self.set_playback_speed(speed);
        }
    }

    pub fn toggle_loop(&mut self) {
        self.state.is_looping = !self.state.is_looping;
    }

    /// `None` clears the region (looping then covers the whole track).
    /// A region must satisfy `0 <= start < end <= duration` once clamped.
    pub fn set_loop_region(&mut self, region: Option<(f64, f64)>) -> bool {
        let Some((start, end)) = region else {
            self.state.loop_region = None;
            return true;
        };
        if !start.is_finite() || !end.is_finite() {
            return false;
        }
        let start = start.max(0.0);
        let end = end.min(self.state.duration);
        if start >= end {
            return false;
        }
        self.state.loop_region = Some(LoopRegion { start, end });
        true
    }

    /// Back to defaults; called when the track view is torn down.
    pub fn reset(&mut self) {
        self.state = TransportState::default();
        self.known_stems.clear();
    }
}

impl SeekTarget for TransportStore {
    fn seek(&mut self, t: f64) {
        TransportStore::seek(self, t);
    }
}
