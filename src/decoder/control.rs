// src/decoder/control.rs

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Commands the decoder thread can handle.
#[derive(Debug)]
pub enum DecoderCmd {
    /// Reposition to `target` seconds. `generation` identifies the request so
    /// that a newer seek supersedes one still in flight.
    Seek { target: f64, generation: u64 },
    Stop,
}

/// State shared by a stream engine handle, its decoder thread and its
/// output callback. Floats are stored as bits.
#[derive(Debug)]
pub struct StreamShared {
    pub playing: AtomicBool,
    pub muted: AtomicBool,
    volume: AtomicU32,
    rate: AtomicU32,
    /// Seconds of source consumed by the output callback.
    position: AtomicU64,

    /// Last requested seek.
    pub seek_gen: AtomicU64,
    seek_target: AtomicU64,
    /// Last seek the decoder has completed; the callback plays silence until
    /// it catches up with `seek_gen`.
    pub ready_gen: AtomicU64,

    /// Decoder reached the end of the source and is idle.
    pub exhausted: AtomicBool,
    /// Output drained everything the decoder produced.
    pub finished: AtomicBool,
    pub shutdown: AtomicBool,
}

impl Default for StreamShared {
    fn default() -> Self {
        Self {
            playing: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
            rate: AtomicU32::new(1.0f32.to_bits()),
            position: AtomicU64::new(0.0f64.to_bits()),
            seek_gen: AtomicU64::new(0),
            seek_target: AtomicU64::new(0.0f64.to_bits()),
            ready_gen: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl StreamShared {
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, v: f32) {
        self.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn rate(&self) -> f32 {
        f32::from_bits(self.rate.load(Ordering::Relaxed))
    }

    pub fn set_rate(&self, r: f32) {
        self.rate.store(r.to_bits(), Ordering::Relaxed);
    }

    pub fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Relaxed))
    }

    pub fn set_position(&self, t: f64) {
        self.position.store(t.to_bits(), Ordering::Relaxed);
    }

    pub fn seek_target(&self) -> f64 {
        f64::from_bits(self.seek_target.load(Ordering::Acquire))
    }

    /// Register a new seek and return its generation.
    pub fn begin_seek(&self, target: f64) -> u64 {
        self.seek_target.store(target.to_bits(), Ordering::Release);
        self.finished.store(false, Ordering::Relaxed);
        self.seek_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn seek_pending(&self) -> bool {
        self.ready_gen.load(Ordering::Acquire) != self.seek_gen.load(Ordering::Acquire)
    }

    /// The decoder should drop what it is doing: shutdown or a newer seek.
    pub fn superseded(&self, generation: u64) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.seek_gen.load(Ordering::Acquire) != generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_generations_supersede() {
        let shared = StreamShared::default();
        assert!(!shared.seek_pending());

        let first = shared.begin_seek(4.0);
        assert!(shared.seek_pending());
        let second = shared.begin_seek(8.0);
        assert!(shared.superseded(first));
        assert!(!shared.superseded(second));
        assert_eq!(shared.seek_target(), 8.0);

        shared.ready_gen.store(second, Ordering::Release);
        assert!(!shared.seek_pending());
    }
}
