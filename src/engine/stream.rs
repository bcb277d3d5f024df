// src/engine/stream.rs

use std::sync::{
    Arc,
    atomic::Ordering,
    mpsc::{self, Sender},
};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use ringbuf::{HeapRb, traits::Split};

use super::{EngineFactory, StemEngine};
use crate::audio::open_output_stream;
use crate::config::PlayerConfig;
use crate::decoder::{self, DecoderCmd, StreamShared};
use crate::error::EngineError;
use crate::stem::StemRecord;

/// A stem played through its own decoder thread, ring buffer and output
/// stream on the default device.
///
/// The cpal stream is not `Send`, so it lives on a dedicated output thread
/// for the engine's whole life; the engine itself only holds atomics and
/// channel handles.
pub struct StreamEngine {
    location: String,
    shared: Arc<StreamShared>,
    duration: f64,
    cmd_tx: Option<Sender<DecoderCmd>>,
    output_stop: Option<Sender<()>>,
    decoder_thread: Option<JoinHandle<()>>,
    output_thread: Option<JoinHandle<()>>,
}

impl StreamEngine {
    pub fn open(source: &str, config: &PlayerConfig) -> Result<Self, EngineError> {
        let path = source.strip_prefix("file://").unwrap_or(source).to_string();
        let info = decoder::probe_source(&path)?;
        debug!(
            "{path}: {} Hz, {} ch, {:.3}s",
            info.sample_rate, info.channels, info.duration
        );

        let rb = HeapRb::<f32>::new(config.ring_buffer_samples.max(4096));
        let (producer, consumer) = rb.split();
        let shared = Arc::new(StreamShared::default());

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared_out = shared.clone();
        let duration = info.duration;
        let output_thread = thread::Builder::new()
            .name("stem-output".into())
            .spawn(move || match open_output_stream(consumer, shared_out, duration) {
                Ok((stream, rate, channels)) => {
                    let _ = ready_tx.send(Ok((rate, channels)));
                    // Returns once the engine drops its sender.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Device(format!("cannot start output thread: {e}")))?;

        let (rate, channels) = match ready_rx.recv() {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => {
                let _ = output_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = output_thread.join();
                return Err(EngineError::Device("output thread exited during setup".into()));
            }
        };

        let (decoder_thread, cmd_tx) = match decoder::spawn_decoder(
            path.clone(),
            producer,
            shared.clone(),
            channels,
            rate,
            config.seek_fade_ms,
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                drop(stop_tx);
                let _ = output_thread.join();
                return Err(e);
            }
        };

        info!("opened {path} ({:.2}s)", info.duration);
        Ok(Self {
            location: path,
            shared,
            duration: info.duration,
            cmd_tx: Some(cmd_tx),
            output_stop: Some(stop_tx),
            decoder_thread: Some(decoder_thread),
            output_thread: Some(output_thread),
        })
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.cmd_tx.is_none() {
            return Err(EngineError::Unloaded);
        }
        Ok(())
    }
}

impl StemEngine for StreamEngine {
    fn play(&mut self) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.shared.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.shared.playing.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn seek(&mut self, t: f64) -> Result<(), EngineError> {
        let Some(tx) = &self.cmd_tx else {
            return Err(EngineError::Unloaded);
        };
        let target = t.clamp(0.0, self.duration);
        let generation = self.shared.begin_seek(target);
        tx.send(DecoderCmd::Seek { target, generation })
            .map_err(|_| EngineError::Command(format!("decoder for {} is gone", self.location)))
    }

    fn position_seconds(&self) -> f64 {
        if self.shared.seek_pending() {
            self.shared.seek_target()
        } else {
            self.shared.position()
        }
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Relaxed) && !self.shared.finished.load(Ordering::Relaxed)
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.set_volume(volume.clamp(0.0, 1.0));
    }

    fn set_muted(&mut self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    fn set_rate(&mut self, rate: f32) {
        self.shared.set_rate(rate);
    }

    fn unload(&mut self) {
        let Some(tx) = self.cmd_tx.take() else {
            return;
        };
        self.shared.playing.store(false, Ordering::Relaxed);
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let _ = tx.send(DecoderCmd::Stop);
        drop(tx);
        self.output_stop.take();

        for handle in [self.decoder_thread.take(), self.output_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                warn!("{}: engine thread panicked", self.location);
            }
        }
        debug!("unloaded {}", self.location);
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Opens stems as `StreamEngine`s on the default output device.
pub struct StreamEngineFactory {
    config: PlayerConfig,
}

impl StreamEngineFactory {
    pub fn new(config: PlayerConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for StreamEngineFactory {
    type Engine = StreamEngine;

    fn load(&self, stem: &StemRecord) -> Result<StreamEngine, EngineError> {
        StreamEngine::open(&stem.audio_source, &self.config)
    }
}
