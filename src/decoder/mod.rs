// src/decoder/mod.rs

//! Per-stem decode thread: symphonia packets in, device-rate interleaved
//! f32 out through a ring buffer. The thread outlives the end of the
//! source so a later seek can restart it.

pub mod control;
pub mod dsp;
pub mod output;
pub mod resample;

use std::fs::File;
use std::io::ErrorKind;
use std::sync::{
    Arc,
    atomic::Ordering,
    mpsc::{Receiver, RecvTimeoutError, Sender, channel},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use log::{debug, error, warn};
use ringbuf::traits::{Observer, Producer as RbProducer};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};

pub use control::{DecoderCmd, StreamShared};
use resample::StageResampler;

use crate::error::EngineError;

/// What the engine needs to know about a source before playing it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub duration: f64,
}

fn open_format(path: &str) -> anyhow::Result<(Box<dyn FormatReader>, u32, CodecParameters)> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = get_probe().format(
        &Default::default(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track"))?;
    let track_id = track.id;
    let params = track.codec_params.clone();
    Ok((format, track_id, params))
}

/// Read rate, channels and duration. Falls back to counting decoded frames
/// when the container does not declare its length.
pub fn probe_source(path: &str) -> Result<SourceInfo, EngineError> {
    let open_err = |e: anyhow::Error| EngineError::Open {
        location: path.to_string(),
        reason: format!("{e:#}"),
    };
    let (mut format, track_id, params) = open_format(path).map_err(open_err)?;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| open_err(anyhow!("missing sample rate")))?;
    let channels = params.channels.map(|c| c.count()).unwrap_or(2);

    let frames = match params.n_frames {
        Some(n) => n,
        None => {
            let mut decoder = get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|e| open_err(e.into()))?;
            let mut total = 0u64;
            while let Ok(packet) = format.next_packet() {
                if packet.track_id() != track_id {
                    continue;
                }
                if let Ok(decoded) = decoder.decode(&packet) {
                    total += decoded.frames() as u64;
                }
            }
            total
        }
    };

    Ok(SourceInfo {
        sample_rate,
        channels,
        duration: frames as f64 / sample_rate as f64,
    })
}

pub struct Decoder<P>
where
    P: RbProducer<Item = f32> + Send + 'static,
{
    path: String,
    producer: P,
    shared: Arc<StreamShared>,
    output_channels: usize,
    output_sample_rate: u32,
    cmd_rx: Receiver<DecoderCmd>,
    seek_fade_ms: u32,
    post_seek_fade_samples: usize,
    /// Source frames to drop after an accurate seek landed early.
    skip_frames: usize,
    generation: u64,
}

enum Flow {
    Continue,
    Stop,
}

impl<P> Decoder<P>
where
    P: RbProducer<Item = f32> + Send + 'static,
{
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("stem-decoder".into())
            .spawn(move || {
                let shared = self.shared.clone();
                let path = self.path.clone();
                if let Err(e) = self.run() {
                    error!("decoder for {path} failed: {e:#}");
                }
                // Let the output drain and report the stem as finished.
                shared.exhausted.store(true, Ordering::Release);
            })
    }

    fn run(mut self) -> anyhow::Result<()> {
        let (mut format, track_id, params) = open_format(&self.path)?;
        let mut decoder = get_codecs().make(&params, &DecoderOptions::default())?;
        let source_rate = params.sample_rate.unwrap_or(self.output_sample_rate);
        let mut resampler =
            StageResampler::new(source_rate, self.output_sample_rate, self.output_channels)?;
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if let Flow::Stop =
                    self.handle_cmd(cmd, format.as_mut(), track_id, decoder.as_mut(), &mut resampler)
                {
                    return Ok(());
                }
            }
            if self.shared.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }

            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(e) => {
                    match &e {
                        SymphoniaError::IoError(io) if io.kind() == ErrorKind::UnexpectedEof => {}
                        other => warn!("{}: stopping at read error: {other}", self.path),
                    }
                    self.finish_stream(&mut resampler)?;
                    match self.idle_until_command() {
                        Some(cmd) => {
                            if let Flow::Stop = self.handle_cmd(
                                cmd,
                                format.as_mut(),
                                track_id,
                                decoder.as_mut(),
                                &mut resampler,
                            ) {
                                return Ok(());
                            }
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let src_ch = spec.channels.count();
            let frames = decoded.frames();
            let needed = decoded.capacity() * src_ch;
            if sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let mut samples = buf.samples();
            if self.skip_frames > 0 {
                let n = self.skip_frames.min(frames);
                self.skip_frames -= n;
                samples = &samples[(n * src_ch).min(samples.len())..];
            }
            if samples.is_empty() {
                continue;
            }

            let mixed = dsp::updown_mix_interleaved(samples, src_ch, self.output_channels);
            match resampler.as_mut() {
                Some(r) => {
                    r.push_interleaved(&mixed);
                    while let Some(block) = r.pull()? {
                        if !self.push(&block) {
                            break;
                        }
                    }
                }
                None => {
                    self.push(&mixed);
                }
            }
        }
    }

    fn push(&mut self, data: &[f32]) -> bool {
        let shared = &self.shared;
        let generation = self.generation;
        output::push_with_fade(
            &mut self.producer,
            data,
            &mut self.post_seek_fade_samples,
            || shared.superseded(generation),
        )
    }

    fn handle_cmd(
        &mut self,
        cmd: DecoderCmd,
        format: &mut dyn FormatReader,
        track_id: u32,
        decoder: &mut dyn CodecDecoder,
        resampler: &mut Option<StageResampler>,
    ) -> Flow {
        match cmd {
            DecoderCmd::Stop => Flow::Stop,
            DecoderCmd::Seek { target, generation } => {
                // A newer request is already queued behind this one.
                if generation != self.shared.seek_gen.load(Ordering::Acquire) {
                    return Flow::Continue;
                }
                let target = target.max(0.0);
                let time = Time::new(target.trunc() as u64, target.fract());
                self.skip_frames = 0;
                match format.seek(
                    SeekMode::Accurate,
                    SeekTo::Time {
                        time,
                        track_id: Some(track_id),
                    },
                ) {
                    Ok(seeked) => {
                        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts) as usize;
                    }
                    Err(e) => warn!("{}: seek to {target:.3}s failed: {e}", self.path),
                }
                decoder.reset();
                if let Some(r) = resampler {
                    r.reset();
                }

                self.wait_for_drain(generation);
                self.post_seek_fade_samples =
                    dsp::fade_samples_ms(self.output_sample_rate, self.seek_fade_ms) * self.output_channels;
                self.generation = generation;
                self.shared.exhausted.store(false, Ordering::Release);
                self.shared.ready_gen.store(generation, Ordering::Release);
                debug!("{}: seek {generation} ready at {target:.3}s", self.path);
                Flow::Continue
            }
        }
    }

    /// The output callback empties the ring while a seek is pending. Wait for
    /// that so no pre-seek audio survives behind the new position.
    fn wait_for_drain(&self, generation: u64) {
        let deadline = Instant::now() + Duration::from_millis(500);
        while self.producer.occupied_len() > 0 {
            if self.shared.superseded(generation) || Instant::now() >= deadline {
                break;
            }
            thread::park_timeout(Duration::from_millis(1));
        }
    }

    fn finish_stream(&mut self, resampler: &mut Option<StageResampler>) -> anyhow::Result<()> {
        if let Some(r) = resampler.as_mut() {
            let tail = r.flush()?;
            if !tail.is_empty() {
                self.push(&tail);
            }
        }
        self.shared.exhausted.store(true, Ordering::Release);
        debug!("{}: end of stream", self.path);
        Ok(())
    }

    fn idle_until_command(&self) -> Option<DecoderCmd> {
        loop {
            if self.shared.shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.cmd_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(cmd) => return Some(cmd),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Start a decoder thread feeding `producer`. Returns the thread and its command channel.
pub fn spawn_decoder<P>(
    path: String,
    producer: P,
    shared: Arc<StreamShared>,
    output_channels: usize,
    output_sample_rate: u32,
    seek_fade_ms: u32,
) -> Result<(JoinHandle<()>, Sender<DecoderCmd>), EngineError>
where
    P: RbProducer<Item = f32> + Send + 'static,
{
    let (tx, rx) = channel();
    let decoder = Decoder {
        path,
        producer,
        shared,
        output_channels,
        output_sample_rate,
        cmd_rx: rx,
        seek_fade_ms,
        post_seek_fade_samples: 0,
        skip_frames: 0,
        generation: 0,
    };
    let handle = decoder
        .spawn()
        .map_err(|e| EngineError::Device(format!("cannot start decoder thread: {e}")))?;
    Ok((handle, tx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &std::path::Path, rate: u32, channels: u16, frames: u32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let s = ((i as f32 * 0.05).sin() * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn probes_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8_000, 2, 16_000);

        let info = probe_source(path.to_str().unwrap()).unwrap();
        assert_eq!(info.sample_rate, 8_000);
        assert_eq!(info.channels, 2);
        assert!((info.duration - 2.0).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = probe_source("/definitely/not/here.wav").unwrap_err();
        assert!(matches!(err, EngineError::Open { .. }));
    }
}
