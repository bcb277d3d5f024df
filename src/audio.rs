// src/audio.rs

use std::sync::{Arc, atomic::Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SizedSample, Stream, StreamConfig};
use log::{error, info};
use ringbuf::traits::{Consumer, Observer};

use crate::decoder::StreamShared;
use crate::error::EngineError;

/// Helper struct to hold output device info
pub struct OutputConfig {
    pub device: Device,
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
    pub output_channels: usize,
    pub output_sample_rate: u32,
}

/// Finds the default audio output device and its config.
pub fn setup_output_device() -> Result<OutputConfig, EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::Device("no output device available".into()))?;
    let supported_config = device
        .default_output_config()
        .map_err(|e| EngineError::Device(e.to_string()))?;
    let sample_format = supported_config.sample_format();
    let config = supported_config.config();
    let output_channels = config.channels as usize;
    let output_sample_rate = config.sample_rate.0;

    info!("output device: {output_channels} channels at {output_sample_rate} Hz");

    Ok(OutputConfig {
        device,
        config,
        sample_format,
        output_channels,
        output_sample_rate,
    })
}

/// Linear-interpolating playback-rate changer sitting between the ring
/// buffer and the device. Counts every source frame it steps over, which is
/// what the engine reports as its position.
pub struct Varispeed {
    channels: usize,
    phase: f64,
    cur: Vec<f32>,
    next: Vec<f32>,
    primed: bool,
    consumed: u64,
}

impl Varispeed {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            phase: 0.0,
            cur: vec![0.0; channels],
            next: vec![0.0; channels],
            primed: false,
            consumed: 0,
        }
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.primed = false;
        self.consumed = 0;
    }

    /// Source frames consumed since the last reset.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn pop_frame<C: Consumer<Item = f32>>(consumer: &mut C, dst: &mut [f32]) -> bool {
        if consumer.occupied_len() < dst.len() {
            return false;
        }
        for s in dst.iter_mut() {
            *s = consumer.try_pop().unwrap_or(0.0);
        }
        true
    }

    /// Render one output frame into `out`. Returns `false` on underrun.
    pub fn render<C: Consumer<Item = f32>>(&mut self, consumer: &mut C, rate: f64, out: &mut [f32]) -> bool {
        if !self.primed {
            if consumer.occupied_len() < 2 * self.channels {
                return false;
            }
            Self::pop_frame(consumer, &mut self.cur);
            Self::pop_frame(consumer, &mut self.next);
            self.primed = true;
        }

        let frac = self.phase as f32;
        for (o, (a, b)) in out.iter_mut().zip(self.cur.iter().zip(&self.next)) {
            *o = a + (b - a) * frac;
        }

        self.phase += rate.max(0.0);
        while self.phase >= 1.0 {
            self.phase -= 1.0;
            std::mem::swap(&mut self.cur, &mut self.next);
            self.consumed += 1;
            if !Self::pop_frame(consumer, &mut self.next) {
                self.primed = false;
                self.phase = 0.0;
                break;
            }
        }
        true
    }
}

/// Build CPAL output stream for one stem.
///
/// While a seek is pending the callback discards buffered audio and plays
/// silence; once the decoder reports the seek ready, position restarts
/// from the seek target.
pub fn build_stream<T, C>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<StreamShared>,
    duration: f64,
    mut consumer: C,
) -> Result<Stream, EngineError>
where
    T: cpal::Sample + cpal::FromSample<f32> + SizedSample,
    C: Consumer<Item = f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0 as f64;
    let mut varispeed = Varispeed::new(channels);
    let mut frame = vec![0.0f32; channels];
    let mut generation = shared.ready_gen.load(Ordering::Acquire);
    let mut base = shared.seek_target();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let requested = shared.seek_gen.load(Ordering::Acquire);
                if shared.ready_gen.load(Ordering::Acquire) != requested {
                    consumer.clear();
                    varispeed.reset();
                    data.fill(T::EQUILIBRIUM);
                    return;
                }
                if generation != requested {
                    generation = requested;
                    base = shared.seek_target();
                    varispeed.reset();
                }

                let playing = shared.playing.load(Ordering::Relaxed)
                    && !shared.finished.load(Ordering::Relaxed);
                if !playing {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }

                let gain = if shared.muted.load(Ordering::Relaxed) {
                    0.0
                } else {
                    shared.volume()
                };
                let rate = shared.rate() as f64;

                for out in data.chunks_mut(channels) {
                    if varispeed.render(&mut consumer, rate, &mut frame) {
                        for (o, s) in out.iter_mut().zip(&frame) {
                            *o = T::from_sample(s * gain);
                        }
                    } else {
                        out.fill(T::EQUILIBRIUM);
                        if shared.exhausted.load(Ordering::Acquire)
                            && consumer.occupied_len() < 2 * channels
                        {
                            shared.finished.store(true, Ordering::Relaxed);
                        }
                    }
                }

                let position = if shared.finished.load(Ordering::Relaxed) {
                    duration
                } else {
                    (base + varispeed.consumed() as f64 / sample_rate).min(duration)
                };
                shared.set_position(position);
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| EngineError::Device(e.to_string()))
}

/// Open the default device and start a stream for one stem.
/// Returns the stream with the device's sample rate and channel count.
pub fn open_output_stream<C>(
    consumer: C,
    shared: Arc<StreamShared>,
    duration: f64,
) -> Result<(Stream, u32, usize), EngineError>
where
    C: Consumer<Item = f32> + Send + 'static,
{
    let OutputConfig {
        device,
        config,
        sample_format,
        output_channels,
        output_sample_rate,
    } = setup_output_device()?;

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32, _>(&device, &config, shared, duration, consumer)?,
        SampleFormat::I16 => build_stream::<i16, _>(&device, &config, shared, duration, consumer)?,
        SampleFormat::U16 => build_stream::<u16, _>(&device, &config, shared, duration, consumer)?,
        other => {
            return Err(EngineError::Device(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    };
    stream
        .play()
        .map_err(|e| EngineError::Device(e.to_string()))?;

    Ok((stream, output_sample_rate, output_channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::HeapRb;
    use ringbuf::traits::{Producer, Split};

    fn filled(samples: &[f32]) -> impl Consumer<Item = f32> {
        let (mut prod, cons) = HeapRb::<f32>::new(64).split();
        for s in samples {
            prod.try_push(*s).unwrap();
        }
        cons
    }

    fn render_all(v: &mut Varispeed, cons: &mut impl Consumer<Item = f32>, rate: f64) -> Vec<f32> {
        let mut out = Vec::new();
        let mut frame = [0.0f32];
        while v.render(cons, rate, &mut frame) {
            out.push(frame[0]);
        }
        out
    }

    #[test]
    fn unity_rate_passes_audio_through() {
        let mut cons = filled(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let mut v = Varispeed::new(1);
        let out = render_all(&mut v, &mut cons, 1.0);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(v.consumed(), 4);
    }

    #[test]
    fn double_rate_skips_frames() {
        let mut cons = filled(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut v = Varispeed::new(1);
        let out = render_all(&mut v, &mut cons, 2.0);
        assert_eq!(out, vec![0.0, 2.0, 4.0]);
        assert_eq!(v.consumed(), 6);
    }

    #[test]
    fn half_rate_interpolates() {
        let mut cons = filled(&[0.0, 1.0, 2.0]);
        let mut v = Varispeed::new(1);
        let out = render_all(&mut v, &mut cons, 0.5);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }
}
