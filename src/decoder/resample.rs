// src/decoder/resample.rs

use anyhow::Result;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    calculate_cutoff,
};

use crate::decoder::dsp;

const CHUNK_FRAMES: usize = 1024;

/// Sample-rate converter fed with interleaved packets of any size.
/// Input is staged per channel until a full chunk is available.
pub struct StageResampler {
    inner: SincFixedIn<f32>,
    stage: Vec<Vec<f32>>,
}

impl StageResampler {
    /// `None` when no conversion is needed.
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize) -> Result<Option<Self>> {
        if src_rate == dst_rate || channels == 0 {
            return Ok(None);
        }
        let sinc_len = 256usize;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window,
        };
        let ratio = dst_rate as f64 / src_rate as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_FRAMES, channels)?;
        Ok(Some(Self {
            inner,
            stage: vec![Vec::with_capacity(CHUNK_FRAMES * 4); channels],
        }))
    }

    pub fn push_interleaved(&mut self, interleaved: &[f32]) {
        let channels = self.stage.len();
        for frame in interleaved.chunks_exact(channels) {
            for (ch, s) in frame.iter().enumerate() {
                self.stage[ch].push(*s);
            }
        }
    }

    fn staged_frames(&self) -> usize {
        self.stage.iter().map(Vec::len).min().unwrap_or(0)
    }

    /// Next converted block, interleaved, once enough input is staged.
    pub fn pull(&mut self) -> Result<Option<Vec<f32>>> {
        let need = self.inner.input_frames_next();
        if self.staged_frames() < need {
            return Ok(None);
        }
        let block: Vec<Vec<f32>> = self
            .stage
            .iter_mut()
            .map(|ch| ch.drain(..need).collect())
            .collect();
        let out = self.inner.process(&block, None)?;
        Ok(Some(dsp::interleave(&out)))
    }

    /// Convert whatever is staged plus the filter tail. Called at end of stream.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let rest: Vec<Vec<f32>> = self.stage.iter_mut().map(std::mem::take).collect();
        let mut out = Vec::new();
        if rest.iter().any(|ch| !ch.is_empty()) {
            let converted = self.inner.process_partial(Some(rest.as_slice()), None)?;
            out.extend(dsp::interleave(&converted));
        }
        let tail = self.inner.process_partial::<Vec<f32>>(None, None)?;
        out.extend(dsp::interleave(&tail));
        Ok(out)
    }

    /// Forget staged input and filter state; used after a seek.
    pub fn reset(&mut self) {
        self.inner.reset();
        for ch in &mut self.stage {
            ch.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_needs_no_resampler() {
        assert!(StageResampler::new(48_000, 48_000, 2).unwrap().is_none());
    }

    #[test]
    fn converts_full_chunks_only() {
        let mut r = StageResampler::new(44_100, 48_000, 2).unwrap().unwrap();
        r.push_interleaved(&vec![0.0; 100 * 2]);
        assert!(r.pull().unwrap().is_none());

        r.push_interleaved(&vec![0.0; CHUNK_FRAMES * 2]);
        let block = r.pull().unwrap().unwrap();
        assert!(!block.is_empty());
        assert_eq!(block.len() % 2, 0);

        let tail = r.flush().unwrap();
        assert_eq!(tail.len() % 2, 0);
    }
}
