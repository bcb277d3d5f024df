// src/decoder/dsp.rs

/// Interleave planar channels. Channels shorter than the first are padded with silence.
pub fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = planar.first() else {
        return Vec::new();
    };
    let channels = planar.len();
    let frames = first.len();
    let mut out = vec![0.0f32; frames * channels];
    for (ch, samples) in planar.iter().enumerate() {
        for (f, s) in samples.iter().take(frames).enumerate() {
            out[f * channels + ch] = *s;
        }
    }
    out
}

/// Map interleaved audio from `in_ch` to `out_ch` channels.
/// Mono is duplicated, stereo to mono is averaged, wider layouts fold
/// neighbouring channels together.
pub fn updown_mix_interleaved(input: &[f32], in_ch: usize, out_ch: usize) -> Vec<f32> {
    if in_ch == out_ch || in_ch == 0 || out_ch == 0 {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(input.len() / in_ch * out_ch);

    for frame in input.chunks_exact(in_ch) {
        if out_ch < in_ch {
            let factor = in_ch as f32 / out_ch as f32;
            for oc in 0..out_ch {
                let start = (oc as f32 * factor).floor() as usize;
                let end = (((oc + 1) as f32 * factor).ceil() as usize).min(in_ch);
                let group = &frame[start..end];
                let avg = if group.is_empty() {
                    0.0
                } else {
                    group.iter().sum::<f32>() / group.len() as f32
                };
                out.push(avg);
            }
        } else {
            out.extend((0..out_ch).map(|oc| frame[oc % in_ch]));
        }
    }
    out
}

#[inline]
pub fn fade_samples_ms(sample_rate: u32, ms: u32) -> usize {
    ((sample_rate as u64 * ms as u64) / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_to_stereo_and_back() {
        let stereo = updown_mix_interleaved(&[0.2, 0.4], 1, 2);
        assert_eq!(stereo, vec![0.2, 0.2, 0.4, 0.4]);

        let mono = updown_mix_interleaved(&[1.0, 0.0, 0.5, 0.5], 2, 1);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn interleaves_planar() {
        let planar = vec![vec![1.0, 2.0], vec![-1.0, -2.0]];
        assert_eq!(interleave(&planar), vec![1.0, -1.0, 2.0, -2.0]);
        assert!(interleave(&[]).is_empty());
    }

    #[test]
    fn fade_length_in_samples() {
        assert_eq!(fade_samples_ms(48_000, 10), 480);
        assert_eq!(fade_samples_ms(44_100, 10), 441);
    }
}
