// src/ingest/mod.rs

//! Local stand-in for the stem ingestion pipeline: decode a file once,
//! measure its duration and reduce it to a fixed number of peaks for the
//! waveform. Peaks are a drawing aid only; nothing times off them.

pub mod manifest;

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::default::{get_codecs, get_probe};

use crate::stem::{StemKind, StemRecord};

/// What ingestion learns about one audio file.
#[derive(Clone, Debug, PartialEq)]
pub struct StemAnalysis {
    pub duration: f64,
    pub peaks: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode a whole file to interleaved f32. Returns samples, rate and channel count.
pub fn decode_to_vec(path: &str) -> Result<(Vec<f32>, u32, usize)> {
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = get_probe()
        .format(
            &Default::default(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probing {path}"))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track in {path}"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = get_codecs().make(&codec_params, &DecoderOptions::default())?;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut out = Vec::<f32>::new();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(44_100);
    let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);

    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if decoded.frames() == 0 {
            continue;
        }
        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count();
        }
        sample_rate = spec.rate;

        let needed = decoded.capacity() * spec.channels.count();
        if sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
            sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            out.extend_from_slice(buf.samples());
        }
    }

    if channels == 0 {
        return Err(anyhow!("{path} decoded to nothing"));
    }
    debug!("decoded {path}: {} samples, {sample_rate} Hz, {channels} ch", out.len());
    Ok((out, sample_rate, channels))
}

/// `count` peaks over the first channel: the samples are cut into `count`
/// equal blocks and each peak is its block's max absolute amplitude.
/// Blocks past the end of short audio come out as 0.
pub fn extract_peaks(samples: &[f32], channels: usize, count: usize) -> Vec<f32> {
    let channels = channels.max(1);
    let first: Vec<f32> = samples.iter().step_by(channels).copied().collect();
    let block = (first.len() / count.max(1)).max(1);

    (0..count)
        .map(|i| {
            let start = (i * block).min(first.len());
            let end = (start + block).min(first.len());
            first[start..end]
                .iter()
                .fold(0.0f32, |peak, s| peak.max(s.abs()))
        })
        .collect()
}

pub fn analyze_file(path: &str, peak_count: usize) -> Result<StemAnalysis> {
    let (samples, sample_rate, channels) = decode_to_vec(path)?;
    let frames = samples.len() / channels.max(1);
    Ok(StemAnalysis {
        duration: frames as f64 / sample_rate as f64,
        peaks: extract_peaks(&samples, channels, peak_count),
        sample_rate,
        channels,
    })
}

/// Build a complete stem record for `path`, named after the file.
pub fn ingest_stem(path: &Path, sort_order: i32, peak_count: usize) -> Result<StemRecord> {
    let location = path
        .to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(location)
        .to_string();
    let analysis = analyze_file(location, peak_count)?;

    let mut record = StemRecord::new(format!("stem-{}", sort_order + 1), name.clone(), location)
        .with_duration(analysis.duration)
        .with_sort_order(sort_order);
    record.kind = StemKind::guess(&name);
    record.peaks = analysis.peaks;
    info!("ingested {name}: {:.2}s, {} peaks", analysis.duration, record.peaks.len());
    Ok(record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize, amp: f32) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            // Square wave so every block's peak is exactly `amp`.
            let s = if i % 2 == 0 { amp } else { -amp };
            for _ in 0..channels {
                writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn peaks_use_equal_blocks_of_first_channel() {
        // Stereo: left rises, right is loud noise that must be ignored.
        let samples = [0.1, 0.9, -0.2, 0.9, 0.3, 0.9, -0.4, 0.9];
        let peaks = extract_peaks(&samples, 2, 2);
        assert_eq!(peaks, vec![0.2, 0.4]);
    }

    #[test]
    fn short_audio_pads_with_zero_peaks() {
        let peaks = extract_peaks(&[0.5, -0.25], 1, 4);
        assert_eq!(peaks, vec![0.5, 0.25, 0.0, 0.0]);
        assert_eq!(extract_peaks(&[], 1, 3), vec![0.0; 3]);
    }

    #[test]
    fn analyzes_wav_duration_and_peaks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Lead Vocals.wav");
        write_wav(&path, 8_000, 1, 12_000, 0.5);

        let analysis = analyze_file(path.to_str().unwrap(), 100).unwrap();
        assert!((analysis.duration - 1.5).abs() < 1e-6);
        assert_eq!(analysis.peaks.len(), 100);
        assert!(analysis.peaks.iter().all(|p| (p - 0.5).abs() < 0.01));

        let record = ingest_stem(&path, 0, 100).unwrap();
        assert_eq!(record.name, "Lead Vocals");
        assert_eq!(record.kind, StemKind::Vocals);
        assert_eq!(record.duration, Some(analysis.duration));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(analyze_file(path.to_str().unwrap(), 10).is_err());
    }
}
