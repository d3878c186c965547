//! Format conversion (C6, spec §4.6): format/channel/rate matching plus
//! software volume, built fresh each time the decoder's reported
//! `SoundParams` don't match the open device.

use rubato::{FftFixedIn, Resampler};

use crate::format::{sfmt_best_matching, BaseFormat, SoundParams};
use crate::output::OutputCapabilities;

/// Device rate is accepted as-is unless it drifts from the requested
/// rate by more than this fraction, per spec §4.6.
const RATE_DRIFT_THRESHOLD: f64 = 0.05;

/// Resolves `(format, channels, rate)` MOC would open the device with,
/// given what the decoder wants and what the device/config allow.
pub fn negotiate(
    requested: SoundParams,
    caps: OutputCapabilities,
    forced_rate: Option<u32>,
) -> SoundParams {
    let format = sfmt_best_matching(caps.formats, requested.format.base)
        .unwrap_or(BaseFormat::S16);
    let channels = requested
        .channels
        .clamp(caps.min_channels, caps.max_channels);
    let rate = forced_rate.unwrap_or(requested.rate);

    SoundParams {
        format: crate::format::SampleFormat::new(format, requested.format.endian),
        channels,
        rate,
    }
}

/// `true` if `device_rate` differs from `requested_rate` enough that a
/// resampler should be inserted (spec: "if it differs by > 5% a
/// resampler is inserted").
pub fn needs_resample(requested_rate: u32, device_rate: u32) -> bool {
    if requested_rate == 0 {
        return false;
    }
    let drift = (device_rate as f64 - requested_rate as f64).abs() / requested_rate as f64;
    drift > RATE_DRIFT_THRESHOLD
}

/// Downmixes interleaved `f32` samples from `from_channels` to
/// `to_channels` by simple averaging, per spec §4.6 ("a simple average
/// across source channels produces mono"). Only handles the
/// any-channels-to-mono case; upmixing is not attempted (the device
/// side always clamps to at least the source's channel count when it
/// supports it).
pub fn downmix_to_mono(samples: &[f32], from_channels: u16) -> Vec<f32> {
    let from_channels = from_channels as usize;
    if from_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(from_channels)
        .map(|frame| frame.iter().sum::<f32>() / from_channels as f32)
        .collect()
}

/// Software volume stage: multiplies every sample by `mixer_real/100`
/// with saturating clipping, per spec §4.6.
pub fn apply_software_volume(samples: &mut [f32], mixer_real: u8) {
    let gain = mixer_real.min(100) as f32 / 100.0;
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

/// Wraps a `rubato` resampler for the life of a track; torn down and
/// rebuilt whenever the decoder reports a `sound_params` change
/// mid-track (spec §4.6).
pub struct ConversionContext {
    resampler: Option<FftFixedIn<f32>>,
    channels: usize,
}

impl ConversionContext {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16, chunk_size: usize) -> color_eyre::Result<Self> {
        let channels = channels as usize;
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, 2, channels)
                    .map_err(|e| crate::error::DecoderError::Fatal(e.to_string()))?,
            )
        };
        Ok(Self { resampler, channels })
    }

    /// Resamples one chunk of deinterleaved-per-channel input
    /// (`channels` vecs of equal length) in place, returning the
    /// resampled deinterleaved output. A no-op pass-through when rates
    /// already match.
    pub fn process(&mut self, input: Vec<Vec<f32>>) -> color_eyre::Result<Vec<Vec<f32>>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input);
        };
        resampler
            .process(&input, None)
            .map_err(|e| crate::error::DecoderError::Stream(e.to_string()).into())
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Streaming adapter over [`ConversionContext`] for the player's chunked
/// decode loop: `FftFixedIn` only accepts a fixed frame count per call, so
/// incoming interleaved samples are deinterleaved and buffered per channel
/// until a full chunk is available, with any remainder carried over.
pub struct StreamResampler {
    ctx: ConversionContext,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16, chunk_frames: usize) -> color_eyre::Result<Self> {
        let ctx = ConversionContext::new(from_rate, to_rate, channels, chunk_frames)?;
        Ok(Self {
            ctx,
            channels: channels as usize,
            chunk_frames,
            pending: vec![Vec::new(); channels as usize],
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.ctx.is_passthrough()
    }

    /// Feeds interleaved samples in; returns as much resampled interleaved
    /// output as a full chunk produced. Leftover input under a full chunk
    /// stays buffered for the next call.
    pub fn push(&mut self, interleaved: &[f32]) -> color_eyre::Result<Vec<f32>> {
        if self.is_passthrough() {
            return Ok(interleaved.to_vec());
        }

        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.pending[ch].push(*sample);
            }
        }

        if self.pending[0].len() < self.chunk_frames {
            return Ok(Vec::new());
        }

        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|v| v.drain(..self.chunk_frames).collect())
            .collect();
        let out = self.ctx.process(chunk)?;
        let frames_out = out.first().map(Vec::len).unwrap_or(0);
        let mut interleaved_out = Vec::with_capacity(frames_out * self.channels);
        for i in 0..frames_out {
            for channel in &out {
                interleaved_out.push(channel[i]);
            }
        }
        Ok(interleaved_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Endian, FormatMask, SampleFormat};

    #[test]
    fn resample_not_needed_within_threshold() {
        assert!(!needs_resample(44100, 45000));
    }

    #[test]
    fn resample_needed_beyond_threshold() {
        assert!(needs_resample(44100, 48000));
    }

    #[test]
    fn negotiate_clamps_channels_to_device_range() {
        let requested = SoundParams {
            format: SampleFormat::new(BaseFormat::S16, Endian::Native),
            channels: 1,
            rate: 44100,
        };
        let caps = OutputCapabilities {
            formats: FormatMask::EMPTY.add(BaseFormat::S16),
            min_channels: 2,
            max_channels: 2,
        };
        let result = negotiate(requested, caps, None);
        assert_eq!(result.channels, 2);
    }

    #[test]
    fn downmix_stereo_to_mono_averages_channels() {
        let stereo = vec![1.0, 3.0, 0.5, -0.5];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![2.0, 0.0]);
    }

    #[test]
    fn software_volume_scales_and_clips() {
        let mut samples = vec![0.8, -0.8];
        apply_software_volume(&mut samples, 50);
        assert!((samples[0] - 0.4).abs() < 1e-6);
        assert!((samples[1] + 0.4).abs() < 1e-6);
    }

    #[test]
    fn software_volume_above_100_is_clamped_before_scaling() {
        let mut samples = vec![0.9];
        apply_software_volume(&mut samples, 200);
        assert!((samples[0] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn software_volume_at_zero_mutes() {
        let mut samples = vec![0.5, -0.5, 1.0];
        apply_software_volume(&mut samples, 0);
        assert!(samples.iter().all(|&s| s == 0.0));
    }
}
