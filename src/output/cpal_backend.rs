//! cpal-backed [`OutputDriver`], grounded on the cpal+rubato decode→device
//! pipeline used by `alexzah-roqtune` and `ontley-amuseing` in the example
//! pack (the teacher itself plays through `rodio`'s `Source` graph, which
//! hides the raw "push PCM, get back bytes consumed" contract this ring
//! buffer needs — cpal's output stream gives us that directly).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{MixerChannel, OutputCapabilities, OutputDriver};
use crate::error::DeviceError;
use crate::fifo::FifoBuffer;
use crate::format::{BaseFormat, Endian, FormatMask, SampleFormat, SoundParams};

/// Device-side PCM ring, shared between [`CpalDriver::play`] (producer) and
/// the cpal audio callback (consumer). 64 KiB gives ~370ms of headroom at
/// CD quality, comfortably above the `MAX_PLAY_BYTES` chunk the ring buffer
/// (C1) hands us per call.
const DEVICE_FIFO_BYTES: usize = 64 * 1024;

pub struct CpalDriver {
    host: cpal::Host,
    device: Option<cpal::Device>,
    stream: Option<cpal::Stream>,
    shared: Arc<Mutex<FifoBuffer>>,
    params: Option<SoundParams>,
    /// Shared with the audio callback so `set_mixer` on the "Master"
    /// channel is actually audible rather than a stored-but-unused value.
    mixer_primary: Arc<AtomicU8>,
    mixer_secondary: u8,
    active_channel: MixerChannel,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            device: None,
            stream: None,
            shared: Arc::new(Mutex::new(FifoBuffer::new(DEVICE_FIFO_BYTES))),
            params: None,
            mixer_primary: Arc::new(AtomicU8::new(100)),
            mixer_secondary: 100,
            active_channel: MixerChannel::Primary,
        }
    }
}

impl OutputDriver for CpalDriver {
    fn name(&self) -> &str {
        "cpal"
    }

    fn init(&mut self) -> color_eyre::Result<OutputCapabilities> {
        let device = self
            .host
            .default_output_device()
            .ok_or(DeviceError::NoDriverAvailable)?;
        self.device = Some(device);
        Ok(OutputCapabilities {
            // cpal's f32 output path covers every base format by conversion
            // in `convert.rs` before bytes reach us, so the "device" mask is
            // simply everything; the real constraint (channel count, rate)
            // is negotiated in `open`.
            formats: FormatMask::EMPTY
                .add(BaseFormat::S16)
                .add(BaseFormat::S32)
                .add(BaseFormat::F32),
            min_channels: 1,
            max_channels: 8,
        })
    }

    fn shutdown(&mut self) {
        self.close();
        self.device = None;
    }

    fn open(&mut self, params: SoundParams) -> color_eyre::Result<()> {
        self.close();
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| DeviceError::Open("device not initialized".into()))?;

        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::clone(&self.shared);
        let mixer_primary = Arc::clone(&self.mixer_primary);
        let bytes_per_frame = params.bytes_per_frame();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let needed_bytes = data.len() * 4;
                    let mut raw = vec![0u8; needed_bytes];
                    let got = shared
                        .lock()
                        .expect("device fifo mutex poisoned")
                        .get(&mut raw);
                    let gain = mixer_primary.load(Ordering::Relaxed) as f32 / 100.0;
                    for (frame_bytes, sample) in raw[..got]
                        .chunks_exact(4)
                        .zip(data.iter_mut())
                    {
                        *sample = f32::from_le_bytes(frame_bytes.try_into().unwrap()) * gain;
                    }
                    for sample in data.iter_mut().skip(got / 4) {
                        *sample = 0.0;
                    }
                    let _ = bytes_per_frame;
                },
                |err| tracing::error!(error = %err, "cpal output stream error"),
                None,
            )
            .map_err(|e| DeviceError::Open(e.to_string()))?;
        stream.play().map_err(|e| DeviceError::Open(e.to_string()))?;

        self.stream = Some(stream);
        self.params = Some(params);
        self.shared.lock().expect("device fifo mutex poisoned").clear();
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.params = None;
    }

    fn play(&mut self, buf: &[u8]) -> color_eyre::Result<usize> {
        if self.stream.is_none() {
            return Err(DeviceError::Write("device not open".into()).into());
        }
        // Mirrors ALSA's blocking `snd_pcm_writei`: block until at least
        // one byte lands in the device fifo, rather than returning 0 and
        // forcing the caller to spin itself.
        loop {
            let written = self
                .shared
                .lock()
                .expect("device fifo mutex poisoned")
                .put(buf);
            if written > 0 {
                return Ok(written);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_mixer(&self) -> u8 {
        match self.active_channel {
            MixerChannel::Primary => self.mixer_primary.load(Ordering::Relaxed),
            MixerChannel::Secondary => self.mixer_secondary,
        }
    }

    fn set_mixer(&mut self, value: u8) {
        let value = value.min(100);
        match self.active_channel {
            MixerChannel::Primary => self.mixer_primary.store(value, Ordering::Relaxed),
            MixerChannel::Secondary => self.mixer_secondary = value,
        }
    }

    fn get_buff_fill(&self) -> usize {
        self.shared.lock().expect("device fifo mutex poisoned").fill()
    }

    fn reset(&mut self) -> bool {
        self.shared.lock().expect("device fifo mutex poisoned").clear();
        true
    }

    fn get_rate(&self) -> u32 {
        self.params.map(|p| p.rate).unwrap_or(0)
    }

    fn toggle_mixer_channel(&mut self) {
        self.active_channel = self.active_channel.toggled();
    }

    fn get_mixer_channel_name(&self) -> &str {
        match self.active_channel {
            MixerChannel::Primary => "Master",
            MixerChannel::Secondary => "PCM",
        }
    }
}

/// Endianness cpal's `f32` stream implies, used by `convert.rs` when
/// building the conversion context for this driver.
pub fn native_float_format() -> SampleFormat {
    SampleFormat::new(BaseFormat::F32, Endian::Native)
}
