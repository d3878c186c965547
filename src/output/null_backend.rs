//! NULL output driver: discards PCM, used by tests and debug builds to
//! exercise the ring/player/controller without real audio hardware
//! (spec §4.5: "A NULL driver is available in debug builds for tests").

use super::{MixerChannel, OutputCapabilities, OutputDriver};
use crate::format::{BaseFormat, FormatMask, SoundParams};

pub struct NullDriver {
    params: Option<SoundParams>,
    mixer_primary: u8,
    mixer_secondary: u8,
    active_channel: MixerChannel,
    open: bool,
}

impl NullDriver {
    pub fn new() -> Self {
        Self {
            params: None,
            mixer_primary: 100,
            mixer_secondary: 100,
            active_channel: MixerChannel::Primary,
            open: false,
        }
    }
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn init(&mut self) -> color_eyre::Result<OutputCapabilities> {
        Ok(OutputCapabilities {
            formats: FormatMask::EMPTY
                .add(BaseFormat::U8)
                .add(BaseFormat::S8)
                .add(BaseFormat::U16)
                .add(BaseFormat::S16)
                .add(BaseFormat::U32)
                .add(BaseFormat::S32)
                .add(BaseFormat::F32),
            min_channels: 1,
            max_channels: 8,
        })
    }

    fn shutdown(&mut self) {
        self.open = false;
    }

    fn open(&mut self, params: SoundParams) -> color_eyre::Result<()> {
        self.params = Some(params);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn play(&mut self, buf: &[u8]) -> color_eyre::Result<usize> {
        if !self.open {
            return Err(crate::error::DeviceError::Write("device not open".into()).into());
        }
        Ok(buf.len())
    }

    fn read_mixer(&self) -> u8 {
        match self.active_channel {
            MixerChannel::Primary => self.mixer_primary,
            MixerChannel::Secondary => self.mixer_secondary,
        }
    }

    fn set_mixer(&mut self, value: u8) {
        let value = value.min(100);
        match self.active_channel {
            MixerChannel::Primary => self.mixer_primary = value,
            MixerChannel::Secondary => self.mixer_secondary = value,
        }
    }

    fn get_buff_fill(&self) -> usize {
        0
    }

    fn reset(&mut self) -> bool {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_without_open_is_an_error() {
        let mut drv = NullDriver::new();
        assert!(drv.play(&[0, 1, 2]).is_err());
    }

    #[test]
    fn play_after_open_consumes_everything() {
        let mut drv = NullDriver::new();
        drv.init().unwrap();
        drv.open(SoundParams {
            format: crate::format::SampleFormat::new(BaseFormat::S16, crate::format::Endian::Native),
            channels: 2,
            rate: 44100,
        })
        .unwrap();
        assert_eq!(drv.play(&[0u8; 128]).unwrap(), 128);
    }

    #[test]
    fn mixer_toggle_switches_channel_and_keeps_values_independent() {
        let mut drv = NullDriver::new();
        drv.set_mixer(30);
        drv.toggle_mixer_channel();
        drv.set_mixer(80);
        drv.toggle_mixer_channel();
        assert_eq!(drv.read_mixer(), 30);
        drv.toggle_mixer_channel();
        assert_eq!(drv.read_mixer(), 80);
    }
}
