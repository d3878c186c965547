//! Output driver abstraction (C5, spec §4.5).
//!
//! `OutputDriver` stands in for MOC's function-pointer table
//! (`trunk/audio.h`'s `hw_funcs`); `cpal_backend` is the real driver,
//! `null_backend` is the debug-build stand-in mentioned in spec §4.5.

pub mod cpal_backend;
pub mod null_backend;

use crate::format::{BaseFormat, FormatMask, SoundParams};

#[derive(Debug, Clone, Copy)]
pub struct OutputCapabilities {
    pub formats: FormatMask,
    pub min_channels: u16,
    pub max_channels: u16,
}

/// Two independent logical mixer channels (e.g. "Master"/"PCM"), per
/// spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerChannel {
    Primary,
    Secondary,
}

impl MixerChannel {
    pub fn toggled(self) -> Self {
        match self {
            MixerChannel::Primary => MixerChannel::Secondary,
            MixerChannel::Secondary => MixerChannel::Primary,
        }
    }
}

pub trait OutputDriver: Send {
    fn name(&self) -> &str;

    fn init(&mut self) -> color_eyre::Result<OutputCapabilities>;

    fn shutdown(&mut self);

    fn open(&mut self, params: SoundParams) -> color_eyre::Result<()>;

    fn close(&mut self);

    /// Write PCM, returning bytes actually consumed, or an error if the
    /// device rejected the write (spec: `DeviceWrite`).
    fn play(&mut self, buf: &[u8]) -> color_eyre::Result<usize>;

    fn read_mixer(&self) -> u8;

    fn set_mixer(&mut self, value: u8);

    fn get_buff_fill(&self) -> usize;

    fn reset(&mut self) -> bool;

    fn get_rate(&self) -> u32;

    fn toggle_mixer_channel(&mut self);

    fn get_mixer_channel_name(&self) -> &str;
}

/// Parse a comma-separated driver preference list and return the first
/// driver whose `init()` succeeds, per spec §4.5.
pub fn open_first_working(
    preference: &str,
    mut make: impl FnMut(&str) -> Option<Box<dyn OutputDriver>>,
) -> color_eyre::Result<Box<dyn OutputDriver>> {
    for name in preference.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some(mut driver) = make(name) else {
            tracing::warn!(driver = name, "unknown output driver name, skipping");
            continue;
        };
        match driver.init() {
            Ok(_) => {
                tracing::info!(driver = name, "output driver initialized");
                return Ok(driver);
            }
            Err(e) => tracing::warn!(driver = name, error = %e, "driver init failed, trying next"),
        }
    }
    Err(crate::error::DeviceError::NoDriverAvailable.into())
}

pub fn default_mask() -> FormatMask {
    FormatMask::EMPTY
        .add(BaseFormat::S16)
        .add(BaseFormat::S32)
        .add(BaseFormat::F32)
}
