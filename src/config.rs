//! Runtime configuration (ambient; ungrounded in spec.md itself, added
//! per the full spec's ambient-stack requirement). TOML file at
//! `~/.moc/config.toml`, located via `etcetera` the way a desktop app
//! resolves its config dir, deserialised with `serde` the way the
//! teacher's own config-adjacent structs are.

use camino::{Utf8Path, Utf8PathBuf};
use etcetera::BaseStrategy;
use serde::Deserialize;

use crate::error::ConfigError;

/// Runtime-mutable playback options (spec §4.11's `GET_OPTION`/
/// `SET_OPTION` whitelist: `{Shuffle, Repeat, AutoNext,
/// ShowStreamErrors}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub shuffle: bool,
    pub repeat: bool,
    pub auto_next: bool,
    pub show_stream_errors: bool,
    pub precache: bool,
    /// Pins the output device's rate regardless of what the decoder
    /// reports, per spec §4.6's negotiation step. Not part of the
    /// `GET_OPTION`/`SET_OPTION` whitelist; set once from `config.toml`.
    pub force_sample_rate: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shuffle: false,
            repeat: false,
            auto_next: true,
            show_stream_errors: true,
            precache: true,
            force_sample_rate: None,
        }
    }
}

impl Options {
    /// Looks up an option by its protocol-visible name, returning `None`
    /// for anything outside the whitelist (spec §4.11).
    pub fn get_named(&self, name: &str) -> Option<bool> {
        match name {
            "Shuffle" => Some(self.shuffle),
            "Repeat" => Some(self.repeat),
            "AutoNext" => Some(self.auto_next),
            "ShowStreamErrors" => Some(self.show_stream_errors),
            _ => None,
        }
    }

    pub fn set_named(&mut self, name: &str, value: bool) -> bool {
        match name {
            "Shuffle" => self.shuffle = value,
            "Repeat" => self.repeat = value,
            "AutoNext" => self.auto_next = value,
            "ShowStreamErrors" => self.show_stream_errors = value,
            _ => return false,
        }
        true
    }
}

/// On-disk config shape; deserialises with defaults for any field a
/// user's `config.toml` omits.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub shuffle: bool,
    pub repeat: bool,
    pub auto_next: bool,
    pub show_stream_errors: bool,
    pub precache: bool,
    /// Comma-separated output driver preference list, e.g. "cpal,null".
    pub sound_driver: String,
    pub output_buffer_bytes: usize,
    pub input_buffer_bytes: usize,
    pub tag_cache_max_records: usize,
    pub mixer_name: String,
    pub force_sample_rate: Option<u32>,
}

impl Default for FileConfig {
    fn default() -> Self {
        let defaults = Options::default();
        Self {
            shuffle: defaults.shuffle,
            repeat: defaults.repeat,
            auto_next: defaults.auto_next,
            show_stream_errors: defaults.show_stream_errors,
            precache: defaults.precache,
            sound_driver: "cpal,null".to_owned(),
            output_buffer_bytes: 512 * 1024,
            input_buffer_bytes: crate::io_stream::DEFAULT_PREFETCH_BYTES,
            tag_cache_max_records: 50_000,
            mixer_name: "Master".to_owned(),
            force_sample_rate: None,
        }
    }
}

impl FileConfig {
    pub fn to_options(&self) -> Options {
        Options {
            shuffle: self.shuffle,
            repeat: self.repeat,
            auto_next: self.auto_next,
            show_stream_errors: self.show_stream_errors,
            precache: self.precache,
            force_sample_rate: self.force_sample_rate,
        }
    }
}

/// `~/.moc`, resolved via `etcetera`'s home-dir strategy rather than
/// hardcoding `$HOME`.
pub fn moc_home_dir() -> color_eyre::Result<Utf8PathBuf> {
    let strategy = etcetera::choose_base_strategy()
        .map_err(|e| ConfigError::Read { path: "$HOME".into(), source: std::io::Error::other(e.to_string()) })?;
    let home = strategy.home_dir();
    let home = Utf8Path::from_path(home)
        .ok_or_else(|| ConfigError::Read { path: home.display().to_string(), source: std::io::Error::other("home dir is not UTF-8") })?;
    Ok(home.join(".moc"))
}

pub fn load(path: &Utf8Path) -> color_eyre::Result<FileConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(e) => return Err(ConfigError::Read { path: path.to_string(), source: e }.into()),
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg = load(Utf8Path::new("/definitely/does/not/exist.toml")).unwrap();
        assert_eq!(cfg.sound_driver, "cpal,null");
    }

    #[test]
    fn parses_a_partial_toml_with_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("config.toml");
        std::fs::write(&path, "shuffle = true\n").unwrap();
        let cfg = load(&path).unwrap();
        assert!(cfg.shuffle);
        assert!(cfg.auto_next);
    }

    #[test]
    fn option_whitelist_rejects_unknown_names() {
        let mut opts = Options::default();
        assert!(!opts.set_named("NotAnOption", true));
        assert!(opts.set_named("Repeat", true));
        assert_eq!(opts.get_named("Repeat"), Some(true));
        assert_eq!(opts.get_named("NotAnOption"), None);
    }
}
