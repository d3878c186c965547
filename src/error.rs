//! Leaf error kinds, one family per row of spec §7's error table.
//!
//! These cross module boundaries wrapped in [`color_eyre::Report`] via
//! `.wrap_err(...)`; callers that need to branch on *kind* (e.g. the player
//! loop deciding whether a decoder error is recoverable) downcast with
//! `report.downcast_ref::<DecoderError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    /// Recoverable: skip this frame and keep decoding.
    #[error("stream error in decoder: {0}")]
    Stream(String),
    /// Unrecoverable: stop playing this track.
    #[error("fatal decoder error: {0}")]
    Fatal(String),
    #[error("no decoder plugin claims this file")]
    NoMatchingPlugin,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("transient I/O error, retrying: {0}")]
    Transient(String),
    #[error("fatal I/O error: {0}")]
    Fatal(String),
    #[error("operation aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open output device: {0}")]
    Open(String),
    #[error("write to output device failed: {0}")]
    Write(String),
    #[error("no configured output driver could be initialized")]
    NoDriverAvailable,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command from client: {0}")]
    Decode(String),
    #[error("string payload exceeds maximum length (4096)")]
    StringTooLong,
    #[error("unknown command byte: {0:#x}")]
    UnknownCommand(u8),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("tag cache I/O error: {0}")]
    Io(String),
    #[error("tag cache database error: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0}")]
    Fatal(String),
}
