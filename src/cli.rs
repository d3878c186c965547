//! Command-line surface (spec §6). One process binary serves both the
//! `server`/`foreground` entry points and every one-shot client command;
//! `clap`'s derive macros are used the way the teacher's own `Cli`
//! struct uses them, generalized from a single `--proxy` flag to a full
//! `Commands` enum.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mocr", version, about = "Music On Console, reworked in Rust")]
pub struct Cli {
    /// Overrides the default `~/.moc/config.toml` location.
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Display-title format string, e.g. "%a - %t" (spec §4.8).
    #[arg(long, global = true)]
    pub format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts the server in the background.
    Server,
    /// Starts the server attached to the current terminal.
    Foreground,
    /// Appends a file or directory to the playlist without starting playback.
    Append { path: Utf8PathBuf },
    /// Clears the playlist, adds a single item, and starts playing it.
    Playit { path: Utf8PathBuf },
    /// Appends a file or directory, replacing the current playlist.
    Enqueue { path: Utf8PathBuf },
    /// Clears the current playlist.
    Clear,
    /// Starts (or resumes) playback, optionally of a named item.
    Play { name: Option<String> },
    /// Stops playback.
    Stop,
    /// Skips to the next item.
    Next,
    /// Returns to the previous item.
    Previous,
    /// Pauses playback.
    Pause,
    /// Resumes paused playback.
    Unpause,
    /// Toggles between play and pause.
    TogglePause,
    /// Requests a clean server shutdown.
    Exit,
    /// Seeks by a relative number of seconds, e.g. "+10" or "-5".
    Seek {
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },
    /// Jumps to an absolute position: a percentage ("50%") or seconds ("90s").
    Jump { position: String },
    /// Adjusts the software mixer by a relative amount, e.g. "+5" or "-10".
    Volume {
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },
    /// Turns a boolean option on.
    On { name: String },
    /// Turns a boolean option off.
    Off { name: String },
    /// Toggles a boolean option.
    Toggle { name: String },
    /// Prints the current player status.
    Info,
    /// Lists the sound drivers available on this host.
    SoundDriverList,
}

/// Parses a signed relative delta like `"+10"`/`"-5"`/`"10"`, per the
/// `seek`/`volume` CLI surface (spec §6).
pub fn parse_signed_delta(s: &str) -> Result<f64, std::num::ParseFloatError> {
    s.parse::<f64>()
}

/// Parses a `jump` target: `"50%"` for a relative position or `"90s"`/
/// `"90"` for an absolute number of seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JumpTarget {
    Percent(f64),
    Seconds(f64),
}

pub fn parse_jump_target(s: &str) -> Result<JumpTarget, std::num::ParseFloatError> {
    if let Some(pct) = s.strip_suffix('%') {
        Ok(JumpTarget::Percent(pct.parse()?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(JumpTarget::Seconds(secs.parse()?))
    } else {
        Ok(JumpTarget::Seconds(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_target_parses_percent_and_seconds() {
        assert_eq!(parse_jump_target("50%").unwrap(), JumpTarget::Percent(50.0));
        assert_eq!(parse_jump_target("90s").unwrap(), JumpTarget::Seconds(90.0));
        assert_eq!(parse_jump_target("90").unwrap(), JumpTarget::Seconds(90.0));
    }

    #[test]
    fn signed_delta_parses_negative_values() {
        assert_eq!(parse_signed_delta("-5").unwrap(), -5.0);
        assert_eq!(parse_signed_delta("+10").unwrap(), 10.0);
    }
}
