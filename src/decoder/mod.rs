//! Decoder registry (C4, spec §4.4). `DecoderPlugin` stands in for the C
//! vtable of function pointers in `trunk/decoder.h`; we register exactly
//! one statically-linked backend ([`symphonia_backend`]) instead of
//! walking a plugin directory of `.so` files, but keep the same
//! resolution policy and the same read-mostly registry shape.

pub mod symphonia_backend;

use std::sync::Arc;

use crate::error::DecoderError;
use crate::format::SoundParams;
use crate::io_stream::IoStream;

/// API version a plugin must report to be accepted, mirroring the
/// compile-time constant check in `decoder.c`'s loader.
pub const PLUGIN_API_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderErrorKind {
    Ok,
    Stream,
    Fatal,
}

/// One open decode session. Plugins hand these back from `open`/
/// `open_stream`; the player loop drives them.
pub trait DecoderHandle: Send {
    fn decode(&mut self, out: &mut [u8], sound_params: &mut SoundParams) -> Result<usize, DecoderError>;

    /// Seeks to `seconds`, returning the position actually landed on, or
    /// `None` if the decoder could not seek.
    fn seek(&mut self, seconds: f64) -> Option<f64>;

    fn get_bitrate(&self) -> Option<u32>;

    fn get_duration(&self) -> Option<f64>;

    /// Tags that can change mid-stream (ICY titles, chained Ogg comments).
    /// Returns `Some` only when they changed since the last call.
    fn current_tags(&mut self) -> Option<crate::tags_cache::Tags> {
        None
    }

    fn get_stream(&self) -> Option<Arc<IoStream>> {
        None
    }
}

/// `TagsWhich` mirrors the C API's `which` bitmask for `info()`, letting
/// callers ask for only the tags they need (the tag cache wants
/// everything; a quick title-only probe wants less).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagsWhich {
    pub comments: bool,
    pub time: bool,
}

impl TagsWhich {
    pub const ALL: Self = Self { comments: true, time: true };
}

pub trait DecoderPlugin: Send + Sync {
    fn get_name(&self) -> &str;

    fn our_format_ext(&self, ext: &str) -> bool;

    fn our_format_mime(&self, _mime: &str) -> bool {
        false
    }

    /// Content-sniffs an already-open, non-destructively-peeked stream.
    fn can_decode(&self, _peeked: &[u8]) -> bool {
        false
    }

    fn open(&self, path: &camino::Utf8Path) -> Result<Box<dyn DecoderHandle>, DecoderError>;

    fn open_stream(&self, _io: Arc<IoStream>) -> Result<Box<dyn DecoderHandle>, DecoderError> {
        Err(DecoderError::NoMatchingPlugin)
    }

    fn info(&self, path: &camino::Utf8Path, which: TagsWhich) -> Option<crate::tags_cache::Tags>;
}

/// Read-mostly set of registered plugins, built once at startup.
pub struct Registry {
    plugins: Vec<Box<dyn DecoderPlugin>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Registers `plugin`, refusing it if one with the same name is
    /// already present (stands in for the loader's duplicate-handle
    /// check, since we have no shared-object identity to compare).
    pub fn register(&mut self, plugin: Box<dyn DecoderPlugin>) {
        if self.plugins.iter().any(|p| p.get_name() == plugin.get_name()) {
            tracing::warn!(name = plugin.get_name(), "duplicate decoder plugin, ignoring");
            return;
        }
        self.plugins.push(plugin);
    }

    /// Builds the default registry: just the built-in symphonia backend,
    /// which covers the formats MOC spreads across mp3.c/flac.c/ogg.c/
    /// wav.c/ffmpeg.c.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(symphonia_backend::SymphoniaPlugin::new()));
        registry
    }

    /// Resolution policy per spec §4.4: MIME first if known, then
    /// extension, in registration order.
    pub fn resolve_by_mime<'a>(&'a self, mime: &str) -> Option<&'a dyn DecoderPlugin> {
        self.plugins
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.our_format_mime(mime))
    }

    pub fn resolve_by_ext<'a>(&'a self, ext: &str) -> Option<&'a dyn DecoderPlugin> {
        self.plugins
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.our_format_ext(ext))
    }

    /// For streams: try MIME if known, then each plugin's `can_decode` in
    /// registration order against the first peeked bytes.
    pub fn resolve_by_sniff<'a>(&'a self, mime: Option<&str>, peeked: &[u8]) -> Option<&'a dyn DecoderPlugin> {
        if let Some(mime) = mime {
            if let Some(p) = self.resolve_by_mime(mime) {
                return Some(p);
            }
        }
        self.plugins
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.can_decode(peeked))
    }

    /// Resolves a local file path: extension first (MIME sniffing from a
    /// file's bytes is only attempted for streams per spec §4.4).
    pub fn resolve_for_path<'a>(&'a self, path: &camino::Utf8Path) -> Option<&'a dyn DecoderPlugin> {
        let ext = file_extension(path)?;
        self.resolve_by_ext(ext)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// `true` for `http://`/`https://` targets, which must go through
/// [`open`]'s streaming path instead of a local-file open (spec §4.3/§4.4).
pub fn is_stream_url(path: &camino::Utf8Path) -> bool {
    let s = path.as_str();
    s.starts_with("http://") || s.starts_with("https://")
}

/// Resolves and opens `path`, routing network streams through
/// `IoStream::open_http` + MIME/sniff resolution and local files through
/// the extension-based `resolve_for_path` + plugin `open`, per spec §4.4.
pub fn open(registry: &Registry, path: &camino::Utf8Path) -> Result<Box<dyn DecoderHandle>, DecoderError> {
    if is_stream_url(path) {
        let io = IoStream::open_http(path.as_str()).map_err(|e| DecoderError::Fatal(e.to_string()))?;
        let io = Arc::new(io);
        let mime = io.mime();
        let mut peek_buf = [0u8; 32];
        let peeked = io.peek(&mut peek_buf).unwrap_or(0);
        let plugin = registry
            .resolve_by_sniff(mime.as_deref(), &peek_buf[..peeked])
            .ok_or(DecoderError::NoMatchingPlugin)?;
        plugin.open_stream(io)
    } else {
        let plugin = registry
            .resolve_for_path(path)
            .ok_or(DecoderError::NoMatchingPlugin)?;
        plugin.open(path)
    }
}

/// Extension after the last `.`, ignoring a leading dot-file prefix (so
/// `.hidden` has no extension but `.hidden.mp3` does), per spec §4.4.
fn file_extension(path: &camino::Utf8Path) -> Option<&str> {
    let name = path.file_name()?;
    let name = name.strip_prefix('.').unwrap_or(name);
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_extension_skips_leading_dot_file_prefix() {
        assert_eq!(file_extension(camino::Utf8Path::new(".hidden")), None);
        assert_eq!(file_extension(camino::Utf8Path::new(".hidden.mp3")), Some("mp3"));
        assert_eq!(file_extension(camino::Utf8Path::new("track.flac")), Some("flac"));
        assert_eq!(file_extension(camino::Utf8Path::new("noext")), None);
    }

    #[test]
    fn default_registry_resolves_common_extensions() {
        let registry = Registry::with_defaults();
        for ext in ["mp3", "flac", "ogg", "wav"] {
            assert!(registry.resolve_by_ext(ext).is_some(), "expected a plugin for .{ext}");
        }
        assert!(registry.resolve_by_ext("docx").is_none());
    }

    #[test]
    fn registering_duplicate_name_is_ignored() {
        let mut registry = Registry::new();
        registry.register(Box::new(symphonia_backend::SymphoniaPlugin::new()));
        registry.register(Box::new(symphonia_backend::SymphoniaPlugin::new()));
        assert_eq!(registry.plugins.len(), 1);
    }
}
