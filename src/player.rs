//! Player loop (C7, spec §4.7). Direct port of `trunk/player.c`'s main
//! loop: pulls frames from an already-open decoder, feeds the ring,
//! serves seek/stop requests posted from another thread through a
//! condition variable, and publishes bitrate/tag changes.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8Path;

use crate::convert::StreamResampler;
use crate::decoder::{DecoderHandle, Registry};
use crate::error::DecoderError;
use crate::format::SoundParams;
use crate::output::OutputDriver;
use crate::precache::Precache;
use crate::ring::RingBuffer;
use crate::tags_cache::{Tags, TagsCache};

const DECODE_CHUNK_BYTES: usize = 32 * 1024;
const BITRATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
/// Frames per resample call; `rubato::FftFixedIn` wants a fixed input size.
const RESAMPLE_CHUNK_FRAMES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Nothing,
    Seek,
    Stop,
    Pause,
    Unpause,
}

struct RequestShared {
    request: Request,
    seek_delta_secs: f64,
}

/// Cross-thread handle used by the controller to post seek/stop requests
/// into a running player loop.
pub struct PlayerControl {
    shared: Mutex<RequestShared>,
    cond: Condvar,
}

impl PlayerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(RequestShared { request: Request::Nothing, seek_delta_secs: 0.0 }),
            cond: Condvar::new(),
        })
    }

    pub fn request_seek(&self, delta_secs: f64) {
        let mut guard = self.shared.lock().expect("player request mutex poisoned");
        guard.request = Request::Seek;
        guard.seek_delta_secs = delta_secs;
        self.cond.notify_all();
    }

    pub fn request_stop(&self) {
        let mut guard = self.shared.lock().expect("player request mutex poisoned");
        guard.request = Request::Stop;
        self.cond.notify_all();
    }

    pub fn request_pause(&self) {
        let mut guard = self.shared.lock().expect("player request mutex poisoned");
        guard.request = Request::Pause;
        self.cond.notify_all();
    }

    pub fn request_unpause(&self) {
        let mut guard = self.shared.lock().expect("player request mutex poisoned");
        guard.request = Request::Unpause;
        self.cond.notify_all();
    }

    fn take(&self) -> Request {
        let mut guard = self.shared.lock().expect("player request mutex poisoned");
        std::mem::replace(&mut guard.request, Request::Nothing)
    }

    fn seek_delta(&self) -> f64 {
        self.shared.lock().expect("player request mutex poisoned").seek_delta_secs
    }
}

/// Shared "current tags" the server exposes to clients, guarded by its
/// own mutex per spec §4.7 ("The loop additionally maintains a tags
/// mutex").
pub struct CurrentTags {
    tags: Mutex<Tags>,
}

impl CurrentTags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { tags: Mutex::new(Tags::default()) })
    }

    pub fn get(&self) -> Tags {
        self.tags.lock().expect("current tags mutex poisoned").clone()
    }

    fn set(&self, tags: Tags) {
        *self.tags.lock().expect("current tags mutex poisoned") = tags;
    }
}

/// Live playback counters the server exposes for `GET_CTIME`/`GET_BITRATE`/
/// `GET_RATE`/`GET_CHANNELS`, updated by the player loop each chunk rather
/// than left as the stub `0` the protocol layer used to reply with.
pub struct CurrentStats {
    inner: Mutex<StatsInner>,
}

#[derive(Clone, Copy, Default)]
struct StatsInner {
    ctime: f64,
    bitrate: Option<u32>,
    rate: u32,
    channels: u16,
}

impl CurrentStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(StatsInner::default()) })
    }

    pub fn get(&self) -> (f64, Option<u32>, u32, u16) {
        let s = *self.inner.lock().expect("current stats mutex poisoned");
        (s.ctime, s.bitrate, s.rate, s.channels)
    }

    fn set_format(&self, rate: u32, channels: u16) {
        let mut s = self.inner.lock().expect("current stats mutex poisoned");
        s.rate = rate;
        s.channels = channels;
    }

    fn set_ctime(&self, ctime: f64) {
        self.inner.lock().expect("current stats mutex poisoned").ctime = ctime;
    }

    fn set_bitrate(&self, bitrate: u32) {
        self.inner.lock().expect("current stats mutex poisoned").bitrate = Some(bitrate);
    }

    fn reset(&self) {
        *self.inner.lock().expect("current stats mutex poisoned") = StatsInner::default();
    }
}

pub enum Transition {
    /// The track ended or was stopped; caller decides what plays next.
    Finished,
    /// Decoder could not be opened or failed fatally before producing
    /// any audio; caller should skip to another file.
    Rejected,
}

pub struct PlayerEvents {
    pub on_bitrate: Box<dyn Fn(u32) + Send>,
    pub on_tags_changed: Box<dyn Fn() + Send>,
    pub on_stream_error: Box<dyn Fn(String) + Send>,
}

/// Runs the player loop for one file to completion, per spec §4.7's
/// 8-step per-chunk algorithm. `reopen_device` is called (at least once
/// initially, and again whenever the decoder's reported `SoundParams`
/// change mid-track) to negotiate and (re)open the output device; it
/// returns the `SoundParams` the device actually ended up opened with,
/// which may differ from what was requested (channel clamping, a forced
/// sample rate). A mismatch between the decoder's native format and the
/// device's negotiated one is bridged here with `convert.rs`'s downmix and
/// resampling stages rather than left for the device to sort out.
pub fn play_file(
    path: &Utf8Path,
    next_file: Option<&Utf8Path>,
    control: &PlayerControl,
    current_tags: &CurrentTags,
    current_stats: &CurrentStats,
    ring: &RingBuffer,
    registry: &Registry,
    precache: &mut Precache,
    tags_cache: &TagsCache,
    show_stream_errors: bool,
    precache_enabled: bool,
    mut reopen_device: impl FnMut(SoundParams) -> color_eyre::Result<SoundParams>,
    events: &PlayerEvents,
) -> Transition {
    current_stats.reset();

    let (mut handle, mut sound_params, primed_pcm) = match precache.take_if_matches(path) {
        Some(result) => (result.handle, result.sound_params, Some(result.pcm)),
        None => match crate::decoder::open(registry, path) {
            Ok(h) => (
                h,
                SoundParams {
                    format: crate::format::SampleFormat::new(crate::format::BaseFormat::S16, crate::format::Endian::Native),
                    channels: 2,
                    rate: 44100,
                },
                None,
            ),
            Err(e) => {
                (events.on_stream_error)(e.to_string());
                return Transition::Rejected;
            }
        },
    };

    let mut device_params = match reopen_device(sound_params) {
        Ok(p) => p,
        Err(e) => {
            (events.on_stream_error)(e.to_string());
            return Transition::Rejected;
        }
    };
    let mut requested_params = sound_params;
    current_stats.set_format(device_params.rate, device_params.channels);
    let mut resampler: Option<StreamResampler> = None;

    if let Some(tags) = tags_cache.get_immediate(path, crate::decoder::TagsWhich::ALL) {
        current_tags.set(tags);
        (events.on_tags_changed)();
    }

    if let Some(pcm) = primed_pcm {
        let converted = convert_chunk(&pcm, sound_params, device_params, &mut resampler, events);
        if !converted.is_empty() && !ring.put(&converted) {
            return Transition::Finished;
        }
    }

    let mut chunk = vec![0u8; DECODE_CHUNK_BYTES];
    let mut last_bitrate_emit = Instant::now() - BITRATE_PUBLISH_INTERVAL;
    let mut last_bitrate = None;
    let mut precache_started = false;

    loop {
        // Step 1: serve a pending request before decoding more.
        match control.take() {
            Request::Stop => {
                ring.stop();
                return Transition::Finished;
            }
            Request::Seek => {
                let delta = control.seek_delta();
                let current = ring.time_played();
                if let Some(new_pos) = handle.seek(current + delta) {
                    ring.stop();
                    ring.reset();
                    ring.reset_time();
                    let _ = new_pos;
                }
                // A failed seek is simply consumed, per spec §4.7.
            }
            Request::Pause => ring.pause(),
            Request::Unpause => ring.unpause(),
            Request::Nothing => {}
        }

        // Step 2: decode up to 32 KiB.
        let decoded = handle.decode(&mut chunk, &mut sound_params);
        let n = match decoded {
            Ok(n) => n,
            Err(DecoderError::Stream(msg)) => {
                if show_stream_errors {
                    (events.on_stream_error)(msg);
                }
                continue;
            }
            Err(DecoderError::Fatal(_)) | Err(DecoderError::NoMatchingPlugin) => {
                break;
            }
        };

        // Step 3: the decoder's native format can change mid-stream
        // (chained Ogg, VBR re-negotiation); renegotiate and reopen when
        // it does rather than silently mis-rendering.
        if sound_params != requested_params {
            match reopen_device(sound_params) {
                Ok(p) => {
                    device_params = p;
                    requested_params = sound_params;
                    resampler = None;
                    current_stats.set_format(device_params.rate, device_params.channels);
                }
                Err(e) => {
                    (events.on_stream_error)(e.to_string());
                    break;
                }
            }
        }

        // Step 4: bitrate, rate-limited to at most 1 event/s.
        if let Some(bitrate) = handle.get_bitrate() {
            current_stats.set_bitrate(bitrate);
            if Some(bitrate) != last_bitrate && last_bitrate_emit.elapsed() >= BITRATE_PUBLISH_INTERVAL {
                (events.on_bitrate)(bitrate);
                last_bitrate = Some(bitrate);
                last_bitrate_emit = Instant::now();
            }
        }

        // Step 5: decoder-side tag changes (e.g. ICY titles).
        if let Some(tags) = handle.current_tags() {
            current_tags.set(tags);
            (events.on_tags_changed)();
        }

        if n == 0 {
            // Step 7: EOF — maybe kick off precaching the next file.
            if let Some(next) = next_file {
                if precache_enabled && !precache_started {
                    precache.start(next.to_owned());
                    precache_started = true;
                }
            }
            // Step 8: EOF + ring empty -> done.
            ring.wait_until_empty();
            break;
        }

        current_stats.set_ctime(ring.time_played());

        let converted = convert_chunk(&chunk[..n], sound_params, device_params, &mut resampler, events);
        if !converted.is_empty() && !ring.put(&converted) {
            // stop() landed mid-put.
            return Transition::Finished;
        }
    }

    Transition::Finished
}

/// Bridges the decoder's native `sound_params` to whatever the device was
/// actually negotiated/opened at: downmix to mono when the device only
/// has one channel, then resample when the rates drift by more than the
/// spec's 5% threshold. A no-op copy when both already match.
fn convert_chunk(
    pcm: &[u8],
    sound_params: SoundParams,
    device_params: SoundParams,
    resampler: &mut Option<StreamResampler>,
    events: &PlayerEvents,
) -> Vec<u8> {
    let raw: &[f32] = bytemuck::cast_slice(pcm);

    let mut samples = if sound_params.channels != device_params.channels && device_params.channels == 1 {
        crate::convert::downmix_to_mono(raw, sound_params.channels)
    } else {
        raw.to_vec()
    };

    if crate::convert::needs_resample(sound_params.rate, device_params.rate) {
        if resampler.is_none() {
            match StreamResampler::new(sound_params.rate, device_params.rate, device_params.channels, RESAMPLE_CHUNK_FRAMES) {
                Ok(r) => *resampler = Some(r),
                Err(e) => {
                    (events.on_stream_error)(e.to_string());
                    return Vec::new();
                }
            }
        }
        samples = match resampler.as_mut().unwrap().push(&samples) {
            Ok(out) => out,
            Err(e) => {
                (events.on_stream_error)(e.to_string());
                Vec::new()
            }
        };
    } else {
        *resampler = None;
    }

    bytemuck::cast_slice(&samples).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Registry;
    use crate::format::{BaseFormat, Endian, SampleFormat};
    use crate::output::null_backend::NullDriver;
    use crate::output::OutputDriver;
    use std::sync::Arc as StdArc;

    fn noop_events() -> PlayerEvents {
        PlayerEvents {
            on_bitrate: Box::new(|_| {}),
            on_tags_changed: Box::new(|| {}),
            on_stream_error: Box::new(|_| {}),
        }
    }

    #[test]
    fn missing_file_is_rejected_without_panicking() {
        let control = PlayerControl::new();
        let current_tags = CurrentTags::new();
        let current_stats = CurrentStats::new();
        let params = SoundParams {
            format: SampleFormat::new(BaseFormat::S16, Endian::Native),
            channels: 2,
            rate: 44100,
        };
        let mut driver: Box<dyn OutputDriver> = Box::new(NullDriver::new());
        driver.init().unwrap();
        driver.open(params).unwrap();
        let ring = RingBuffer::new(4096, params.bytes_per_second() as f64, driver);

        let registry = Registry::with_defaults();
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let tags_cache = crate::tags_cache::TagsCache::open(cache_dir, 10, StdArc::new(Registry::with_defaults())).unwrap();
        let mut precache = Precache::new(StdArc::new(Registry::with_defaults()));

        let result = play_file(
            camino::Utf8Path::new("/no/such/file.mp3"),
            None,
            &control,
            &current_tags,
            &current_stats,
            &ring,
            &registry,
            &mut precache,
            &tags_cache,
            true,
            false,
            |p| Ok(p),
            &noop_events(),
        );
        assert!(matches!(result, Transition::Rejected));
    }

    #[test]
    fn request_seek_and_stop_round_trip_through_control() {
        let control = PlayerControl::new();
        assert_eq!(control.take(), Request::Nothing);
        control.request_seek(5.0);
        assert_eq!(control.take(), Request::Seek);
        assert_eq!(control.seek_delta(), 5.0);
        control.request_stop();
        assert_eq!(control.take(), Request::Stop);
    }
}
