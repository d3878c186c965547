//! Audio controller (C10, spec §4.12). Owns the authoritative playlist
//! and its shuffled mirror, the currently playing index, transport
//! state, and the play-thread lifecycle.

use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Options;
use crate::decoder::Registry;
use crate::output::OutputDriver;
use crate::player::{play_file, CurrentStats, CurrentTags, PlayerControl, PlayerEvents, Transition};
use crate::playlist::Playlist;
use crate::precache::Precache;
use crate::protocol::PlayerState;
use crate::ring::RingBuffer;
use crate::tags_cache::TagsCache;

/// Default mixer level for a freshly started controller, per spec §4.5.
const DEFAULT_MIXER: u8 = 100;

/// Why the play thread's previous track ended, used to pick the next
/// index per spec §4.12's transition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GoTo {
    PlayPrev,
    PlayNext,
    Natural,
}

struct State {
    current_index: Option<usize>,
    player_state: PlayerState,
    pending_goto: Option<GoTo>,
    stop_requested: bool,
}

pub struct Controller {
    playlist: Mutex<Playlist>,
    shuffled: Mutex<Playlist>,
    state: Mutex<State>,
    options: Mutex<Options>,
    control: Arc<PlayerControl>,
    current_tags: Arc<CurrentTags>,
    current_stats: Arc<CurrentStats>,
    registry: Arc<Registry>,
    tags_cache: Arc<TagsCache>,
    play_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    make_driver: Box<dyn Fn() -> color_eyre::Result<Box<dyn OutputDriver>> + Send + Sync>,
    events: ControllerEvents,
    /// The playing track's live ring handle, so `get_mixer`/`set_mixer`
    /// and pause/unpause can reach the device the play thread owns
    /// instead of only flipping the reported `PlayerState`.
    current_ring: Mutex<Option<Arc<RingBuffer>>>,
    /// Mixer level persisted across tracks (and while stopped), applied to
    /// each new ring as it's created.
    last_mixer: Mutex<u8>,
}

#[derive(Clone)]
pub struct ControllerEvents {
    pub on_state: Arc<dyn Fn(PlayerState) + Send + Sync>,
    pub on_bitrate: Arc<dyn Fn(u32) + Send + Sync>,
    /// Carries the tags that just changed so a listener can fan them out
    /// without a back-reference to the controller.
    pub on_tags_changed: Arc<dyn Fn(crate::tags_cache::Tags) + Send + Sync>,
    pub on_error: Arc<dyn Fn(String) + Send + Sync>,
}

impl Controller {
    pub fn new(
        registry: Arc<Registry>,
        tags_cache: Arc<TagsCache>,
        options: Options,
        make_driver: impl Fn() -> color_eyre::Result<Box<dyn OutputDriver>> + Send + Sync + 'static,
        events: ControllerEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            playlist: Mutex::new(Playlist::new()),
            shuffled: Mutex::new(Playlist::new()),
            state: Mutex::new(State {
                current_index: None,
                player_state: PlayerState::Stop,
                pending_goto: None,
                stop_requested: false,
            }),
            options: Mutex::new(options),
            control: PlayerControl::new(),
            current_tags: CurrentTags::new(),
            current_stats: CurrentStats::new(),
            registry,
            tags_cache,
            play_thread: Mutex::new(None),
            make_driver: Box::new(make_driver),
            events,
            current_ring: Mutex::new(None),
            last_mixer: Mutex::new(DEFAULT_MIXER),
        })
    }

    pub fn playlist(&self) -> std::sync::MutexGuard<'_, Playlist> {
        self.playlist.lock().expect("playlist mutex poisoned")
    }

    pub fn current_tags(&self) -> crate::tags_cache::Tags {
        self.current_tags.get()
    }

    /// Live `(ctime, bitrate, rate, channels)` for `GET_CTIME`/
    /// `GET_BITRATE`/`GET_RATE`/`GET_CHANNELS` (spec §4.11).
    pub fn current_stats(&self) -> (f64, Option<u32>, u32, u16) {
        self.current_stats.get()
    }

    pub fn tags_cache(&self) -> Arc<TagsCache> {
        Arc::clone(&self.tags_cache)
    }

    /// `GET_MIXER`: reads the live device when a track is playing,
    /// otherwise the level persisted from the last track (spec §4.5).
    pub fn get_mixer(&self) -> u8 {
        if let Some(ring) = self.current_ring.lock().expect("current ring mutex poisoned").as_ref() {
            return ring.read_mixer();
        }
        *self.last_mixer.lock().expect("last mixer mutex poisoned")
    }

    /// `SET_MIXER`: pushes to the live ring (which forwards it to the
    /// device) and persists it for the next track.
    pub fn set_mixer(&self, value: u8) {
        let value = value.min(100);
        *self.last_mixer.lock().expect("last mixer mutex poisoned") = value;
        if let Some(ring) = self.current_ring.lock().expect("current ring mutex poisoned").as_ref() {
            ring.set_mixer(value);
        }
    }

    /// `GET_OPTION`/`SET_OPTION`, restricted to the whitelist in
    /// [`Options::get_named`]/[`Options::set_named`] (spec §4.11).
    pub fn get_option(&self, name: &str) -> Option<bool> {
        self.options.lock().expect("options mutex poisoned").get_named(name)
    }

    pub fn set_option(&self, name: &str, value: bool) -> bool {
        self.options.lock().expect("options mutex poisoned").set_named(name, value)
    }

    pub fn state(&self) -> PlayerState {
        self.state.lock().expect("controller state mutex poisoned").player_state
    }

    /// `play(name)` per spec §4.12: stop, optionally reshuffle, resolve
    /// the start file, spawn the play thread.
    pub fn play(self: &Arc<Self>, name: &str) {
        self.stop_inner();

        let shuffle_enabled = self.options.lock().expect("options mutex poisoned").shuffle;
        let currently_playing = self.current_playing_path();

        let start_index = if shuffle_enabled {
            let mut shuffled = self.shuffled.lock().expect("shuffled mutex poisoned");
            *shuffled = self.playlist.lock().expect("playlist mutex poisoned").clone();
            shuffled.shuffle(currently_playing.as_deref());
            if !name.is_empty() {
                shuffled.swap_first_to(Utf8Path::new(name));
            }
            if shuffled.is_empty() { None } else { Some(0) }
        } else {
            let playlist = self.playlist.lock().expect("playlist mutex poisoned");
            if name.is_empty() {
                if playlist.is_empty() { None } else { Some(0) }
            } else {
                playlist.find_by_path(Utf8Path::new(name))
            }
        };

        let Some(start_index) = start_index else { return };

        {
            let mut state = self.state.lock().expect("controller state mutex poisoned");
            state.current_index = Some(start_index);
            state.stop_requested = false;
        }

        self.spawn_play_thread();
    }

    pub fn pause(&self) {
        self.control.request_pause();
        self.set_state(PlayerState::Pause);
    }

    pub fn unpause(&self) {
        self.control.request_unpause();
        self.set_state(PlayerState::Play);
    }

    pub fn stop(&self) {
        self.stop_inner();
    }

    fn stop_inner(&self) {
        self.control.request_stop();
        if let Some(handle) = self.play_thread.lock().expect("play thread mutex poisoned").take() {
            let _ = handle.join();
        }
        self.state.lock().expect("controller state mutex poisoned").current_index = None;
        self.set_state(PlayerState::Stop);
    }

    /// `seek(sec)` forwards to the player only when state is `Play`, per
    /// spec §4.12.
    pub fn seek(&self, delta_secs: f64) {
        if self.state() == PlayerState::Play {
            self.control.request_seek(delta_secs);
        }
    }

    pub fn next(&self) {
        self.state.lock().expect("controller state mutex poisoned").pending_goto = Some(GoTo::PlayNext);
        self.control.request_stop();
    }

    pub fn prev(&self) {
        self.state.lock().expect("controller state mutex poisoned").pending_goto = Some(GoTo::PlayPrev);
        self.control.request_stop();
    }

    fn set_state(&self, player_state: PlayerState) {
        self.state.lock().expect("controller state mutex poisoned").player_state = player_state;
        (self.events.on_state)(player_state);
    }

    fn current_playing_path(&self) -> Option<Utf8PathBuf> {
        let state = self.state.lock().expect("controller state mutex poisoned");
        let index = state.current_index?;
        let active_list = if self.options.lock().expect("options mutex poisoned").shuffle {
            self.shuffled.lock().expect("shuffled mutex poisoned")
        } else {
            self.playlist.lock().expect("playlist mutex poisoned")
        };
        active_list.get(index).map(|item| item.path.clone())
    }

    /// Spawns the play thread: while `current != None`, play the file at
    /// the current index, then apply the transition policy from spec
    /// §4.12/§6 (`play_prev`/`play_next`/`AutoNext`/`Repeat`/`Shuffle`).
    fn spawn_play_thread(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.play_thread_loop());
        *self.play_thread.lock().expect("play thread mutex poisoned") = Some(handle);
    }

    fn play_thread_loop(self: Arc<Self>) {
        loop {
            let Some(current) = self.state.lock().expect("controller state mutex poisoned").current_index else {
                return;
            };

            let shuffle_enabled = self.options.lock().expect("options mutex poisoned").shuffle;
            let (path, next_path) = {
                let active_list = if shuffle_enabled {
                    self.shuffled.lock().expect("shuffled mutex poisoned")
                } else {
                    self.playlist.lock().expect("playlist mutex poisoned")
                };
                let Some(item) = active_list.get(current) else { return };
                let path = item.path.clone();
                let next_path = active_list.next(current).and_then(|i| active_list.get(i)).map(|i| i.path.clone());
                (path, next_path)
            };

            self.set_state(PlayerState::Play);

            let mut driver = match (self.make_driver)() {
                Ok(d) => d,
                Err(e) => {
                    (self.events.on_error)(e.to_string());
                    self.set_state(PlayerState::Stop);
                    return;
                }
            };
            // Opened with a guessed format up front, negotiated against
            // the device's real capabilities, so the ring's reader thread
            // has a live device from the start; `play_file`'s
            // `reopen_device` callback negotiates again against these same
            // `caps` whenever the decoder's actual format differs, and
            // queues a real close+reopen on the ring's own driver handle.
            let guess = crate::format::SoundParams {
                format: crate::format::SampleFormat::new(crate::format::BaseFormat::S16, crate::format::Endian::Native),
                channels: 2,
                rate: 44_100,
            };
            let options = self.options.lock().expect("options mutex poisoned").clone();
            let caps = match driver.init() {
                Ok(c) => c,
                Err(e) => {
                    (self.events.on_error)(e.to_string());
                    self.set_state(PlayerState::Stop);
                    return;
                }
            };
            let initial_params = crate::convert::negotiate(guess, caps, options.force_sample_rate);
            if let Err(e) = driver.open(initial_params) {
                (self.events.on_error)(e.to_string());
                self.set_state(PlayerState::Stop);
                return;
            }
            let ring = Arc::new(RingBuffer::new(256 * 1024, initial_params.bytes_per_second() as f64, driver));
            ring.set_mixer(*self.last_mixer.lock().expect("last mixer mutex poisoned"));
            *self.current_ring.lock().expect("current ring mutex poisoned") = Some(Arc::clone(&ring));

            let mut precache = Precache::new(Arc::clone(&self.registry));
            let on_bitrate = Arc::clone(&self.events.on_bitrate);
            let on_tags_changed = Arc::clone(&self.events.on_tags_changed);
            let current_tags_for_event = Arc::clone(&self.current_tags);
            let on_error = Arc::clone(&self.events.on_error);
            let events = PlayerEvents {
                on_bitrate: Box::new(move |b| on_bitrate(b)),
                on_tags_changed: Box::new(move || on_tags_changed(current_tags_for_event.get())),
                on_stream_error: Box::new(move |msg| on_error(msg)),
            };

            let forced_rate = options.force_sample_rate;
            let reopen_ring = Arc::clone(&ring);
            let transition = play_file(
                &path,
                next_path.as_deref(),
                &self.control,
                &self.current_tags,
                &self.current_stats,
                &ring,
                &self.registry,
                &mut precache,
                &self.tags_cache,
                options.show_stream_errors,
                options.precache,
                move |params| {
                    let negotiated = crate::convert::negotiate(params, caps, forced_rate);
                    reopen_ring.request_reopen(negotiated);
                    Ok(negotiated)
                },
                &events,
            );

            *self.current_ring.lock().expect("current ring mutex poisoned") = None;

            let goto = self.state.lock().expect("controller state mutex poisoned").pending_goto.take();

            match transition {
                Transition::Finished | Transition::Rejected => {
                    let next_index = self.resolve_next_index(current, goto, &options);
                    let mut state = self.state.lock().expect("controller state mutex poisoned");
                    match next_index {
                        Some(i) => state.current_index = Some(i),
                        None => {
                            state.current_index = None;
                            drop(state);
                            self.set_state(PlayerState::Stop);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn resolve_next_index(&self, current: usize, goto: Option<GoTo>, options: &Options) -> Option<usize> {
        let shuffle_enabled = options.shuffle;
        let active_list = if shuffle_enabled {
            self.shuffled.lock().expect("shuffled mutex poisoned")
        } else {
            self.playlist.lock().expect("playlist mutex poisoned")
        };

        match goto {
            Some(GoTo::PlayPrev) => active_list.prev(current),
            Some(GoTo::PlayNext) => active_list.next(current),
            Some(GoTo::Natural) | None => {
                if !options.auto_next {
                    return None;
                }
                match active_list.next(current) {
                    Some(i) => Some(i),
                    None if options.repeat => {
                        (0..active_list.len()).find(|&i| active_list.get(i).is_some_and(|it| !it.deleted))
                    }
                    None => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Registry;
    use crate::output::null_backend::NullDriver;

    fn test_controller() -> Arc<Controller> {
        let registry = Arc::new(Registry::with_defaults());
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let tags_cache = TagsCache::open(cache_dir, 100, Arc::clone(&registry)).unwrap();
        Controller::new(
            registry,
            tags_cache,
            Options::default(),
            || Ok(Box::new(NullDriver::new()) as Box<dyn OutputDriver>),
            ControllerEvents {
                on_state: Arc::new(|_| {}),
                on_bitrate: Arc::new(|_| {}),
                on_tags_changed: Arc::new(|_| {}),
                on_error: Arc::new(|_| {}),
            },
        )
    }

    #[test]
    fn play_on_empty_playlist_is_a_no_op() {
        let controller = test_controller();
        controller.play("");
        assert_eq!(controller.state(), PlayerState::Stop);
    }

    #[test]
    fn seek_while_stopped_does_not_panic() {
        let controller = test_controller();
        controller.seek(5.0);
    }
}
