//! Precache worker (spec §4.8): decodes the head of the next track ahead
//! of time so a gapless transition doesn't stall on disk/codec latency.
//! Single-slot; starting a new precache implicitly waits for any
//! in-flight one, mirroring the one-thread-at-a-time contract MOC's
//! `precache` state machine enforces.

use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use crate::decoder::{DecoderHandle, Registry};
use crate::format::SoundParams;

/// Decode up to this many bytes ahead, matching spec §4.8's "≈2 ×
/// PCM_BUF_SIZE" threshold.
const PRECACHE_THRESHOLD_BYTES: usize = 2 * 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecacheState {
    Idle,
    Running,
    Ready,
    Failed,
}

pub struct PrecacheResult {
    pub handle: Box<dyn DecoderHandle>,
    pub sound_params: SoundParams,
    pub pcm: Vec<u8>,
}

struct Shared {
    state: PrecacheState,
    file: Option<Utf8PathBuf>,
    result: Option<PrecacheResult>,
}

pub struct Precache {
    shared: Arc<Mutex<Shared>>,
    registry: Arc<Registry>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Precache {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: PrecacheState::Idle,
                file: None,
                result: None,
            })),
            registry,
            worker: None,
        }
    }

    pub fn state(&self) -> PrecacheState {
        self.shared.lock().expect("precache mutex poisoned").state
    }

    /// Starts precaching `path`, waiting for any previous worker to
    /// finish first (spec: "starting a new one implicitly waits for the
    /// previous").
    pub fn start(&mut self, path: Utf8PathBuf) {
        self.join_previous();

        {
            let mut guard = self.shared.lock().expect("precache mutex poisoned");
            guard.state = PrecacheState::Running;
            guard.file = Some(path.clone());
            guard.result = None;
        }

        let shared = Arc::clone(&self.shared);
        let registry = Arc::clone(&self.registry);
        self.worker = Some(std::thread::spawn(move || run(shared, registry, path)));
    }

    fn join_previous(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Waits for the in-flight precache (if any) then, if it matches
    /// `expected_file` and succeeded, returns the decoder handle and
    /// primed PCM so the player loop can skip a reopen (spec §4.8 step 2).
    pub fn take_if_matches(&mut self, expected_file: &camino::Utf8Path) -> Option<PrecacheResult> {
        self.join_previous();
        let mut guard = self.shared.lock().expect("precache mutex poisoned");
        if guard.state != PrecacheState::Ready {
            return None;
        }
        if guard.file.as_deref() != Some(expected_file) {
            return None;
        }
        guard.state = PrecacheState::Idle;
        guard.result.take()
    }
}

impl Drop for Precache {
    fn drop(&mut self) {
        self.join_previous();
    }
}

fn run(shared: Arc<Mutex<Shared>>, registry: Arc<Registry>, path: Utf8PathBuf) {
    let outcome = (|| -> color_eyre::Result<PrecacheResult> {
        let mut handle = crate::decoder::open(&registry, &path)?;

        let mut pcm = Vec::new();
        let mut sound_params = SoundParams {
            format: crate::format::SampleFormat::new(crate::format::BaseFormat::S16, crate::format::Endian::Native),
            channels: 2,
            rate: 44100,
        };
        let mut chunk = vec![0u8; 32 * 1024];
        while pcm.len() < PRECACHE_THRESHOLD_BYTES {
            let n = handle.decode(&mut chunk, &mut sound_params)?;
            if n == 0 {
                break;
            }
            pcm.extend_from_slice(&chunk[..n]);
        }

        Ok(PrecacheResult { handle, sound_params, pcm })
    })();

    let mut guard = shared.lock().expect("precache mutex poisoned");
    match outcome {
        Ok(result) => {
            guard.result = Some(result);
            guard.state = PrecacheState::Ready;
        }
        Err(e) => {
            tracing::warn!(error = %e, file = %path, "precache failed");
            guard.state = PrecacheState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_precache_has_no_result_for_any_file() {
        let mut p = Precache::new(Arc::new(Registry::with_defaults()));
        assert_eq!(p.state(), PrecacheState::Idle);
        assert!(p.take_if_matches(camino::Utf8Path::new("/nope.mp3")).is_none());
    }

    #[test]
    fn precaching_a_missing_file_ends_in_failed_state() {
        let mut p = Precache::new(Arc::new(Registry::with_defaults()));
        p.start(Utf8PathBuf::from("/definitely/missing.flac"));
        p.join_previous();
        assert_eq!(p.state(), PrecacheState::Failed);
    }

    #[test]
    fn starting_a_new_precache_waits_for_the_previous_one() {
        let mut p = Precache::new(Arc::new(Registry::with_defaults()));
        p.start(Utf8PathBuf::from("/missing/one.mp3"));
        p.start(Utf8PathBuf::from("/missing/two.mp3"));
        p.join_previous();
        assert_eq!(p.state(), PrecacheState::Failed);
    }
}
