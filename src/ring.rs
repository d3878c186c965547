//! Producer/consumer ring buffer between the decoder and the output device
//! (C1, spec §4.2). Direct port of `trunk/out_buf.c` + `buf.h`'s state
//! machine, generalized to an owned value (the C original is one process-
//! wide global `struct out_buf`) so a server process can eventually host
//! more than one.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::fifo::FifoBuffer;
use crate::format::SoundParams;
use crate::output::OutputDriver;

/// Don't hand the device more than this many bytes per `play()` call —
/// mirrors `AUDIO_MAX_PLAY_BYTES` in `out_buf.c`, which exists so a single
/// device write can't lock the reader out for too long.
const MAX_PLAY_BYTES: usize = 32 * 1024;

struct Shared {
    buf: FifoBuffer,
    paused: bool,
    stop: bool,
    exit: bool,
    reset_dev: bool,
    time_played_s: f64,
    hw_device_fill_bytes: usize,
    bytes_per_second: f64,
    reader_waiting: bool,
    mixer: u8,
    mixer_dirty: bool,
    reopen_params: Option<SoundParams>,
}

pub struct RingBuffer {
    shared: Arc<Mutex<Shared>>,
    /// Broadcast when space frees up (producer's `put` waits on this).
    ready_cond: Arc<Condvar>,
    /// Signalled when new data/flags are available (reader waits on this).
    play_cond: Arc<Condvar>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl RingBuffer {
    /// Starts the ring with its output thread. `driver` must already be
    /// open()ed by the caller (the player loop owns device-open semantics
    /// for format-change handling; the ring only ever calls `play`/`reset`).
    pub fn new(size: usize, bytes_per_second: f64, mut driver: Box<dyn OutputDriver>) -> Self {
        let initial_mixer = driver.read_mixer();
        let shared = Arc::new(Mutex::new(Shared {
            buf: FifoBuffer::new(size),
            paused: false,
            stop: false,
            exit: false,
            reset_dev: false,
            time_played_s: 0.0,
            hw_device_fill_bytes: 0,
            bytes_per_second,
            reader_waiting: false,
            mixer: initial_mixer,
            mixer_dirty: false,
            reopen_params: None,
        }));
        let ready_cond = Arc::new(Condvar::new());
        let play_cond = Arc::new(Condvar::new());

        let reader = {
            let shared = Arc::clone(&shared);
            let ready_cond = Arc::clone(&ready_cond);
            let play_cond = Arc::clone(&play_cond);
            std::thread::spawn(move || reader_loop(shared, ready_cond, play_cond, driver))
        };

        Self {
            shared,
            ready_cond,
            play_cond,
            reader: Some(reader),
        }
    }

    /// Block until there is space, write as much as fits, repeat until all
    /// of `data` lands in the buffer. Returns `false` iff the buffer was
    /// stopped mid-wait (spec: "0 iff the buffer was stopped mid-wait").
    pub fn put(&self, data: &[u8]) -> bool {
        let mut pos = 0;
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        while pos < data.len() {
            while guard.buf.space() == 0 && !guard.stop {
                guard = self.ready_cond.wait(guard).expect("ring mutex poisoned");
            }
            if guard.stop {
                return false;
            }
            let written = guard.buf.put(&data[pos..]);
            if written > 0 {
                pos += written;
                self.play_cond.notify_one();
            }
        }
        true
    }

    pub fn pause(&self) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        guard.paused = true;
        guard.reset_dev = true;
        self.play_cond.notify_one();
    }

    pub fn unpause(&self) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        guard.paused = false;
        self.play_cond.notify_one();
    }

    /// Sets stop + drops pending data, wakes the reader, then waits for it
    /// to acknowledge (fill back to 0) before returning.
    pub fn stop(&self) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        guard.stop = true;
        guard.buf.clear();
        self.play_cond.notify_one();
        self.ready_cond.notify_all();
        while !guard.reader_waiting {
            guard = self.play_cond.wait(guard).expect("ring mutex poisoned");
        }
    }

    /// May only be called when stopped; zeros fill and flags.
    pub fn reset(&self) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        debug_assert!(guard.stop, "reset() called while not stopped");
        guard.buf.clear();
        guard.stop = false;
        guard.paused = false;
        guard.reset_dev = false;
        guard.time_played_s = 0.0;
        guard.hw_device_fill_bytes = 0;
    }

    pub fn wait_until_empty(&self) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        while guard.buf.fill() != 0 {
            guard = self.ready_cond.wait(guard).expect("ring mutex poisoned");
        }
    }

    pub fn fill(&self) -> usize {
        self.shared.lock().expect("ring mutex poisoned").buf.fill()
    }

    pub fn size(&self) -> usize {
        self.shared.lock().expect("ring mutex poisoned").buf.size()
    }

    /// Time actually audible: `time_played_s - hw_device_fill_bytes/bps`,
    /// so the UI doesn't display samples that are still sitting in the
    /// hardware FIFO (spec §4.2 step 6).
    pub fn time_played(&self) -> f64 {
        let guard = self.shared.lock().expect("ring mutex poisoned");
        if guard.bytes_per_second <= 0.0 {
            return guard.time_played_s;
        }
        let audible_lag = guard.hw_device_fill_bytes as f64 / guard.bytes_per_second;
        (guard.time_played_s - audible_lag).max(0.0)
    }

    pub fn set_bytes_per_second(&self, bps: f64) {
        self.shared.lock().expect("ring mutex poisoned").bytes_per_second = bps;
    }

    pub fn reset_time(&self) {
        self.shared.lock().expect("ring mutex poisoned").time_played_s = 0.0;
    }

    /// Queues a mixer level for the reader thread to push to the real
    /// device; `read_mixer` serves the cached value so callers never block
    /// on the reader's own lock-step timing.
    pub fn set_mixer(&self, value: u8) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        guard.mixer = value;
        guard.mixer_dirty = true;
        self.play_cond.notify_one();
    }

    pub fn read_mixer(&self) -> u8 {
        self.shared.lock().expect("ring mutex poisoned").mixer
    }

    /// Requests the reader thread close and reopen the device with new
    /// parameters, e.g. after the decoder's negotiated format changes
    /// mid-track (spec §4.6).
    pub fn request_reopen(&self, params: SoundParams) {
        let mut guard = self.shared.lock().expect("ring mutex poisoned");
        guard.reopen_params = Some(params);
        guard.bytes_per_second = params.bytes_per_second() as f64;
        self.play_cond.notify_one();
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.lock().expect("ring mutex poisoned");
            guard.exit = true;
            self.play_cond.notify_one();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(
    shared: Arc<Mutex<Shared>>,
    ready_cond: Arc<Condvar>,
    play_cond: Arc<Condvar>,
    mut driver: Box<dyn OutputDriver>,
) {
    loop {
        let mut guard = shared.lock().expect("ring mutex poisoned");

        if let Some(params) = guard.reopen_params.take() {
            driver.close();
            if let Err(e) = driver.open(params) {
                tracing::error!(error = %e, params = %params, "failed to reopen device with new format");
            }
            guard.mixer_dirty = true;
        }

        if guard.mixer_dirty {
            driver.set_mixer(guard.mixer);
            guard.mixer_dirty = false;
        }

        if guard.reset_dev {
            driver.reset();
            guard.reset_dev = false;
        }

        if guard.stop {
            guard.buf.clear();
        }

        if guard.buf.fill() == 0 {
            guard.reader_waiting = true;
        }

        ready_cond.notify_all();
        play_cond.notify_all(); // acks `stop()`'s waiter

        while (guard.buf.fill() == 0 || guard.paused || guard.stop) && !guard.exit {
            guard = play_cond.wait(guard).expect("ring mutex poisoned");
        }
        guard.reader_waiting = false;

        if guard.buf.fill() == 0 {
            if guard.exit {
                return;
            }
            continue;
        }
        if guard.paused || guard.stop {
            continue;
        }

        let chunk_len = guard
            .buf
            .contig_fill()
            .min((guard.bytes_per_second * 0.1) as usize)
            .min(MAX_PLAY_BYTES)
            .max(1);
        let mut local = vec![0u8; chunk_len];
        let got = guard.buf.peek(&mut local);
        local.truncate(got);
        drop(guard);

        let played = match driver.play(&local) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "device write failed, resetting");
                driver.reset();
                0
            }
        };

        let mut guard = shared.lock().expect("ring mutex poisoned");
        if played > 0 {
            let mut discard = vec![0u8; played];
            guard.buf.get(&mut discard);
            if guard.bytes_per_second > 0.0 {
                guard.time_played_s += played as f64 / guard.bytes_per_second;
            }
        }
        guard.hw_device_fill_bytes = driver.get_buff_fill();
        ready_cond.notify_all();
    }
}

pub fn sleep_briefly() {
    std::thread::sleep(Duration::from_millis(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BaseFormat, Endian, SampleFormat, SoundParams};
    use crate::output::null_backend::NullDriver;

    fn params() -> SoundParams {
        SoundParams {
            format: SampleFormat::new(BaseFormat::S16, Endian::Native),
            channels: 2,
            rate: 44100,
        }
    }

    fn opened_null() -> Box<dyn OutputDriver> {
        let mut d = NullDriver::new();
        d.init().unwrap();
        d.open(params()).unwrap();
        Box::new(d)
    }

    #[test]
    fn fill_never_exceeds_size() {
        let ring = RingBuffer::new(256, params().bytes_per_second() as f64, opened_null());
        assert!(ring.put(&vec![0u8; 4096]));
        assert!(ring.fill() <= ring.size());
    }

    #[test]
    fn stop_unblocks_producer_and_drains_fill() {
        // A tiny buffer against a huge payload guarantees many lock
        // round-trips in the producer, giving `stop()` a wide window to
        // land while `put()` is still mid-flight.
        let ring = Arc::new(RingBuffer::new(8, params().bytes_per_second() as f64, opened_null()));
        let ring2 = Arc::clone(&ring);
        let handle = std::thread::spawn(move || ring2.put(&vec![1u8; 200_000_000]));
        ring.stop();
        // the blocked put() should observe stop and return false
        let accepted = handle.join().unwrap();
        assert!(!accepted);
        assert_eq!(ring.fill(), 0);
    }

    #[test]
    fn reset_after_stop_clears_flags() {
        let ring = RingBuffer::new(64, params().bytes_per_second() as f64, opened_null());
        ring.put(&[1, 2, 3]);
        ring.stop();
        ring.reset();
        assert!(ring.put(&[4, 5, 6]));
    }
}
