//! Unified I/O stream abstraction over files, mmap, and HTTP (C3, spec
//! §4.3). Port of `trunk/io.c`/`io.h`: same source-kind union, same
//! cooperative abort flag; buffered mode is layered on top as
//! [`BufferedIoStream`], mirroring `io_open(..., buffered=1)` spawning a
//! prefetch thread with its own FIFO.

pub mod icy;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use camino::Utf8Path;

use crate::error::IoError;
use crate::fifo::FifoBuffer;

/// Default prefetch buffer size for buffered streams, matching the
/// `InputBuffer` config option name from the C original.
pub const DEFAULT_PREFETCH_BYTES: usize = 512 * 1024;

enum Source {
    Fd(File),
    Mmap {
        mmap: memmap2::Mmap,
        pos: usize,
    },
    Http {
        reader: Box<dyn Read + Send>,
        icy_meta_interval: Option<usize>,
        icy_bytes_until_meta: usize,
        mime: Option<String>,
        current_title: Option<String>,
        current_url: Option<String>,
    },
}

/// A single, unbuffered I/O source. Random-access sources (`Fd`, `Mmap`)
/// support `seek`; `Http` does not (spec: HTTP streams are sequential).
pub struct IoStream {
    source: Mutex<Source>,
    pos: Mutex<u64>,
    size: Option<u64>,
    eof: AtomicBool,
    abort: Arc<AtomicBool>,
}

impl IoStream {
    /// Opens a local file. Uses mmap when `prefer_mmap` is set and the
    /// file's length is known, otherwise a plain fd, per spec §4.3.
    pub fn open_file(path: &Utf8Path, prefer_mmap: bool) -> color_eyre::Result<Self> {
        let file = File::open(path).map_err(|e| IoError::Fatal(e.to_string()))?;
        let size = file.metadata().ok().map(|m| m.len());

        let source = if prefer_mmap && size.is_some() {
            // SAFETY: the file is not expected to be truncated concurrently
            // with playback; same assumption the C original makes for its
            // mmap source.
            let mmap = unsafe { memmap2::Mmap::map(&file) }
                .map_err(|e| IoError::Fatal(e.to_string()))?;
            Source::Mmap { mmap, pos: 0 }
        } else {
            Source::Fd(file)
        };

        Ok(Self::from_source(source, size))
    }

    pub fn open_http(url: &str) -> color_eyre::Result<Self> {
        let agent = ureq::AgentBuilder::new().build();
        let mut response = agent.get(url).set("Icy-MetaData", "1").call();
        // Follow redirects the way `ureq` already does internally; only the
        // final response's Content-Type is retained (spec §4.3).
        let response = loop {
            match response {
                Ok(r) => break r,
                Err(ureq::Error::Status(code, r)) if (300..400).contains(&code) => {
                    let Some(location) = r.header("location").map(str::to_owned) else {
                        return Err(IoError::Fatal(format!("redirect with no Location: {code}")).into());
                    };
                    response = agent.get(&location).set("Icy-MetaData", "1").call();
                }
                Err(e) => return Err(IoError::Fatal(e.to_string()).into()),
            }
        };

        let icy_meta_interval = response
            .header("icy-metaint")
            .and_then(|v| v.parse::<usize>().ok());
        let mime = response.header("content-type").map(str::to_owned);

        let reader: Box<dyn Read + Send> = Box::new(response.into_reader());
        let source = Source::Http {
            reader,
            icy_meta_interval,
            icy_bytes_until_meta: icy_meta_interval.unwrap_or(usize::MAX),
            mime,
            current_title: None,
            current_url: None,
        };
        Ok(Self::from_source(source, None))
    }

    fn from_source(source: Source, size: Option<u64>) -> Self {
        Self {
            source: Mutex::new(source),
            pos: Mutex::new(0),
            size,
            eof: AtomicBool::new(false),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn file_size(&self) -> Option<u64> {
        self.size
    }

    pub fn tell(&self) -> u64 {
        *self.pos.lock().expect("io pos mutex poisoned")
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn seek(&self, offset: i64, whence: SeekFrom) -> color_eyre::Result<u64> {
        let mut source = self.source.lock().expect("io source mutex poisoned");
        let mut pos = self.pos.lock().expect("io pos mutex poisoned");
        let new_pos = match &mut *source {
            Source::Fd(f) => f
                .seek(resolve_seek(*pos, offset, whence))
                .map_err(|e| IoError::Fatal(e.to_string()))?,
            Source::Mmap { mmap, pos: mpos } => {
                let target = match whence {
                    SeekFrom::Start(o) => o as i64,
                    SeekFrom::Current(_) => *pos as i64 + offset,
                    SeekFrom::End(_) => mmap.len() as i64 + offset,
                };
                *mpos = target.clamp(0, mmap.len() as i64) as usize;
                *mpos as u64
            }
            Source::Http { .. } => {
                return Err(IoError::Fatal("seeking is not supported on HTTP streams".into()).into());
            }
        };
        *pos = new_pos;
        self.eof.store(false, Ordering::SeqCst);
        Ok(new_pos)
    }

    /// Reads up to `out.len()` bytes, honouring `abort`.
    pub fn read(&self, out: &mut [u8]) -> color_eyre::Result<usize> {
        if self.aborted() {
            return Err(IoError::Aborted.into());
        }
        let mut source = self.source.lock().expect("io source mutex poisoned");
        let mut pos = self.pos.lock().expect("io pos mutex poisoned");
        let n = match &mut *source {
            Source::Fd(f) => f.read(out).map_err(|e| IoError::Transient(e.to_string()))?,
            Source::Mmap { mmap, pos: mpos } => {
                let avail = mmap.len().saturating_sub(*mpos);
                let n = avail.min(out.len());
                out[..n].copy_from_slice(&mmap[*mpos..*mpos + n]);
                *mpos += n;
                n
            }
            Source::Http {
                reader,
                icy_meta_interval,
                icy_bytes_until_meta,
                current_title,
                current_url,
                ..
            } => read_icy_aware(
                reader.as_mut(),
                out,
                icy_meta_interval,
                icy_bytes_until_meta,
                current_title,
                current_url,
            )
            .map_err(|e| IoError::Transient(e.to_string()))?,
        };
        *pos += n as u64;
        if n == 0 {
            self.eof.store(true, Ordering::SeqCst);
        }
        Ok(n)
    }

    /// Non-destructive read, used for content-sniffing a freshly opened
    /// stream (spec §4.4's resolution step 3). Only meaningful before any
    /// "real" reads have consumed the stream.
    pub fn peek(&self, out: &mut [u8]) -> color_eyre::Result<usize> {
        let before = self.tell();
        let n = self.read(out)?;
        if n > 0 {
            let _ = self.seek(before as i64, SeekFrom::Start(0));
        }
        Ok(n)
    }

    pub fn icy_title(&self) -> Option<String> {
        match &*self.source.lock().expect("io source mutex poisoned") {
            Source::Http { current_title, .. } => current_title.clone(),
            _ => None,
        }
    }

    pub fn icy_url(&self) -> Option<String> {
        match &*self.source.lock().expect("io source mutex poisoned") {
            Source::Http { current_url, .. } => current_url.clone(),
            _ => None,
        }
    }

    pub fn mime(&self) -> Option<String> {
        match &*self.source.lock().expect("io source mutex poisoned") {
            Source::Http { mime, .. } => mime.clone(),
            _ => None,
        }
    }
}

fn resolve_seek(_current_pos: u64, offset: i64, whence: SeekFrom) -> SeekFrom {
    // Spec §9 open question: `io_seek` in the original mixed up `mem_pos`
    // vs `pos` across branches; we treat `pos` (the file-descriptor's own
    // notion of position, which `std::fs::File::seek` already tracks) as
    // authoritative and never re-derive it from a second field.
    match whence {
        SeekFrom::Current(_) => SeekFrom::Current(offset),
        other => other,
    }
}

fn read_icy_aware(
    reader: &mut dyn Read,
    out: &mut [u8],
    icy_meta_interval: &Option<usize>,
    icy_bytes_until_meta: &mut usize,
    current_title: &mut Option<String>,
    current_url: &mut Option<String>,
) -> std::io::Result<usize> {
    let Some(interval) = icy_meta_interval else {
        return reader.read(out);
    };

    let want = out.len().min(*icy_bytes_until_meta);
    let n = if want == 0 { 0 } else { reader.read(&mut out[..want])? };
    *icy_bytes_until_meta -= n;

    if *icy_bytes_until_meta == 0 && n > 0 {
        let mut len_byte = [0u8; 1];
        if reader.read_exact(&mut len_byte).is_ok() {
            let meta_len = len_byte[0] as usize * 16;
            if meta_len > 0 {
                let mut meta = vec![0u8; meta_len];
                if reader.read_exact(&mut meta).is_ok() {
                    let (title, url) = icy::parse_metadata(&meta);
                    if title.is_some() {
                        *current_title = title;
                    }
                    if url.is_some() {
                        *current_url = url;
                    }
                }
            }
        }
        *icy_bytes_until_meta = *interval;
    }

    Ok(n)
}

struct PrefetchShared {
    buf: FifoBuffer,
    eof: bool,
    stop_thread: bool,
    /// Set by `seek`, consumed by the prefetch thread: discard the FIFO and
    /// restart reading from this absolute offset.
    restart_from: Option<u64>,
}

/// Wraps an [`IoStream`] with a background prefetch thread and its own
/// FIFO, the way `io_open(..., buffered=1)` does in the C original. Used
/// for local files and network streams where decode-ahead smooths over
/// scheduling jitter and slow network reads.
pub struct BufferedIoStream {
    inner: Arc<IoStream>,
    shared: Arc<Mutex<PrefetchShared>>,
    fill_cond: Arc<Condvar>,
    free_cond: Arc<Condvar>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BufferedIoStream {
    pub fn new(inner: IoStream, buffer_size: usize) -> Self {
        let inner = Arc::new(inner);
        let shared = Arc::new(Mutex::new(PrefetchShared {
            buf: FifoBuffer::new(buffer_size),
            eof: false,
            stop_thread: false,
            restart_from: None,
        }));
        let fill_cond = Arc::new(Condvar::new());
        let free_cond = Arc::new(Condvar::new());

        let handle = {
            let inner = Arc::clone(&inner);
            let shared = Arc::clone(&shared);
            let fill_cond = Arc::clone(&fill_cond);
            let free_cond = Arc::clone(&free_cond);
            std::thread::spawn(move || prefetch_loop(inner, shared, fill_cond, free_cond))
        };

        Self {
            inner,
            shared,
            fill_cond,
            free_cond,
            handle: Some(handle),
        }
    }

    pub fn read(&self, out: &mut [u8]) -> color_eyre::Result<usize> {
        let mut guard = self.shared.lock().expect("prefetch mutex poisoned");
        while guard.buf.fill() == 0 && !guard.eof {
            guard = self.fill_cond.wait(guard).expect("prefetch mutex poisoned");
        }
        let n = guard.buf.get(out);
        if n > 0 {
            self.free_cond.notify_one();
        }
        Ok(n)
    }

    /// Tells the prefetcher to discard what it has and restart from
    /// `offset`; sticky EOF is cleared, matching spec §4.3.
    pub fn seek(&self, offset: u64) {
        let mut guard = self.shared.lock().expect("prefetch mutex poisoned");
        guard.buf.clear();
        guard.eof = false;
        guard.restart_from = Some(offset);
        self.free_cond.notify_one();
    }

    pub fn eof(&self) -> bool {
        let guard = self.shared.lock().expect("prefetch mutex poisoned");
        guard.eof && guard.buf.fill() == 0
    }

    pub fn abort(&self) {
        self.inner.abort();
        self.shared.lock().expect("prefetch mutex poisoned").stop_thread = true;
        self.free_cond.notify_one();
        self.fill_cond.notify_one();
    }
}

impl Drop for BufferedIoStream {
    fn drop(&mut self) {
        self.abort();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn prefetch_loop(
    inner: Arc<IoStream>,
    shared: Arc<Mutex<PrefetchShared>>,
    fill_cond: Arc<Condvar>,
    free_cond: Arc<Condvar>,
) {
    let mut scratch = vec![0u8; 32 * 1024];
    loop {
        let restart = {
            let mut guard = shared.lock().expect("prefetch mutex poisoned");
            while guard.buf.space() == 0 && !guard.stop_thread && guard.restart_from.is_none() {
                guard = free_cond.wait(guard).expect("prefetch mutex poisoned");
            }
            if guard.stop_thread {
                return;
            }
            guard.restart_from.take()
        };

        if let Some(offset) = restart {
            if inner.seek(offset as i64, SeekFrom::Start(0)).is_err() {
                let mut guard = shared.lock().expect("prefetch mutex poisoned");
                guard.eof = true;
                fill_cond.notify_all();
                continue;
            }
        }

        let n = match inner.read(&mut scratch) {
            Ok(n) => n,
            Err(_) => {
                let mut guard = shared.lock().expect("prefetch mutex poisoned");
                guard.eof = true;
                fill_cond.notify_all();
                continue;
            }
        };

        let mut guard = shared.lock().expect("prefetch mutex poisoned");
        if guard.restart_from.is_some() {
            // A seek raced us; drop what we just read and loop again.
            continue;
        }
        if n == 0 {
            guard.eof = true;
            fill_cond.notify_all();
            continue;
        }
        guard.buf.put(&scratch[..n]);
        fill_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn file_read_and_seek_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"0123456789").unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        let stream = IoStream::open_file(&path, false).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        stream.seek(0, SeekFrom::Start(0)).unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn mmap_read_matches_fd_read() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello mmap world").unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        let stream = IoStream::open_file(&path, true).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn eof_is_reached_after_reading_everything() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        let stream = IoStream::open_file(&path, false).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(stream.eof());
    }

    #[test]
    fn buffered_stream_serves_bytes_through_prefetch_thread() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![7u8; 4096]).unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(f.path().to_path_buf()).unwrap();

        let stream = IoStream::open_file(&path, false).unwrap();
        let buffered = BufferedIoStream::new(stream, DEFAULT_PREFETCH_BYTES);
        let mut buf = [0u8; 4096];
        let mut total = 0;
        while total < 4096 {
            let n = buffered.read(&mut buf[total..]).unwrap();
            assert!(n > 0);
            total += n;
        }
        assert!(buf.iter().all(|&b| b == 7));
    }
}
