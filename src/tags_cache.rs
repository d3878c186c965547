//! On-disk tag cache (C9, spec §4.10). Keyed by file path, record shape
//! `(mtime, atime, artist, album, title, track, duration, filled_mask)`.
//! Grounded on the teacher's `system.rs` pattern of wrapping a single
//! `rusqlite::Connection` behind a small API, generalized here with the
//! per-client request queue and eviction-by-`atime` semantics ported from
//! `trunk/tags_cache.c`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::Connection;

use crate::decoder::{Registry, TagsWhich};
use crate::error::CacheError;

/// Format version baked into `moc_version_tag`; bumping it forces a full
/// purge of existing caches on next startup (spec §4.10, §6).
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilledMask {
    pub comments: bool,
    pub time: bool,
}

impl FilledMask {
    pub fn contains(self, which: TagsWhich) -> bool {
        (!which.comments || self.comments) && (!which.time || self.time)
    }

    pub fn union(self, which: TagsWhich) -> Self {
        Self {
            comments: self.comments || which.comments,
            time: self.time || which.time,
        }
    }
}

/// File tags (spec §3: `{title, artist, album, track_no, duration_s,
/// filled_mask}`). `-1`-style "unknown" sentinels from the C original are
/// represented as `Option::None` instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    pub duration_secs: Option<f64>,
}

struct Record {
    mtime: i64,
    atime: i64,
    tags: Tags,
    filled: FilledMask,
}

/// A single request: `(path, which_tags)`, answered asynchronously
/// through `reply`.
pub struct Request {
    pub path: Utf8PathBuf,
    pub which: TagsWhich,
    reply: std::sync::mpsc::Sender<Option<Tags>>,
}

struct ClientQueue {
    requests: VecDeque<Request>,
}

pub struct TagsCache {
    conn: Mutex<Connection>,
    queues: Mutex<Vec<ClientQueue>>,
    queue_cond: Condvar,
    max_records: usize,
    registry: Arc<Registry>,
    shutdown: Mutex<bool>,
}

impl TagsCache {
    /// Opens (or creates) the cache at `dir`, purging it first if
    /// `moc_version_tag` is missing or stale, per spec §4.10/§6.
    pub fn open(dir: &Utf8Path, max_records: usize, registry: Arc<Registry>) -> color_eyre::Result<Arc<Self>> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::Io(e.to_string()))?;

        let version_tag_path = dir.join("moc_version_tag");
        let db_version = rusqlite::version_number();
        let expected = format!("{CACHE_FORMAT_VERSION} {db_version}");
        let current = std::fs::read_to_string(&version_tag_path).ok();

        if current.as_deref() != Some(expected.as_str()) {
            tracing::info!(dir = %dir, "tag cache version mismatch, purging");
            for entry in std::fs::read_dir(dir).map_err(|e| CacheError::Io(e.to_string()))? {
                let entry = entry.map_err(|e| CacheError::Io(e.to_string()))?;
                if entry.path().is_dir() {
                    std::fs::remove_dir_all(entry.path()).ok();
                } else {
                    std::fs::remove_file(entry.path()).ok();
                }
            }
            std::fs::write(&version_tag_path, &expected).map_err(|e| CacheError::Io(e.to_string()))?;
        }

        let conn = Connection::open(dir.join("tags.db")).map_err(CacheError::Db)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tags (
                path TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                title TEXT,
                artist TEXT,
                album TEXT,
                track INTEGER,
                duration REAL,
                filled_comments INTEGER NOT NULL,
                filled_time INTEGER NOT NULL
            )",
        )
        .map_err(CacheError::Db)?;

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            queues: Mutex::new(Vec::new()),
            queue_cond: Condvar::new(),
            max_records,
            registry,
            shutdown: Mutex::new(false),
        }))
    }

    /// Registers a new client's request queue, returning its index.
    pub fn register_client(&self) -> usize {
        let mut queues = self.queues.lock().expect("tag cache queues mutex poisoned");
        queues.push(ClientQueue { requests: VecDeque::new() });
        queues.len() - 1
    }

    pub fn add_request(&self, client: usize, path: Utf8PathBuf, which: TagsWhich) -> std::sync::mpsc::Receiver<Option<Tags>> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut queues = self.queues.lock().expect("tag cache queues mutex poisoned");
        if let Some(q) = queues.get_mut(client) {
            q.requests.push_back(Request { path, which, reply: tx });
        }
        drop(queues);
        self.queue_cond.notify_one();
        rx
    }

    pub fn clear_queue(&self, client: usize) {
        let mut queues = self.queues.lock().expect("tag cache queues mutex poisoned");
        if let Some(q) = queues.get_mut(client) {
            q.requests.clear();
        }
    }

    /// Drops queued entries up to and including `path` (used when a UI
    /// scrolls past a directory, per spec §4.10).
    pub fn clear_up_to(&self, client: usize, path: &Utf8Path) {
        let mut queues = self.queues.lock().expect("tag cache queues mutex poisoned");
        if let Some(q) = queues.get_mut(client) {
            while let Some(front) = q.requests.front() {
                let matched = front.path == path;
                q.requests.pop_front();
                if matched {
                    break;
                }
            }
        }
    }

    /// Synchronous path bypassing the per-client queues entirely, used to
    /// feed the player loop (spec §4.10: "A synchronous `get_immediate`
    /// path bypasses the queue").
    pub fn get_immediate(&self, path: &Utf8Path, which: TagsWhich) -> Option<Tags> {
        self.lookup_or_fill(path, which)
    }

    /// Services one request per non-empty client queue, round-robin, per
    /// cycle (spec §4.10: "round-robin one request per queue per cycle").
    /// Intended to be called in a loop from the cache's own thread.
    pub fn service_one_cycle(&self) {
        let client_count = self.queues.lock().expect("tag cache queues mutex poisoned").len();
        for client in 0..client_count {
            let request = {
                let mut queues = self.queues.lock().expect("tag cache queues mutex poisoned");
                queues.get_mut(client).and_then(|q| q.requests.pop_front())
            };
            let Some(request) = request else { continue };
            let tags = self.lookup_or_fill(&request.path, request.which);
            let _ = request.reply.send(tags);
        }
    }

    /// Blocks until any client queue has work, or the cache is shut down.
    pub fn wait_for_work(&self) {
        let queues = self.queues.lock().expect("tag cache queues mutex poisoned");
        let mut queues = self
            .queue_cond
            .wait_while(queues, |qs| {
                !*self.shutdown.lock().expect("shutdown mutex poisoned")
                    && qs.iter().all(|q| q.requests.is_empty())
            })
            .expect("tag cache queues mutex poisoned");
        let _ = &mut queues;
    }

    pub fn shutdown(&self) {
        *self.shutdown.lock().expect("shutdown mutex poisoned") = true;
        self.queue_cond.notify_all();
    }

    fn lookup_or_fill(&self, path: &Utf8Path, which: TagsWhich) -> Option<Tags> {
        let disk_mtime = std::fs::metadata(path).ok()?.modified().ok()?;
        let disk_mtime = disk_mtime
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;

        if let Some(record) = self.read_record(path) {
            if record.mtime == disk_mtime && record.filled.contains(which) {
                self.touch_atime(path);
                return Some(record.tags);
            }
        }

        let plugin = self.registry.resolve_for_path(path)?;
        let tags = plugin.info(path, which)?;
        self.upsert(path, disk_mtime, tags.clone(), FilledMask::default().union(which));
        Some(tags)
    }

    fn read_record(&self, path: &Utf8Path) -> Option<Record> {
        let conn = self.conn.lock().expect("tag cache db mutex poisoned");
        conn.query_row(
            "SELECT mtime, atime, title, artist, album, track, duration, filled_comments, filled_time
             FROM tags WHERE path = ?1",
            [path.as_str()],
            |row| {
                Ok(Record {
                    mtime: row.get(0)?,
                    atime: row.get(1)?,
                    tags: Tags {
                        title: row.get(2)?,
                        artist: row.get(3)?,
                        album: row.get(4)?,
                        track: row.get::<_, Option<i64>>(5)?.map(|t| t as u32),
                        duration_secs: row.get(6)?,
                    },
                    filled: FilledMask {
                        comments: row.get::<_, i64>(7)? != 0,
                        time: row.get::<_, i64>(8)? != 0,
                    },
                })
            },
        )
        .ok()
    }

    fn touch_atime(&self, path: &Utf8Path) {
        let conn = self.conn.lock().expect("tag cache db mutex poisoned");
        let _ = conn.execute(
            "UPDATE tags SET atime = ?1 WHERE path = ?2",
            rusqlite::params![now_secs(), path.as_str()],
        );
    }

    fn upsert(&self, path: &Utf8Path, mtime: i64, tags: Tags, filled: FilledMask) {
        self.evict_if_over_capacity();
        let conn = self.conn.lock().expect("tag cache db mutex poisoned");
        let _ = conn.execute(
            "INSERT INTO tags (path, mtime, atime, title, artist, album, track, duration, filled_comments, filled_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(path) DO UPDATE SET
                mtime = excluded.mtime, atime = excluded.atime, title = excluded.title,
                artist = excluded.artist, album = excluded.album, track = excluded.track,
                duration = excluded.duration, filled_comments = excluded.filled_comments,
                filled_time = excluded.filled_time",
            rusqlite::params![
                path.as_str(),
                mtime,
                now_secs(),
                tags.title,
                tags.artist,
                tags.album,
                tags.track.map(|t| t as i64),
                tags.duration_secs,
                filled.comments as i64,
                filled.time as i64,
            ],
        );
    }

    /// One eviction per insert, dropping the record with the smallest
    /// `atime`, per spec §4.10.
    fn evict_if_over_capacity(&self) {
        let conn = self.conn.lock().expect("tag cache db mutex poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |r| r.get(0))
            .unwrap_or(0);
        if (count as usize) < self.max_records {
            return;
        }
        let _ = conn.execute(
            "DELETE FROM tags WHERE path = (SELECT path FROM tags ORDER BY atime ASC LIMIT 1)",
            [],
        );
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::with_defaults())
    }

    #[test]
    fn version_tag_mismatch_purges_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(dir_path.join("moc_version_tag"), "stale").unwrap();
        std::fs::write(dir_path.join("garbage"), "x").unwrap();

        let _cache = TagsCache::open(dir_path, 100, registry()).unwrap();
        assert!(!dir_path.join("garbage").exists());
        assert!(dir_path.join("moc_version_tag").exists());
    }

    #[test]
    fn get_immediate_on_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let cache = TagsCache::open(dir_path, 100, registry()).unwrap();
        assert!(cache.get_immediate(Utf8Path::new("/no/such/file.mp3"), TagsWhich::ALL).is_none());
    }

    #[test]
    fn client_queue_round_robin_services_one_request_each() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let cache = TagsCache::open(dir_path, 100, registry()).unwrap();

        let c0 = cache.register_client();
        let c1 = cache.register_client();
        let rx0 = cache.add_request(c0, Utf8PathBuf::from("/missing/a.mp3"), TagsWhich::ALL);
        let rx1 = cache.add_request(c1, Utf8PathBuf::from("/missing/b.mp3"), TagsWhich::ALL);

        cache.service_one_cycle();
        assert_eq!(rx0.try_recv(), Ok(None));
        assert_eq!(rx1.try_recv(), Ok(None));
    }

    #[test]
    fn clear_up_to_drops_entries_through_the_named_path() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let cache = TagsCache::open(dir_path, 100, registry()).unwrap();
        let client = cache.register_client();

        let _ = cache.add_request(client, Utf8PathBuf::from("/a.mp3"), TagsWhich::ALL);
        let _ = cache.add_request(client, Utf8PathBuf::from("/b.mp3"), TagsWhich::ALL);
        let _ = cache.add_request(client, Utf8PathBuf::from("/c.mp3"), TagsWhich::ALL);

        cache.clear_up_to(client, Utf8Path::new("/b.mp3"));

        let queues = cache.queues.lock().unwrap();
        assert_eq!(queues[client].requests.len(), 1);
        assert_eq!(queues[client].requests[0].path, Utf8PathBuf::from("/c.mp3"));
    }
}
