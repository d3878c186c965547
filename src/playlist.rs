//! Playlist model (C8, spec §4.9). Ordered item list with tombstones, a
//! search index, shuffle, M3U/PLS load/save, and the display-title
//! format mini-language. Operations are a direct port of
//! `trunk/playlist.c`'s public surface.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use rand::seq::SliceRandom;

use crate::tags_cache::Tags;

#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub path: Utf8PathBuf,
    pub tags: Option<Tags>,
    pub mtime: Option<i64>,
    pub deleted: bool,
    pub time_secs: Option<f64>,
    /// Title read straight from the path/URL, used when no tags are
    /// loaded yet (spec §3: "lazily computed display title... one of the
    /// two pointers designates the active title").
    pub title_from_file: String,
}

impl PlaylistItem {
    fn new(path: Utf8PathBuf) -> Self {
        let title_from_file = path
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| path.to_string());
        Self {
            path,
            tags: None,
            mtime: None,
            deleted: false,
            time_secs: None,
            title_from_file,
        }
    }

    pub fn display_title(&self, format: &str) -> String {
        match &self.tags {
            Some(tags) if tags.title.is_some() => format_title(format, tags),
            _ => self.title_from_file.clone(),
        }
    }
}

#[derive(Default, Clone)]
pub struct Playlist {
    items: Vec<PlaylistItem>,
    index: HashMap<Utf8PathBuf, usize>,
    serial: u32,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// `PLIST_SET_SERIAL`: a client that is about to stream its own
    /// playlist over `SEND_PLIST` picks the serial the receiving side
    /// should adopt, rather than the server deriving one itself (spec
    /// §4.11).
    pub fn set_serial(&mut self, value: u32) {
        self.serial = value;
    }

    fn bump_serial(&mut self) {
        // Avoid the original's narrow 8-value seed (spec §9 open
        // question): any value that differs from the current serial
        // satisfies the stated invariant.
        self.serial = self.serial.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn not_deleted_count(&self) -> usize {
        self.items.iter().filter(|i| !i.deleted).count()
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistItem> {
        self.items.get(index)
    }

    /// Adding a duplicate path is a no-op; the existing item wins (spec
    /// §3). Returns the item's index either way.
    pub fn add(&mut self, path: impl Into<Utf8PathBuf>) -> usize {
        let path = path.into();
        if let Some(&idx) = self.index.get(&path) {
            return idx;
        }
        let idx = self.items.len();
        self.items.push(PlaylistItem::new(path.clone()));
        self.index.insert(path, idx);
        self.bump_serial();
        idx
    }

    /// Tombstones index `i`; physical size is unchanged, `not_deleted`
    /// drops by one.
    pub fn delete(&mut self, i: usize) {
        if let Some(item) = self.items.get_mut(i) {
            if !item.deleted {
                item.deleted = true;
                self.index.remove(&item.path);
                self.bump_serial();
            }
        }
    }

    pub fn find_by_path(&self, path: &Utf8Path) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// Drops every item and bumps the serial, per `CMD_LIST_CLEAR`/
    /// `CLI_PLIST_CLEAR` (spec §6).
    pub fn clear_all(&mut self) {
        self.items.clear();
        self.index.clear();
        self.bump_serial();
    }

    /// Next non-tombstoned index after `i`, wrapping is NOT performed
    /// here (the controller decides end-of-list policy via Repeat).
    pub fn next(&self, i: usize) -> Option<usize> {
        ((i + 1)..self.items.len()).find(|&j| !self.items[j].deleted)
    }

    pub fn prev(&self, i: usize) -> Option<usize> {
        (0..i).rev().find(|&j| !self.items[j].deleted)
    }

    pub fn sort_by_filename(&mut self) {
        self.items.sort_by(|a, b| a.path.cmp(&b.path));
        self.rebuild_index();
    }

    /// Fisher-Yates shuffle, then swaps the currently-playing item (if
    /// any) to index 0, per spec §3 and §4.9.
    pub fn shuffle(&mut self, currently_playing: Option<&Utf8Path>) {
        let mut rng = rand::thread_rng();
        self.items.shuffle(&mut rng);
        if let Some(playing) = currently_playing {
            if let Some(pos) = self.items.iter().position(|i| i.path == playing) {
                self.items.swap(0, pos);
            }
        }
        self.rebuild_index();
        self.bump_serial();
    }

    pub fn swap_first_to(&mut self, path: &Utf8Path) {
        if let Some(pos) = self.items.iter().position(|i| i.path == path) {
            self.items.swap(0, pos);
            self.rebuild_index();
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, item) in self.items.iter().enumerate() {
            if !item.deleted {
                self.index.insert(item.path.clone(), i);
            }
        }
    }

    pub fn concat(&mut self, other: &Playlist) {
        for item in &other.items {
            if !item.deleted {
                self.add(item.path.clone());
            }
        }
    }

    /// Removes items from `self` whose path also appears, non-deleted,
    /// in `other`.
    pub fn remove_common(&mut self, other: &Playlist) {
        let other_paths: std::collections::HashSet<_> =
            other.items.iter().filter(|i| !i.deleted).map(|i| i.path.clone()).collect();
        for (i, item) in self.items.iter().enumerate() {
            if !item.deleted && other_paths.contains(&item.path) {
                self.delete(i);
            }
        }
    }

    /// `None` if any non-deleted item's time is unknown; otherwise the
    /// sum (spec §3: "derived total time and 'time known for all items'
    /// flag").
    pub fn total_time(&self) -> Option<f64> {
        let mut total = 0.0;
        for item in self.items.iter().filter(|i| !i.deleted) {
            total += item.time_secs?;
        }
        Some(total)
    }

    pub fn set_tags(&mut self, i: usize, tags: Tags) {
        if let Some(item) = self.items.get_mut(i) {
            item.time_secs = tags.duration_secs.or(item.time_secs);
            item.tags = Some(tags);
        }
    }

    pub fn set_item_time(&mut self, i: usize, secs: f64) {
        if let Some(item) = self.items.get_mut(i) {
            item.time_secs = Some(secs);
        }
    }

    /// Loads an M3U or PLS playlist, resolving relative paths against
    /// `cwd` (the playlist file's own directory), per spec §4.9/§6.
    pub fn load(path: &Utf8Path, cwd: &Utf8Path) -> color_eyre::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| crate::error::IoError::Fatal(e.to_string()))?;
        if is_pls(&contents) {
            Ok(load_pls(&contents, cwd))
        } else {
            Ok(load_m3u(&contents, cwd))
        }
    }

    /// Saves as M3U with `#EXTINF` lines; paths under `cwd` are stripped
    /// to a relative form, per spec §4.9.
    pub fn save(&self, path: &Utf8Path, cwd: &Utf8Path) -> color_eyre::Result<()> {
        let mut out = String::from("#EXTM3U\n");
        for item in self.items.iter().filter(|i| !i.deleted) {
            let secs = item.time_secs.unwrap_or(-1.0) as i64;
            let title = item.display_title("%t");
            out.push_str(&format!("#EXTINF:{secs},{title}\n"));
            let path_str = item
                .path
                .strip_prefix(cwd)
                .map(|p| p.as_str())
                .unwrap_or(item.path.as_str());
            out.push_str(path_str);
            out.push('\n');
        }
        std::fs::write(path, out).map_err(|e| crate::error::IoError::Fatal(e.to_string()).into())
    }
}

fn is_pls(contents: &str) -> bool {
    contents
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().eq_ignore_ascii_case("[playlist]"))
        .unwrap_or(false)
}

fn resolve_path(raw: &str, cwd: &Utf8Path) -> Utf8PathBuf {
    if raw.contains("://") || raw.starts_with('/') {
        return Utf8PathBuf::from(raw);
    }
    normalize(&cwd.join(raw))
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        use camino::Utf8Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

fn load_m3u(contents: &str, cwd: &Utf8Path) -> Playlist {
    let mut playlist = Playlist::new();
    let mut pending_title: Option<String> = None;
    let mut pending_secs: Option<f64> = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line == "#EXTM3U" {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let Some((secs_str, title)) = rest.split_once(',') else {
                continue;
            };
            // Bad EXTINF lines are dropped (spec §8 scenario 5); a
            // following non-EXTINF path line still loads normally.
            pending_secs = secs_str.trim().parse::<f64>().ok();
            pending_title = Some(title.to_owned());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let idx = playlist.add(resolve_path(line, cwd));
        if let Some(secs) = pending_secs.take() {
            playlist.set_item_time(idx, secs);
        }
        if let Some(title) = pending_title.take() {
            playlist.items[idx].title_from_file = title;
        }
    }

    playlist
}

fn load_pls(contents: &str, cwd: &Utf8Path) -> Playlist {
    let mut files: HashMap<u32, String> = HashMap::new();
    let mut titles: HashMap<u32, String> = HashMap::new();
    let mut lengths: HashMap<u32, f64> = HashMap::new();
    let mut count = 0u32;

    for line in contents.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case("NumberOfEntries") {
            count = value.parse().unwrap_or(0);
        } else if let Some(n) = key.strip_prefix("File").or_else(|| key.strip_prefix("file")) {
            if let Ok(n) = n.parse() {
                files.insert(n, value.to_owned());
            }
        } else if let Some(n) = key.strip_prefix("Title").or_else(|| key.strip_prefix("title")) {
            if let Ok(n) = n.parse() {
                titles.insert(n, value.to_owned());
            }
        } else if let Some(n) = key.strip_prefix("Length").or_else(|| key.strip_prefix("length")) {
            if let Ok(n) = n.parse() {
                if let Ok(secs) = value.parse::<f64>() {
                    if secs >= 0.0 {
                        lengths.insert(n, secs);
                    }
                }
            }
        }
    }

    let mut playlist = Playlist::new();
    for n in 1..=count {
        let Some(file) = files.get(&n) else { continue };
        let idx = playlist.add(resolve_path(file, cwd));
        if let Some(title) = titles.get(&n) {
            playlist.items[idx].title_from_file = title.clone();
        }
        if let Some(secs) = lengths.get(&n) {
            playlist.set_item_time(idx, *secs);
        }
    }
    playlist
}

/// Display-title mini-language: `%a` artist, `%A` album, `%t` title, `%n`
/// track number; `%(x:then:else)` expands to `then` iff tag `x` is
/// present, else `else`. Both `\` and `%` are escapable.
pub fn format_title(format: &str, tags: &Tags) -> String {
    let mut out = String::new();
    let chars: Vec<char> = format.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(chars[i + 1]);
                i += 2;
            }
            '%' if i + 1 < chars.len() && chars[i + 1] == '(' => {
                let (expanded, consumed) = expand_ternary(&chars[i..], tags);
                out.push_str(&expanded);
                i += consumed;
            }
            '%' if i + 1 < chars.len() => {
                out.push_str(&expand_field(chars[i + 1], tags));
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn expand_field(field: char, tags: &Tags) -> String {
    match field {
        'a' => tags.artist.clone().unwrap_or_default(),
        'A' => tags.album.clone().unwrap_or_default(),
        't' => tags.title.clone().unwrap_or_default(),
        'n' => tags.track.map(|t| t.to_string()).unwrap_or_default(),
        '%' => "%".to_owned(),
        other => format!("%{other}"),
    }
}

fn has_field(field: char, tags: &Tags) -> bool {
    match field {
        'a' => tags.artist.is_some(),
        'A' => tags.album.is_some(),
        't' => tags.title.is_some(),
        'n' => tags.track.is_some(),
        _ => false,
    }
}

/// Parses `%(x:then:else)` starting at `chars[0] == '%'`, returning the
/// expansion and how many input chars it consumed.
fn expand_ternary(chars: &[char], tags: &Tags) -> (String, usize) {
    // chars: '%', '(', field, ':', then..., ':', else..., ')'
    if chars.len() < 2 || chars[2..].is_empty() {
        return ("%(".to_owned(), 2);
    }
    let field = chars[2];
    let rest = &chars[3..];
    let Some(colon1) = rest.iter().position(|&c| c == ':') else {
        return (chars.iter().collect(), chars.len());
    };
    let after_colon1 = &rest[colon1 + 1..];
    let Some(close_paren_rel) = find_matching_close(after_colon1) else {
        return (chars.iter().collect(), chars.len());
    };
    let branch_text: String = after_colon1[..close_paren_rel].iter().collect();
    let mut branches = branch_text.splitn(2, ':');
    let then_branch = branches.next().unwrap_or("");
    let else_branch = branches.next().unwrap_or("");

    let consumed = 3 /* %( and field */ + colon1 + 1 /* : */ + close_paren_rel + 1 /* ) */;
    let chosen = if has_field(field, tags) { then_branch } else { else_branch };
    (chosen.to_owned(), consumed)
}

fn find_matching_close(chars: &[char]) -> Option<usize> {
    chars.iter().position(|&c| c == ')')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(title: &str, artist: &str) -> Tags {
        Tags {
            title: Some(title.to_owned()),
            artist: Some(artist.to_owned()),
            album: None,
            track: None,
            duration_secs: None,
        }
    }

    #[test]
    fn add_duplicate_path_is_a_no_op() {
        let mut p = Playlist::new();
        let a = p.add("a.mp3");
        let b = p.add("a.mp3");
        assert_eq!(a, b);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn delete_keeps_size_but_drops_not_deleted_count() {
        let mut p = Playlist::new();
        p.add("a.mp3");
        p.add("b.mp3");
        p.delete(0);
        assert_eq!(p.len(), 2);
        assert_eq!(p.not_deleted_count(), 1);
    }

    #[test]
    fn next_and_prev_are_inverse_when_both_exist() {
        let mut p = Playlist::new();
        p.add("a.mp3");
        p.add("b.mp3");
        p.add("c.mp3");
        let i = 1;
        let prev = p.prev(i).unwrap();
        assert_eq!(p.next(prev).unwrap(), i);
    }

    #[test]
    fn next_and_prev_skip_tombstones() {
        let mut p = Playlist::new();
        p.add("a.mp3");
        p.add("b.mp3");
        p.add("c.mp3");
        p.delete(1);
        assert_eq!(p.next(0), Some(2));
    }

    #[test]
    fn shuffle_moves_current_to_index_zero_and_preserves_multiset() {
        let mut p = Playlist::new();
        for name in ["a.mp3", "b.mp3", "c.mp3", "d.mp3"] {
            p.add(name);
        }
        let before: std::collections::BTreeSet<_> = p.items.iter().map(|i| i.path.clone()).collect();
        p.shuffle(Some(Utf8Path::new("c.mp3")));
        assert_eq!(p.items[0].path, Utf8PathBuf::from("c.mp3"));
        let after: std::collections::BTreeSet<_> = p.items.iter().map(|i| i.path.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn m3u_round_trip_preserves_paths_and_order() {
        let m3u = "#EXTM3U\n#EXTINF:180,Track One\n/music/a.mp3\n/music/b.mp3\n";
        let cwd = Utf8PathBuf::from("/music");
        let p = load_m3u(m3u, &cwd);
        assert_eq!(p.len(), 2);
        assert_eq!(p.items[0].path, Utf8PathBuf::from("/music/a.mp3"));
        assert_eq!(p.items[0].time_secs, Some(180.0));
        assert_eq!(p.items[1].path, Utf8PathBuf::from("/music/b.mp3"));
    }

    #[test]
    fn bad_extinf_is_dropped_but_following_entries_still_load() {
        let m3u = "#EXTINF:notanumber,Title\n/x.mp3\n";
        let cwd = Utf8PathBuf::from("/");
        let p = load_m3u(m3u, &cwd);
        assert_eq!(p.len(), 1);
        assert_eq!(p.items[0].path, Utf8PathBuf::from("/x.mp3"));
    }

    #[test]
    fn pls_loads_files_titles_and_lengths_by_index() {
        let pls = "[playlist]\nNumberOfEntries=2\nFile1=/a.mp3\nTitle1=A\nLength1=10\nFile2=/b.mp3\n";
        let cwd = Utf8PathBuf::from("/");
        let p = load_pls(pls, &cwd);
        assert_eq!(p.len(), 2);
        assert_eq!(p.items[0].time_secs, Some(10.0));
        assert_eq!(p.items[0].title_from_file, "A");
    }

    #[test]
    fn display_title_format_expands_fields() {
        let item = PlaylistItem::new(Utf8PathBuf::from("song.mp3"));
        let mut item = item;
        item.tags = Some(tags("Song", "Artist"));
        assert_eq!(item.display_title("%a - %t"), "Artist - Song");
    }

    #[test]
    fn ternary_expands_then_branch_when_field_present() {
        let t = tags("Song", "Artist");
        assert_eq!(format_title("%(a:has artist:no artist)", &t), "has artist");
    }

    #[test]
    fn ternary_expands_else_branch_when_field_missing() {
        let t = Tags::default();
        assert_eq!(format_title("%(a:has artist:no artist)", &t), "no artist");
    }

    #[test]
    fn escaped_percent_and_backslash_are_literal() {
        let t = Tags::default();
        assert_eq!(format_title("100\\% \\done", &t), "100% done");
    }

    #[test]
    fn ternary_does_not_swallow_trailing_text() {
        let t = tags("Song", "Artist");
        assert_eq!(format_title("%(a:has:no) tail", &t), "has tail");
    }
}
