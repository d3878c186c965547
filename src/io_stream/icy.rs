//! ICY in-band metadata parsing (spec §4.3). Icecast/Shoutcast streams
//! interleave a metadata block every `icy-metaint` bytes: one length byte
//! (times 16) followed by `key='value';` pairs. Only `StreamTitle` and
//! `StreamUrl` are exported; everything else is ignored.

/// Parses a raw ICY metadata block (already stripped of its length byte
/// and any trailing NUL padding) and returns `(title, url)`.
pub fn parse_metadata(block: &[u8]) -> (Option<String>, Option<String>) {
    let text = String::from_utf8_lossy(block);
    let text = text.trim_end_matches('\0');

    let mut title = None;
    let mut url = None;

    for entry in split_entries(text) {
        let Some((key, value)) = parse_entry(entry) else {
            continue;
        };
        match key {
            "StreamTitle" => title = Some(value.to_owned()),
            "StreamUrl" => url = Some(value.to_owned()),
            _ => {}
        }
    }

    (title, url)
}

/// Splits on `;` that terminate a `key='value'` pair, not semicolons that
/// might appear inside a quoted value.
fn split_entries(text: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut rest = text;
    while let Some(eq) = rest.find('=') {
        let key_end = eq;
        let after_eq = &rest[eq + 1..];
        if !after_eq.starts_with('\'') {
            break;
        }
        let Some(close) = after_eq[1..].find('\'') else {
            break;
        };
        let entry_end = eq + 1 + 1 + close;
        entries.push(&rest[..=entry_end]);
        let tail = &rest[entry_end + 1..];
        rest = tail.strip_prefix(';').unwrap_or(tail);
        let _ = key_end;
    }
    entries
}

fn parse_entry(entry: &str) -> Option<(&str, &str)> {
    let (key, value) = entry.split_once('=')?;
    let value = value.strip_prefix('\'')?.strip_suffix('\'')?;
    Some((key.trim(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_title_and_url() {
        let block = b"StreamTitle='Artist - Track';StreamUrl='http://example.com';";
        let (title, url) = parse_metadata(block);
        assert_eq!(title.as_deref(), Some("Artist - Track"));
        assert_eq!(url.as_deref(), Some("http://example.com"));
    }

    #[test]
    fn ignores_unknown_keys() {
        let block = b"StreamTitle='x';SomethingElse='y';";
        let (title, url) = parse_metadata(block);
        assert_eq!(title.as_deref(), Some("x"));
        assert_eq!(url, None);
    }

    #[test]
    fn strips_trailing_nul_padding() {
        let mut block = b"StreamTitle='padded';".to_vec();
        block.extend(std::iter::repeat(0u8).take(20));
        let (title, _) = parse_metadata(&block);
        assert_eq!(title.as_deref(), Some("padded"));
    }

    #[test]
    fn empty_block_yields_nothing() {
        assert_eq!(parse_metadata(b""), (None, None));
    }

    #[test]
    fn semicolon_inside_value_does_not_split_early() {
        let block = b"StreamTitle='A; B - C';StreamUrl='http://x';";
        let (title, url) = parse_metadata(block);
        assert_eq!(title.as_deref(), Some("A; B - C"));
        assert_eq!(url.as_deref(), Some("http://x"));
    }
}
