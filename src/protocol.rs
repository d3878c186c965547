//! Wire protocol (part of C11, spec §4.11/§6). Length-prefixed strings,
//! fixed-width host-order integers, playlist items, and event tag +
//! payload framing. Op codes are grounded on `original_source/trunk/
//! protocol.h`'s `CMD_*`/`EV_*`/`STATE_*` constants.

use std::io::{self, Read, Write};

use camino::Utf8PathBuf;

use crate::error::ProtocolError;
use crate::tags_cache::Tags;

pub const MAX_STRING_LEN: u32 = 4096;

// Command op codes, one byte each.
pub const CMD_PLAY: u8 = 1;
pub const CMD_LIST_CLEAR: u8 = 2;
pub const CMD_LIST_ADD: u8 = 3;
pub const CMD_STOP: u8 = 4;
pub const CMD_PAUSE: u8 = 5;
pub const CMD_UNPAUSE: u8 = 6;
pub const CMD_NEXT: u8 = 7;
pub const CMD_PREV: u8 = 8;
pub const CMD_SEEK: u8 = 9;
pub const CMD_GET_CTIME: u8 = 10;
pub const CMD_GET_STATE: u8 = 11;
pub const CMD_GET_BITRATE: u8 = 12;
pub const CMD_GET_RATE: u8 = 13;
pub const CMD_GET_CHANNELS: u8 = 14;
pub const CMD_GET_MIXER: u8 = 15;
pub const CMD_GET_SNAME: u8 = 16;
pub const CMD_GET_TAGS: u8 = 17;
pub const CMD_GET_FILE_TAGS: u8 = 18;
pub const CMD_SET_MIXER: u8 = 19;
pub const CMD_GET_OPTION: u8 = 20;
pub const CMD_SET_OPTION: u8 = 21;
pub const CMD_DELETE: u8 = 22;
pub const CMD_SEND_EVENTS: u8 = 23;
pub const CMD_GET_ERROR: u8 = 24;
pub const CMD_PING: u8 = 25;
pub const CMD_DISCONNECT: u8 = 26;
pub const CMD_QUIT: u8 = 27;
pub const CMD_LOCK: u8 = 28;
pub const CMD_UNLOCK: u8 = 29;
pub const CMD_GET_SERIAL: u8 = 30;
pub const CMD_PLIST_GET_SERIAL: u8 = 31;
pub const CMD_PLIST_SET_SERIAL: u8 = 32;
pub const CMD_GET_PLIST: u8 = 33;
pub const CMD_SEND_PLIST: u8 = 34;
pub const CMD_CAN_SEND_PLIST: u8 = 35;
pub const CMD_CLI_PLIST_ADD: u8 = 36;
pub const CMD_CLI_PLIST_DEL: u8 = 37;
pub const CMD_CLI_PLIST_CLEAR: u8 = 38;

// Event tags.
pub const EV_STATE: u32 = 1;
pub const EV_CTIME: u32 = 2;
pub const EV_BITRATE: u32 = 3;
pub const EV_RATE: u32 = 4;
pub const EV_CHANNELS: u32 = 5;
pub const EV_ERROR: u32 = 6;
pub const EV_BUSY: u32 = 7;
pub const EV_DATA: u32 = 8;
pub const EV_EXIT: u32 = 9;
pub const EV_PONG: u32 = 10;
pub const EV_OPTIONS: u32 = 11;
pub const EV_SEND_PLIST: u32 = 12;
pub const EV_PLIST_ADD: u32 = 13;
pub const EV_PLIST_DEL: u32 = 14;
pub const EV_PLIST_CLEAR: u32 = 15;
pub const EV_TAGS: u32 = 16;
pub const EV_STATUS_MSG: u32 = 17;
pub const EV_MIXER_CHANGE: u32 = 18;
pub const EV_FILE_TAGS: u32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Play,
    Pause,
    Stop,
}

impl PlayerState {
    fn to_u32(self) -> u32 {
        match self {
            PlayerState::Play => 0,
            PlayerState::Pause => 1,
            PlayerState::Stop => 2,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PlayerState::Play),
            1 => Some(PlayerState::Pause),
            2 => Some(PlayerState::Stop),
            _ => None,
        }
    }
}

/// A playlist item as it crosses the wire: `(file, title_tags, tags_blob,
/// mtime)`; empty `file` marks end-of-playlist (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub struct WireItem {
    pub file: Utf8PathBuf,
    pub tags: Tags,
    pub mtime: i64,
}

impl WireItem {
    pub fn end_marker() -> Self {
        Self { file: Utf8PathBuf::new(), tags: Tags::default(), mtime: -1 }
    }

    pub fn is_end_marker(&self) -> bool {
        self.file.as_str().is_empty()
    }
}

pub fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

pub fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn write_i32(w: &mut impl Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

pub fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

pub fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

pub fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_ne_bytes(buf))
}

/// Writes a `u32` length prefix (≤ [`MAX_STRING_LEN`]) followed by UTF-8
/// bytes, per spec §6.
pub fn write_string(w: &mut impl Write, s: &str) -> Result<(), ProtocolError> {
    if s.len() as u32 > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong);
    }
    write_u32(w, s.len() as u32).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    w.write_all(s.as_bytes()).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(())
}

pub fn read_string(r: &mut impl Read) -> Result<String, ProtocolError> {
    let len = read_u32(r).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub fn write_tags(w: &mut impl Write, tags: &Tags) -> Result<(), ProtocolError> {
    write_string(w, tags.title.as_deref().unwrap_or(""))?;
    write_string(w, tags.artist.as_deref().unwrap_or(""))?;
    write_string(w, tags.album.as_deref().unwrap_or(""))?;
    write_i32(w, tags.track.map(|t| t as i32).unwrap_or(-1)).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    write_f64(w, tags.duration_secs.unwrap_or(-1.0)).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(())
}

pub fn read_tags(r: &mut impl Read) -> Result<Tags, ProtocolError> {
    let title = non_empty(read_string(r)?);
    let artist = non_empty(read_string(r)?);
    let album = non_empty(read_string(r)?);
    let track = read_i32(r).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let duration = read_f64(r).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(Tags {
        title,
        artist,
        album,
        track: (track >= 0).then_some(track as u32),
        duration_secs: (duration >= 0.0).then_some(duration),
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn write_item(w: &mut impl Write, item: &WireItem) -> Result<(), ProtocolError> {
    write_string(w, item.file.as_str())?;
    write_tags(w, &item.tags)?;
    write_i32(w, item.mtime as i32).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(())
}

pub fn read_item(r: &mut impl Read) -> Result<WireItem, ProtocolError> {
    let file = Utf8PathBuf::from(read_string(r)?);
    let tags = read_tags(r)?;
    let mtime = read_i32(r).map_err(|e| ProtocolError::Decode(e.to_string()))? as i64;
    Ok(WireItem { file, tags, mtime })
}

/// Event packet: a `u32` tag followed by a type-specific payload, per
/// spec §4.11/§6.
#[derive(Debug, Clone)]
pub enum Event {
    State(PlayerState),
    Ctime(f64),
    Bitrate(u32),
    Rate(u32),
    Channels(u16),
    Error(String),
    Busy,
    Data(String),
    Exit,
    Pong,
    Options { name: String, value: i32 },
    SendPlist,
    PlistAdd(WireItem),
    PlistDel(String),
    PlistClear,
    Tags(Tags),
    StatusMsg(String),
    MixerChange(u8),
    FileTags { file: String, tags: Tags },
}

impl Event {
    pub fn write(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        let encode_err = |e: io::Error| ProtocolError::Decode(e.to_string());
        match self {
            Event::State(s) => {
                write_u32(w, EV_STATE).map_err(encode_err)?;
                write_u32(w, s.to_u32()).map_err(encode_err)
            }
            Event::Ctime(t) => {
                write_u32(w, EV_CTIME).map_err(encode_err)?;
                write_f64(w, *t).map_err(encode_err)
            }
            Event::Bitrate(b) => {
                write_u32(w, EV_BITRATE).map_err(encode_err)?;
                write_u32(w, *b).map_err(encode_err)
            }
            Event::Rate(r) => {
                write_u32(w, EV_RATE).map_err(encode_err)?;
                write_u32(w, *r).map_err(encode_err)
            }
            Event::Channels(c) => {
                write_u32(w, EV_CHANNELS).map_err(encode_err)?;
                write_u32(w, *c as u32).map_err(encode_err)
            }
            Event::Error(msg) => {
                write_u32(w, EV_ERROR).map_err(encode_err)?;
                write_string(w, msg)
            }
            Event::Busy => write_u32(w, EV_BUSY).map_err(encode_err),
            Event::Data(s) => {
                write_u32(w, EV_DATA).map_err(encode_err)?;
                write_string(w, s)
            }
            Event::Exit => write_u32(w, EV_EXIT).map_err(encode_err),
            Event::Pong => write_u32(w, EV_PONG).map_err(encode_err),
            Event::Options { name, value } => {
                write_u32(w, EV_OPTIONS).map_err(encode_err)?;
                write_string(w, name)?;
                write_i32(w, *value).map_err(encode_err)
            }
            Event::SendPlist => write_u32(w, EV_SEND_PLIST).map_err(encode_err),
            Event::PlistAdd(item) => {
                write_u32(w, EV_PLIST_ADD).map_err(encode_err)?;
                write_item(w, item)
            }
            Event::PlistDel(path) => {
                write_u32(w, EV_PLIST_DEL).map_err(encode_err)?;
                write_string(w, path)
            }
            Event::PlistClear => write_u32(w, EV_PLIST_CLEAR).map_err(encode_err),
            Event::Tags(tags) => {
                write_u32(w, EV_TAGS).map_err(encode_err)?;
                write_tags(w, tags)
            }
            Event::StatusMsg(msg) => {
                write_u32(w, EV_STATUS_MSG).map_err(encode_err)?;
                write_string(w, msg)
            }
            Event::MixerChange(v) => {
                write_u32(w, EV_MIXER_CHANGE).map_err(encode_err)?;
                write_u8(w, *v).map_err(encode_err)
            }
            Event::FileTags { file, tags } => {
                write_u32(w, EV_FILE_TAGS).map_err(encode_err)?;
                write_string(w, file)?;
                write_tags(w, tags)
            }
        }
    }

    pub fn read(r: &mut impl Read) -> Result<Self, ProtocolError> {
        let decode_err = |e: io::Error| ProtocolError::Decode(e.to_string());
        let tag = read_u32(r).map_err(decode_err)?;
        Ok(match tag {
            EV_STATE => Event::State(
                PlayerState::from_u32(read_u32(r).map_err(decode_err)?)
                    .ok_or_else(|| ProtocolError::Decode("bad player state".into()))?,
            ),
            EV_CTIME => Event::Ctime(read_f64(r).map_err(decode_err)?),
            EV_BITRATE => Event::Bitrate(read_u32(r).map_err(decode_err)?),
            EV_RATE => Event::Rate(read_u32(r).map_err(decode_err)?),
            EV_CHANNELS => Event::Channels(read_u32(r).map_err(decode_err)? as u16),
            EV_ERROR => Event::Error(read_string(r)?),
            EV_BUSY => Event::Busy,
            EV_DATA => Event::Data(read_string(r)?),
            EV_EXIT => Event::Exit,
            EV_PONG => Event::Pong,
            EV_OPTIONS => {
                let name = read_string(r)?;
                let value = read_i32(r).map_err(decode_err)?;
                Event::Options { name, value }
            }
            EV_SEND_PLIST => Event::SendPlist,
            EV_PLIST_ADD => Event::PlistAdd(read_item(r)?),
            EV_PLIST_DEL => Event::PlistDel(read_string(r)?),
            EV_PLIST_CLEAR => Event::PlistClear,
            EV_TAGS => Event::Tags(read_tags(r)?),
            EV_STATUS_MSG => Event::StatusMsg(read_string(r)?),
            EV_MIXER_CHANGE => Event::MixerChange(read_u8(r).map_err(decode_err)?),
            EV_FILE_TAGS => {
                let file = read_string(r)?;
                let tags = read_tags(r)?;
                Event::FileTags { file, tags }
            }
            other => return Err(ProtocolError::UnknownCommand(other as u8)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_event(ev: Event) -> Event {
        let mut buf = Vec::new();
        ev.write(&mut buf).unwrap();
        Event::read(&mut &buf[..]).unwrap()
    }

    #[test]
    fn state_event_roundtrips() {
        match roundtrip_event(Event::State(PlayerState::Pause)) {
            Event::State(PlayerState::Pause) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn string_over_max_len_is_rejected() {
        let mut buf = Vec::new();
        let too_long = "x".repeat(MAX_STRING_LEN as usize + 1);
        assert!(write_string(&mut buf, &too_long).is_err());
    }

    #[test]
    fn tags_roundtrip_preserves_unknown_sentinels() {
        let tags = Tags { title: Some("T".into()), artist: None, album: None, track: None, duration_secs: None };
        let mut buf = Vec::new();
        write_tags(&mut buf, &tags).unwrap();
        let back = read_tags(&mut &buf[..]).unwrap();
        assert_eq!(back, tags);
    }

    #[test]
    fn item_end_marker_has_empty_file() {
        let marker = WireItem::end_marker();
        assert!(marker.is_end_marker());
        let mut buf = Vec::new();
        write_item(&mut buf, &marker).unwrap();
        let back = read_item(&mut &buf[..]).unwrap();
        assert!(back.is_end_marker());
    }

    #[test]
    fn plist_add_event_roundtrips_item() {
        let item = WireItem {
            file: Utf8PathBuf::from("/a.mp3"),
            tags: Tags::default(),
            mtime: 123,
        };
        match roundtrip_event(Event::PlistAdd(item.clone())) {
            Event::PlistAdd(back) => assert_eq!(back, item),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
