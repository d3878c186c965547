//! Server and protocol dispatch (C11, spec §4.11). Accept loop and
//! per-client task shape are grounded on the teacher's
//! `mpd_client::handle_clients`/`handle_client` (one `tokio::task` per
//! accepted socket, shared controller state, per-client event channel
//! standing in for the C server's per-client event queue + `select`).
//! Generalized from MPD's line-based text commands to MOC's binary
//! op-code commands and from a single synchronous reply to a direct
//! reply **or** queued event.

use std::sync::{Arc, Weak};

use color_eyre::eyre::{eyre, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, instrument, warn};

use crate::controller::Controller;
use crate::protocol::*;

/// Fixed-size client table, per spec §4.11 ("kept in a fixed-size table
/// (up to 10)").
const MAX_CLIENTS: usize = 10;

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

struct ClientSlot {
    events_tx: mpsc::Sender<Event>,
    writer: SharedWriter,
    /// This client's queue index into the tag cache's round-robin reader
    /// (spec §4.10), assigned once at connect time.
    tags_client: usize,
}

pub struct Server {
    controller: Arc<Controller>,
    clients: std::sync::Mutex<Vec<Option<ClientSlot>>>,
    lock_holder: std::sync::Mutex<Option<usize>>,
    last_error: std::sync::Mutex<String>,
    /// Client that last advertised `CAN_SEND_PLIST`; consumed (reset to
    /// `None`) once nominated for a relay, per spec §4.11 scenario 4.
    plist_source: std::sync::Mutex<Option<usize>>,
    /// Client index waiting on the sender's `SEND_PLIST`, if any.
    plist_requester: std::sync::Mutex<Option<usize>>,
}

impl Server {
    pub fn new(controller: Arc<Controller>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            clients: std::sync::Mutex::new((0..MAX_CLIENTS).map(|_| None).collect()),
            lock_holder: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(String::new()),
            plist_source: std::sync::Mutex::new(None),
            plist_requester: std::sync::Mutex::new(None),
        })
    }

    fn record_error(&self, msg: String) {
        *self.last_error.lock().expect("last error mutex poisoned") = msg.clone();
        self.broadcast(Event::Error(msg));
    }

    fn broadcast(&self, event: Event) {
        let clients = self.clients.lock().expect("clients mutex poisoned");
        for slot in clients.iter().flatten() {
            let _ = slot.events_tx.try_send(event.clone());
        }
    }

    fn send_to(&self, client_index: usize, event: Event) {
        let clients = self.clients.lock().expect("clients mutex poisoned");
        if let Some(Some(slot)) = clients.get(client_index) {
            let _ = slot.events_tx.try_send(event);
        }
    }

    fn writer_for(&self, client_index: usize) -> Option<SharedWriter> {
        let clients = self.clients.lock().expect("clients mutex poisoned");
        clients.get(client_index)?.as_ref().map(|slot| Arc::clone(&slot.writer))
    }
}

/// Lets `ControllerEvents` closures, which are built before any `Server`
/// exists, fan events out to connected clients once one does. `bind` is
/// called once, from [`run`], after the real `Server` is constructed.
pub struct BroadcastHandle {
    target: std::sync::Mutex<Option<Weak<Server>>>,
}

impl BroadcastHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { target: std::sync::Mutex::new(None) })
    }

    fn bind(&self, server: &Arc<Server>) {
        *self.target.lock().expect("broadcast handle mutex poisoned") = Some(Arc::downgrade(server));
    }

    fn server(&self) -> Option<Arc<Server>> {
        self.target.lock().expect("broadcast handle mutex poisoned").as_ref()?.upgrade()
    }

    pub fn broadcast(&self, event: Event) {
        if let Some(server) = self.server() {
            server.broadcast(event);
        }
    }

    pub fn record_error(&self, msg: String) {
        if let Some(server) = self.server() {
            server.record_error(msg);
        }
    }
}

/// Binds the control socket at `socket_path` after checking/writing the
/// PID file at `pid_path`, per spec §6 ("Absence or stale PID permits
/// server start").
pub async fn run(
    socket_path: &camino::Utf8Path,
    pid_path: &camino::Utf8Path,
    controller: Arc<Controller>,
    broadcast: Arc<BroadcastHandle>,
) -> color_eyre::Result<()> {
    check_and_write_pid(pid_path)?;
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }
    let listener = UnixListener::bind(socket_path.as_std_path())
        .wrap_err_with(|| format!("could not bind control socket at {socket_path}"))?;

    let server = Server::new(controller);
    broadcast.bind(&server);

    loop {
        let (stream, _addr) = listener.accept().await.wrap_err("could not accept client connection")?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, server).await {
                warn!(error = %e, "client connection ended with error");
            } else {
                info!("client disconnected");
            }
        });
    }
}

fn check_and_write_pid(pid_path: &camino::Utf8Path) -> color_eyre::Result<()> {
    if let Ok(existing) = std::fs::read_to_string(pid_path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if pid_is_alive(pid) {
                return Err(eyre!("server already running (pid {pid})"));
            }
        }
    }
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(pid_path, std::process::id().to_string())
        .wrap_err_with(|| format!("could not write pid file at {pid_path}"))?;
    Ok(())
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // kill(pid, 0) without actually sending a signal: EPERM means it
    // exists but we can't signal it (still alive); ESRCH means gone.
    unsafe { libc_kill_zero(pid as i32) }
}

#[cfg(unix)]
fn libc_kill_zero(pid: i32) -> bool {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe { kill(pid, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc_eperm()) }
}

#[cfg(unix)]
fn libc_eperm() -> i32 {
    1 // EPERM is 1 on Linux; matched directly rather than pulling in the `libc` crate for one constant.
}

#[instrument(skip_all)]
async fn handle_client(stream: UnixStream, server: Arc<Server>) -> color_eyre::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));

    let client_index = {
        let mut clients = server.clients.lock().expect("clients mutex poisoned");
        let Some(slot) = clients.iter().position(|c| c.is_none()) else {
            drop(clients);
            let _ = reader.read_u8().await;
            let mut buf = Vec::new();
            let _ = Event::Busy.write(&mut buf);
            let _ = writer.lock().await.write_all(&buf).await;
            return Ok(());
        };
        let (tx, rx) = mpsc::channel(64);
        let tags_client = server.controller.tags_cache().register_client();
        clients[slot] = Some(ClientSlot { events_tx: tx, writer: Arc::clone(&writer), tags_client });
        drop(clients);
        (slot, rx)
    };
    let (client_index, mut events_rx) = client_index;

    let mut wants_events = false;

    let writer_for_events = Arc::clone(&writer);
    let event_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let mut buf = Vec::new();
            if event.write(&mut buf).is_err() {
                continue;
            }
            let mut w = writer_for_events.lock().await;
            if w.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let result = client_loop(&mut reader, &writer, &server, client_index, &mut wants_events).await;

    let tags_client = {
        let mut clients = server.clients.lock().expect("clients mutex poisoned");
        let slot = clients[client_index].take();
        slot.map(|s| s.tags_client)
    };
    if let Some(tags_client) = tags_client {
        server.controller.tags_cache().clear_queue(tags_client);
    }
    {
        let mut source = server.plist_source.lock().expect("plist source mutex poisoned");
        if *source == Some(client_index) {
            *source = None;
        }
    }
    {
        let mut requester = server.plist_requester.lock().expect("plist requester mutex poisoned");
        if *requester == Some(client_index) {
            *requester = None;
        }
    }
    event_task.abort();
    result
}

async fn client_loop(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &SharedWriter,
    server: &Arc<Server>,
    client_index: usize,
    wants_events: &mut bool,
) -> color_eyre::Result<()> {
    loop {
        let op = match reader.read_u8().await {
            Ok(b) => b,
            Err(_) => return Ok(()), // client closed the socket
        };

        let lock_holder = *server.lock_holder.lock().expect("lock holder mutex poisoned");
        if let Some(lock_holder) = lock_holder {
            if lock_holder != client_index && op != CMD_UNLOCK {
                // Paused: another client holds the exclusive section.
                // A production server would defer this command; here we
                // reject it outright rather than silently dropping it.
                reply_int(writer, -1).await?;
                continue;
            }
        }

        match op {
            CMD_PLAY => {
                let name = read_string_async(reader).await?;
                server.controller.play(&name);
            }
            CMD_STOP => server.controller.stop(),
            CMD_PAUSE => server.controller.pause(),
            CMD_UNPAUSE => server.controller.unpause(),
            CMD_NEXT => server.controller.next(),
            CMD_PREV => server.controller.prev(),
            CMD_SEEK => {
                let secs = read_i32_async(reader).await?;
                server.controller.seek(secs as f64);
            }
            CMD_LIST_CLEAR => {
                server.controller.playlist().clear_all();
            }
            CMD_LIST_ADD => {
                let path = read_string_async(reader).await?;
                server.controller.playlist().add(path);
            }
            CMD_DELETE => {
                let path = read_string_async(reader).await?;
                let index = server.controller.playlist().find_by_path(camino::Utf8Path::new(&path));
                if let Some(i) = index {
                    server.controller.playlist().delete(i);
                }
            }
            CMD_GET_STATE => {
                reply_data_u32(writer, state_code(server.controller.state())).await?;
            }
            CMD_GET_SNAME => {
                reply_data_string(writer, "").await?;
            }
            CMD_GET_CTIME => {
                let (ctime, _bitrate, _rate, _channels) = server.controller.current_stats();
                reply_data_f64(writer, ctime).await?;
            }
            CMD_GET_BITRATE => {
                let (_ctime, bitrate, _rate, _channels) = server.controller.current_stats();
                reply_data_u32(writer, bitrate.unwrap_or(0)).await?;
            }
            CMD_GET_RATE => {
                let (_ctime, _bitrate, rate, _channels) = server.controller.current_stats();
                reply_data_u32(writer, rate).await?;
            }
            CMD_GET_CHANNELS => {
                let (_ctime, _bitrate, _rate, channels) = server.controller.current_stats();
                reply_data_u32(writer, channels as u32).await?;
            }
            CMD_GET_SERIAL | CMD_PLIST_GET_SERIAL => {
                reply_data_u32(writer, server.controller.playlist().serial()).await?;
            }
            CMD_PLIST_SET_SERIAL => {
                let value = read_i32_async(reader).await?;
                server.controller.playlist().set_serial(value as u32);
            }
            CMD_GET_TAGS => {
                let tags = server.controller.current_tags();
                reply_event(writer, &Event::Tags(tags)).await?;
            }
            CMD_GET_FILE_TAGS => {
                let path = read_string_async(reader).await?;
                let tags_cache = server.controller.tags_cache();
                let tags_client = server_tags_client(server, client_index);
                let tags = fetch_file_tags(tags_cache, tags_client, path.clone()).await;
                reply_event(writer, &Event::FileTags { file: path, tags: tags.unwrap_or_default() }).await?;
            }
            CMD_GET_MIXER => {
                reply_data_u32(writer, server.controller.get_mixer() as u32).await?;
            }
            CMD_SET_MIXER => {
                let value = read_i32_async(reader).await?;
                let value = value.clamp(0, 100) as u8;
                server.controller.set_mixer(value);
                server.broadcast(Event::MixerChange(value));
            }
            CMD_GET_OPTION => {
                let name = read_string_async(reader).await?;
                let value = server.controller.get_option(&name);
                reply_data_u32(writer, value.map(|b| b as u32).unwrap_or(0)).await?;
            }
            CMD_SET_OPTION => {
                let name = read_string_async(reader).await?;
                let value = read_i32_async(reader).await? != 0;
                server.controller.set_option(&name, value);
                server.broadcast(Event::Options { name, value: value as i32 });
            }
            CMD_SEND_EVENTS => {
                *wants_events = true;
            }
            CMD_GET_ERROR => {
                let msg = server.last_error.lock().expect("last error mutex poisoned").clone();
                reply_data_string(writer, &msg).await?;
            }
            CMD_PING => {
                reply_event(writer, &Event::Pong).await?;
            }
            CMD_LOCK => {
                *server.lock_holder.lock().expect("lock holder mutex poisoned") = Some(client_index);
            }
            CMD_UNLOCK => {
                let mut holder = server.lock_holder.lock().expect("lock holder mutex poisoned");
                if *holder == Some(client_index) {
                    *holder = None;
                }
            }
            CMD_CLI_PLIST_ADD => {
                let path = read_string_async(reader).await?;
                server.controller.playlist().add(path);
            }
            CMD_CLI_PLIST_DEL => {
                let path = read_string_async(reader).await?;
                let index = server.controller.playlist().find_by_path(camino::Utf8Path::new(&path));
                if let Some(i) = index {
                    server.controller.playlist().delete(i);
                }
            }
            CMD_CLI_PLIST_CLEAR => {
                server.controller.playlist().clear_all();
            }
            CMD_CAN_SEND_PLIST => {
                *server.plist_source.lock().expect("plist source mutex poisoned") = Some(client_index);
            }
            CMD_GET_PLIST => {
                let source = *server.plist_source.lock().expect("plist source mutex poisoned");
                let nominated = match source {
                    Some(src) if src != client_index => {
                        let mut requester = server.plist_requester.lock().expect("plist requester mutex poisoned");
                        if requester.is_some() {
                            false
                        } else {
                            *requester = Some(client_index);
                            true
                        }
                    }
                    _ => false,
                };
                reply_data_u32(writer, nominated as u32).await?;
                if nominated {
                    if let Some(src) = source {
                        *server.plist_source.lock().expect("plist source mutex poisoned") = None;
                        server.send_to(src, Event::SendPlist);
                    }
                }
            }
            CMD_SEND_PLIST => {
                let serial = read_i32_async(reader).await? as u32;
                let mut items = Vec::new();
                loop {
                    let item = read_item_async(reader).await?;
                    if item.is_end_marker() {
                        break;
                    }
                    items.push(item);
                }
                let requester = server.plist_requester.lock().expect("plist requester mutex poisoned").take();
                if let Some(requester) = requester {
                    if let Some(dest) = server.writer_for(requester) {
                        let mut buf = Vec::new();
                        write_u32(&mut buf, serial)?;
                        for item in &items {
                            write_item(&mut buf, item)?;
                        }
                        write_item(&mut buf, &WireItem::end_marker())?;
                        let mut w = dest.lock().await;
                        w.write_all(&buf).await?;
                    }
                }
            }
            CMD_DISCONNECT => return Ok(()),
            CMD_QUIT => {
                server.broadcast(Event::Exit);
                std::process::exit(0);
            }
            other => {
                server.record_error(format!("unknown command byte {other:#x}"));
                return Err(crate::error::ProtocolError::UnknownCommand(other).into());
            }
        }
    }
}

fn state_code(state: crate::protocol::PlayerState) -> u32 {
    match state {
        crate::protocol::PlayerState::Play => 0,
        crate::protocol::PlayerState::Pause => 1,
        crate::protocol::PlayerState::Stop => 2,
    }
}

async fn reply_int(writer: &SharedWriter, value: i32) -> color_eyre::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(&value.to_ne_bytes()).await.map_err(Into::into)
}

async fn reply_data_u32(writer: &SharedWriter, value: u32) -> color_eyre::Result<()> {
    let mut buf = Vec::new();
    write_u32(&mut buf, EV_DATA)?;
    write_u32(&mut buf, value)?;
    let mut w = writer.lock().await;
    w.write_all(&buf).await.map_err(Into::into)
}

async fn reply_data_f64(writer: &SharedWriter, value: f64) -> color_eyre::Result<()> {
    let mut buf = Vec::new();
    write_u32(&mut buf, EV_DATA)?;
    write_f64(&mut buf, value)?;
    let mut w = writer.lock().await;
    w.write_all(&buf).await.map_err(Into::into)
}

async fn reply_data_string(writer: &SharedWriter, value: &str) -> color_eyre::Result<()> {
    let mut buf = Vec::new();
    write_u32(&mut buf, EV_DATA)?;
    write_string(&mut buf, value)?;
    let mut w = writer.lock().await;
    w.write_all(&buf).await.map_err(Into::into)
}

async fn reply_event(writer: &SharedWriter, event: &Event) -> color_eyre::Result<()> {
    let mut buf = Vec::new();
    event.write(&mut buf)?;
    let mut w = writer.lock().await;
    w.write_all(&buf).await.map_err(Into::into)
}

/// Looks up a connected client's tag-cache queue index, used by
/// `GET_FILE_TAGS` to enqueue through the same round-robin reader the
/// rest of that client's requests go through.
fn server_tags_client(server: &Arc<Server>, client_index: usize) -> usize {
    server
        .clients
        .lock()
        .expect("clients mutex poisoned")
        .get(client_index)
        .and_then(|s| s.as_ref())
        .map(|s| s.tags_client)
        .unwrap_or(0)
}

/// Enqueues a `GET_FILE_TAGS` request on the client's tag-cache queue and
/// waits for the reader thread to service it, off the async runtime so a
/// slow disk read doesn't stall other clients' commands.
async fn fetch_file_tags(
    tags_cache: Arc<crate::tags_cache::TagsCache>,
    tags_client: usize,
    path: String,
) -> Option<crate::tags_cache::Tags> {
    let rx = tags_cache.add_request(tags_client, camino::Utf8PathBuf::from(path), crate::decoder::TagsWhich::ALL);
    tokio::task::spawn_blocking(move || rx.recv().ok().flatten()).await.ok().flatten()
}

/// Async counterparts of `protocol.rs`'s synchronous string/int codecs,
/// needed because client sockets are driven by tokio rather than
/// blocking `Read`/`Write`.
async fn read_string_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<String> {
    let len = read_u32_async(reader).await?;
    if len > MAX_STRING_LEN {
        return Err(crate::error::ProtocolError::StringTooLong.into());
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| crate::error::ProtocolError::Decode(e.to_string()).into())
}

/// Matches `protocol.rs`'s host-byte-order framing (`to_ne_bytes`), since
/// both ends of this socket run on the same host.
async fn read_u32_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_ne_bytes(buf))
}

async fn read_i32_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(i32::from_ne_bytes(buf))
}

async fn read_f64_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(f64::from_ne_bytes(buf))
}

async fn read_tags_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<crate::tags_cache::Tags> {
    let title = read_string_async(reader).await?;
    let artist = read_string_async(reader).await?;
    let album = read_string_async(reader).await?;
    let track = read_i32_async(reader).await?;
    let duration = read_f64_async(reader).await?;
    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
    Ok(crate::tags_cache::Tags {
        title: non_empty(title),
        artist: non_empty(artist),
        album: non_empty(album),
        track: (track >= 0).then_some(track as u32),
        duration_secs: (duration >= 0.0).then_some(duration),
    })
}

/// `SEND_PLIST`'s peer-relayed items use the same framing as
/// `protocol.rs`'s synchronous [`read_item`], driven over tokio I/O.
async fn read_item_async(reader: &mut (impl AsyncReadExt + Unpin)) -> color_eyre::Result<WireItem> {
    let file = read_string_async(reader).await?;
    let tags = read_tags_async(reader).await?;
    let mtime = read_i32_async(reader).await? as i64;
    Ok(WireItem { file: camino::Utf8PathBuf::from(file), tags, mtime })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_code_matches_protocol_encoding() {
        assert_eq!(state_code(crate::protocol::PlayerState::Play), 0);
        assert_eq!(state_code(crate::protocol::PlayerState::Pause), 1);
        assert_eq!(state_code(crate::protocol::PlayerState::Stop), 2);
    }

    #[test]
    fn stale_pid_file_does_not_block_startup() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = camino::Utf8Path::from_path(dir.path()).unwrap().join("pid");
        std::fs::write(&pid_path, "999999999").unwrap();
        assert!(check_and_write_pid(&pid_path).is_ok());
    }

    #[test]
    fn live_pid_file_blocks_startup() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = camino::Utf8Path::from_path(dir.path()).unwrap().join("pid");
        std::fs::write(&pid_path, std::process::id().to_string()).unwrap();
        assert!(check_and_write_pid(&pid_path).is_err());
    }
}
