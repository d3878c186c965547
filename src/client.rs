//! One-shot CLI client (spec §6). Connects to the control socket
//! synchronously — each invocation sends one command and, for queries,
//! waits for a single `EV_DATA`/event reply before exiting. Grounded on
//! the same wire format as `server.rs`, but driven over a blocking
//! `UnixStream` instead of tokio since the client process does nothing
//! concurrent.

use std::os::unix::net::UnixStream;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use crate::cli::{parse_jump_target, parse_signed_delta, Command, JumpTarget};
use crate::protocol::*;

pub async fn run(socket_path: &Utf8Path, command: Command, format: Option<&str>) -> Result<()> {
    let format = format.unwrap_or("%a - %t");
    let mut conn = UnixStream::connect(socket_path.as_std_path())
        .wrap_err_with(|| format!("could not connect to {socket_path}; is the server running?"))?;

    match command {
        Command::Server | Command::Foreground => unreachable!("handled by the caller"),
        Command::Append { path } => send_cmd_with_string(&mut conn, CMD_LIST_ADD, path.as_str())?,
        Command::Playit { path } => {
            send_cmd(&mut conn, CMD_LIST_CLEAR)?;
            send_cmd_with_string(&mut conn, CMD_LIST_ADD, path.as_str())?;
            send_cmd_with_string(&mut conn, CMD_PLAY, path.as_str())?;
        }
        Command::Enqueue { path } => {
            send_cmd(&mut conn, CMD_LIST_CLEAR)?;
            send_cmd_with_string(&mut conn, CMD_LIST_ADD, path.as_str())?;
        }
        Command::Clear => send_cmd(&mut conn, CMD_LIST_CLEAR)?,
        Command::Play { name } => send_cmd_with_string(&mut conn, CMD_PLAY, name.as_deref().unwrap_or(""))?,
        Command::Stop => send_cmd(&mut conn, CMD_STOP)?,
        Command::Next => send_cmd(&mut conn, CMD_NEXT)?,
        Command::Previous => send_cmd(&mut conn, CMD_PREV)?,
        Command::Pause => send_cmd(&mut conn, CMD_PAUSE)?,
        Command::Unpause => send_cmd(&mut conn, CMD_UNPAUSE)?,
        Command::TogglePause => {
            let state = query_state(&mut conn)?;
            match state {
                0 => send_cmd(&mut conn, CMD_PAUSE)?,
                _ => send_cmd(&mut conn, CMD_UNPAUSE)?,
            }
        }
        Command::Exit => send_cmd(&mut conn, CMD_QUIT)?,
        Command::Seek { delta } => {
            let secs = parse_signed_delta(&delta).wrap_err("invalid seek delta")?;
            write_u8(&mut conn, CMD_SEEK)?;
            write_i32(&mut conn, secs as i32)?;
        }
        Command::Jump { position } => {
            let target = parse_jump_target(&position).wrap_err("invalid jump target")?;
            match target {
                JumpTarget::Seconds(secs) => {
                    write_u8(&mut conn, CMD_SEEK)?;
                    write_i32(&mut conn, secs as i32)?;
                }
                JumpTarget::Percent(_pct) => {
                    // Absolute-percent seeks need the current track's
                    // duration, which this one-shot client does not
                    // fetch; relative seconds cover the common case.
                    return Err(eyre!("percent jumps are not supported by this client yet"));
                }
            }
        }
        Command::Volume { delta } => {
            let amount = parse_signed_delta(&delta).wrap_err("invalid volume delta")?;
            write_u8(&mut conn, CMD_GET_MIXER)?;
            let _tag = read_u32(&mut conn)?;
            let current = read_u32(&mut conn)? as i32;
            let new_value = (current + amount as i32).clamp(0, 100);
            write_u8(&mut conn, CMD_SET_MIXER)?;
            write_i32(&mut conn, new_value)?;
        }
        Command::On { name } => send_option(&mut conn, &name, true)?,
        Command::Off { name } => send_option(&mut conn, &name, false)?,
        Command::Toggle { name } => {
            write_u8(&mut conn, CMD_GET_OPTION)?;
            write_string(&mut conn, &name)?;
            let current = read_u32(&mut conn)?;
            send_option(&mut conn, &name, current == 0)?;
        }
        Command::Info => {
            print_info(&mut conn, format)?;
            return Ok(());
        }
        Command::SoundDriverList => {
            println!("cpal");
            println!("null");
            return Ok(());
        }
    }

    Ok(())
}

fn send_cmd(conn: &mut UnixStream, op: u8) -> Result<()> {
    write_u8(conn, op)?;
    Ok(())
}

fn send_cmd_with_string(conn: &mut UnixStream, op: u8, arg: &str) -> Result<()> {
    write_u8(conn, op)?;
    write_string(conn, arg)?;
    Ok(())
}

fn send_option(conn: &mut UnixStream, name: &str, value: bool) -> Result<()> {
    write_u8(conn, CMD_SET_OPTION)?;
    write_string(conn, name)?;
    write_i32(conn, value as i32)?;
    Ok(())
}

/// Issues `GET_STATE` and reads back the `EV_DATA` payload directly
/// (the server replies in-line rather than over the event channel for
/// query commands).
fn query_state(conn: &mut UnixStream) -> Result<u32> {
    write_u8(conn, CMD_GET_STATE)?;
    let _tag = read_u32(conn)?;
    Ok(read_u32(conn)?)
}

fn print_info(conn: &mut UnixStream, format: &str) -> Result<()> {
    write_u8(conn, CMD_GET_STATE)?;
    let _tag = read_u32(conn)?;
    let state = read_u32(conn)?;
    let state_name = match state {
        0 => "PLAY",
        1 => "PAUSE",
        _ => "STOP",
    };

    write_u8(conn, CMD_GET_TAGS)?;
    let _tag = read_u32(conn)?;
    let tags = read_tags(conn)?;

    println!("State: {state_name}");
    println!("Title: {}", crate::playlist::format_title(format, &tags));
    Ok(())
}
