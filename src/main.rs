use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::Context;
use color_eyre::Result;

use crate::cli::{Cli, Command};
use crate::config::Options;
use crate::controller::{Controller, ControllerEvents};
use crate::decoder::Registry;
use crate::protocol::Event;

mod cli;
mod client;
mod config;
mod controller;
mod convert;
mod decoder;
mod error;
mod fifo;
mod format;
mod io_stream;
mod output;
mod player;
mod playlist;
mod precache;
mod protocol;
mod ring;
mod server;
mod tags_cache;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    setup_tracing();

    let cli = Cli::parse();

    let home = config::moc_home_dir().wrap_err("could not resolve ~/.moc")?;
    let config_path = cli.config.clone().unwrap_or_else(|| home.join("config.toml"));
    let file_config = config::load(&config_path).wrap_err_with(|| format!("could not load {config_path}"))?;
    let options = file_config.to_options();

    let socket_path = home.join("socket");
    let pid_path = home.join("pid");

    match cli.command {
        Command::Server | Command::Foreground => run_server(home, socket_path, pid_path, options, file_config).await,
        other => client::run(&socket_path, other, cli.format.as_deref()).await,
    }
}

async fn run_server(
    home: Utf8PathBuf,
    socket_path: Utf8PathBuf,
    pid_path: Utf8PathBuf,
    options: Options,
    file_config: config::FileConfig,
) -> Result<()> {
    std::fs::create_dir_all(&home).wrap_err_with(|| format!("could not create {home}"))?;

    let registry = Arc::new(Registry::with_defaults());
    let tags_cache_dir = home.join("cache");
    let tags_cache = tags_cache::TagsCache::open(&tags_cache_dir, file_config.tag_cache_max_records, Arc::clone(&registry))
        .wrap_err("could not open tag cache")?;

    let tags_cache_reader = Arc::clone(&tags_cache);
    std::thread::spawn(move || loop {
        tags_cache_reader.wait_for_work();
        tags_cache_reader.service_one_cycle();
    });

    let sound_driver_preference = file_config.sound_driver.clone();
    let make_driver = move || -> Result<Box<dyn output::OutputDriver>> {
        output::open_first_working(&sound_driver_preference, |name| match name {
            "cpal" => Some(Box::new(output::cpal_backend::CpalDriver::new()) as Box<dyn output::OutputDriver>),
            "null" => Some(Box::new(output::null_backend::NullDriver::new()) as Box<dyn output::OutputDriver>),
            _ => None,
        })
    };

    // `ControllerEvents` is built before the `Server` exists (the server
    // is constructed from the controller, not the other way around), so
    // event fan-out goes through a handle that's bound to the real
    // `Server` once `server::run` creates one.
    let broadcast = server::BroadcastHandle::new();

    let broadcast_for_state = Arc::clone(&broadcast);
    let broadcast_for_bitrate = Arc::clone(&broadcast);
    let broadcast_for_tags = Arc::clone(&broadcast);
    let broadcast_for_error = Arc::clone(&broadcast);
    let events = ControllerEvents {
        on_state: Arc::new(move |state| {
            tracing::info!(?state, "player state changed");
            broadcast_for_state.broadcast(Event::State(state));
        }),
        on_bitrate: Arc::new(move |bitrate| {
            tracing::debug!(bitrate, "bitrate update");
            broadcast_for_bitrate.broadcast(Event::Bitrate(bitrate));
        }),
        on_tags_changed: Arc::new(move |tags| {
            tracing::debug!("tags changed");
            broadcast_for_tags.broadcast(Event::Tags(tags));
        }),
        on_error: Arc::new(move |msg| {
            tracing::warn!(%msg, "player error");
            broadcast_for_error.record_error(msg);
        }),
    };

    let controller = Controller::new(registry, tags_cache, options, make_driver, events);

    server::run(&socket_path, &pid_path, controller, broadcast).await
}

pub fn setup_tracing() {
    use tracing_subscriber::filter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = filter::EnvFilter::builder().from_env().unwrap_or_default();
    let fmt = fmt::layer().with_line_number(true);

    let _ignore_err = tracing_subscriber::registry().with(fmt).with(filter).try_init();
}
