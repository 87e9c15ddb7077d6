#[macro_use]
extern crate log;

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use clap::Parser;
use wavepipe_core::error::{DaemonResult, Fault, ResultExt};
use wavepipe_core::Direction;

use crate::config::Config;
use crate::objects::{ObjectInfo, ObjectKind};
use crate::resource::Permissions;
use crate::server::Server;

pub mod alsa;
pub mod config;
pub mod mainloop;
pub mod objects;
pub mod registry;
pub mod resource;
pub mod server;

#[derive(Parser, Debug)]
#[command(name = "wavepiped", about = "wavepipe multimedia routing daemon")]
pub struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// The runtime directory the socket name lives under
pub fn runtime_dir() -> DaemonResult<PathBuf> {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .map_err(|_| anyhow!("XDG_RUNTIME_DIR not set in the environment"))
        .fault(Fault::SocketSetup)
}

/// Opens the configured device once to check it is usable and log what it
/// offers. A missing device is not fatal; the bus still runs.
fn probe_device(config: &Config) {
    let mut state = alsa::State::new(
        config,
        Direction::Playback,
        Box::new(alsa::device::NoEvents),
    );
    match state.enum_format(0, 1, None) {
        Ok(descriptors) => {
            for d in &descriptors {
                info!("'{}' offers {:?}", config.device, d);
            }
        }
        Err(e) => warn!("cannot probe '{}': {e}", config.device),
    }
    let _ = state.close();
}

pub fn run_daemon() -> DaemonResult<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let runtime = runtime_dir()?;
    run_daemon_at(config, &runtime)
}

pub fn run_daemon_at(config: Config, runtime_dir: &Path) -> DaemonResult<()> {
    probe_device(&config);

    let mut server = Server::new(config, runtime_dir)?;

    // the device appears on the bus as an endpoint global
    let device = server.ctx.config.device.clone();
    server.ctx.add_object_global(
        ObjectKind::Endpoint,
        ObjectInfo {
            name: device,
            media_class: "Audio/Sink".into(),
            ..Default::default()
        },
        Permissions::RWX,
    );

    server.run()
}
