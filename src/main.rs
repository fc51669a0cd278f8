use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crtcsync::clock::HostClock;
use crtcsync::config::SystemConfig;
use crtcsync::controller::SyncController;
use crtcsync::link::TtyPort;
use crtcsync::ntp::NtpqSource;
use crtcsync::state::StateStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file (defaults are used for anything it leaves out)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device, overrides the config file
    #[arg(short, long)]
    serial: Option<String>,

    /// Forget the persisted sync state before starting
    #[arg(long)]
    reset_state: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::from_file(path)?,
        None => SystemConfig::default(),
    };
    if let Some(serial) = args.serial {
        config.device.serial_address = serial;
    }
    config.check()?;

    if args.reset_state {
        let store = StateStore::new(&config.adjust.storage_path);
        store.reset().context("resetting sync state")?;
        info!("Sync state at {} cleared", store.path().display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Stopping after the current cycle...");
        s.store(true, Ordering::SeqCst);
    })?;

    let clock = HostClock;
    let port = TtyPort::new(&config.device.serial_address, config.device.baud_rate)
        .with_context(|| format!("serial device {}", config.device.serial_address))?;
    let source = NtpqSource::new(&config.reference, clock);

    info!(
        "Disciplining {} against {} (state in {})",
        config.device.serial_address,
        config.reference.reference_peer,
        config.adjust.storage_path.display()
    );

    let mut controller = SyncController::new(&config, port, source, clock);
    match controller.run(&stop) {
        Ok(()) => {
            info!("Exiting.");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!("Fatal: {}. Giving up.", e);
            process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
