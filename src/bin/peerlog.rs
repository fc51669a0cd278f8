//! Offset monitor - records oscillator vs reference offset into the monitor store

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crtcsync::clock::{HostClock, SystemClock};
use crtcsync::config::SystemConfig;
use crtcsync::monitor::MonitorStore;
use crtcsync::ntp::{NtpqSource, PeerQuery};
use crtcsync::traits::ReferenceSource;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record the device's offset to the reference peer")]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between samples, overrides monitor.interval_secs
    #[arg(short, long)]
    interval: Option<u64>,

    /// Stop after this many samples
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Print only the reference offset as seen by the host, then exit
    #[arg(long)]
    local_offset: bool,

    /// Empty the statistics store, then exit
    #[arg(long, conflicts_with_all = ["print", "local_offset"])]
    reset: bool,

    /// Print the statistics store as JSON, then exit
    #[arg(long, conflicts_with = "local_offset")]
    print: bool,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("warn"));
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SystemConfig::from_file(path)?,
        None => SystemConfig::default(),
    };
    let store = MonitorStore::new(&config.monitor.storage_path);

    if args.reset {
        store.reset().context("resetting monitor store")?;
        println!("Monitor store {} cleared", store.path().display());
        return Ok(());
    }
    if args.print {
        let record = store.load().context("reading monitor store")?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let clock = HostClock;
    let mut source = NtpqSource::new(&config.reference, clock);
    let reference = config.reference.reference_peer.as_str();
    let device = config.reference.device_peer.as_str();

    if args.local_offset {
        println!("{}", source.poll(reference, PeerQuery::offset())?.offset()?);
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    let interval = Duration::from_secs(args.interval.unwrap_or(config.monitor.interval_secs).max(1));

    println!(
        "=== Oscillator Offset Monitor ({} vs {}, store {}) ===\n",
        device,
        reference,
        store.path().display()
    );
    println!(
        "{:>20} {:>12} {:>12} {:>4} {:>12} {:>12} {:>12}",
        "Time (UTC)", "Device (ms)", "Ref (ms)", "St", "1h avg", "24h avg", "7d avg"
    );
    println!("{}", "-".repeat(90));

    let mut taken = 0usize;
    while running.load(Ordering::SeqCst) && args.count.map_or(true, |n| taken < n) {
        let osc = source.poll(device, PeerQuery::offset())?.offset()?;
        let peer = source.poll(reference, PeerQuery::offset().with_stratum())?;
        let reference_offset = peer.offset()?;
        let now = clock.now();
        let record = store
            .record(osc - reference_offset, now)
            .context("updating monitor store")?;
        taken += 1;

        println!(
            "{:>20} {:>+12.3} {:>+12.3} {:>4} {:>+12.3} {:>+12.3} {:>+12.3}",
            now.format("%Y-%m-%d %H:%M:%S"),
            osc,
            reference_offset,
            peer.stratum()?,
            record.hour_mean,
            record.day_mean,
            record.running_week
        );

        if args.count.map_or(false, |n| taken >= n) {
            break;
        }
        sleep_while_running(&clock, interval, &running);
    }

    println!("\n=== Done ({} samples recorded) ===", taken);
    Ok(())
}

/// Sleep in one-second slices so Ctrl+C is honoured promptly.
fn sleep_while_running(clock: &HostClock, total: Duration, running: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && running.load(Ordering::SeqCst) {
        let slice = left.min(Duration::from_secs(1));
        clock.sleep(slice);
        left -= slice;
    }
}
