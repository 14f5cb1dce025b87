use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use impulseclock::config::Config;
use impulseclock::dial;
use impulseclock::ntp::{self, NtpClient};
use impulseclock::relay::{DryRunRelays, RelayDriver, SysfsRelays};
use impulseclock::scheduler::Scheduler;
use impulseclock::service::{ClockService, LocalClock};
use impulseclock::store::{JsonFileStore, OffsetStore};
use impulseclock::web;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; every field is optional
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where the dial offset is kept between runs
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// GPIO (BCM) driving relay A
    #[arg(long)]
    pin_a: Option<u32>,

    /// GPIO (BCM) driving relay B
    #[arg(long)]
    pin_b: Option<u32>,

    /// Relay board closes on HIGH instead of LOW
    #[arg(long)]
    active_high: bool,

    /// Web control surface port
    #[arg(short, long)]
    port: Option<u16>,

    /// Disable the web control surface
    #[arg(long)]
    no_web: bool,

    /// Log relay activity instead of driving GPIO
    #[arg(long)]
    dry_run: bool,

    /// SNTP server for a startup check of the system clock
    #[arg(long)]
    ntp_server: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.state_file {
            config.state_file = path.clone();
        }
        if let Some(pin) = self.pin_a {
            config.gpio.pin_a = pin;
        }
        if let Some(pin) = self.pin_b {
            config.gpio.pin_b = pin;
        }
        if self.active_high {
            config.gpio.active_high = true;
        }
        if let Some(port) = self.port {
            config.web.port = port;
        }
        if self.no_web {
            config.web.enabled = false;
        }
        if self.ntp_server.is_some() {
            config.ntp_server = self.ntp_server.clone();
        }
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!(
        "International impulse clock v{} (A=GPIO{}, B=GPIO{}, active-{})",
        env!("CARGO_PKG_VERSION"),
        config.gpio.pin_a,
        config.gpio.pin_b,
        if config.gpio.active_high { "high" } else { "low" }
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received. Releasing relays...");
        r.store(false, Ordering::SeqCst);
    })?;

    if let Some(server) = &config.ntp_server {
        let max_offset = Duration::from_millis(config.ntp_max_offset_ms);
        ntp::check_system_clock(&NtpClient::new(server), max_offset);
    }

    let relays: Box<dyn RelayDriver + Send> = if args.dry_run {
        info!("[Relay] Dry run: relays are only logged");
        Box::new(DryRunRelays::new())
    } else {
        Box::new(SysfsRelays::new(&config.gpio)?)
    };
    let store = JsonFileStore::new(&config.state_file);
    info!("[Store] State file: {}", store.path().display());
    let store: Box<dyn OffsetStore + Send> = Box::new(store);

    let scheduler = Scheduler::new(relays, store, config.timing.clone());
    let service = Arc::new(ClockService::new(scheduler, Box::new(LocalClock)));

    let status = service.get_status();
    info!(
        "[Scheduler] Dial {} (offset {} min, system {})",
        status.dial_time, status.offset_minutes, status.system_time
    );
    if !status.has_offset {
        warn!("[Scheduler] Dial reading never set; assuming it shows system time");
    }

    let tick_handle = {
        let service = service.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("tick".into())
            .spawn(move || service.run(&running))?
    };

    notify_systemd(true);

    if config.web.enabled {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        if let Err(e) = runtime.block_on(web::serve(service.clone(), &config.web, running.clone())) {
            error!("[Web] {:#}; continuing without the control surface", e);
        }
    }

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    notify_systemd(false);

    if tick_handle.join().is_err() {
        error!("[Scheduler] Tick thread panicked");
    }
    info!(
        "Exiting. Dial at {}.",
        dial::format_dial(service.get_status().dial_minutes)
    );
    Ok(())
}

#[cfg(unix)]
fn notify_systemd(ready: bool) {
    let state = if ready {
        sd_notify::NotifyState::Ready
    } else {
        sd_notify::NotifyState::Stopping
    };
    if let Err(e) = sd_notify::notify(false, &[state]) {
        warn!("sd_notify failed: {}", e);
    }
}

#[cfg(not(unix))]
fn notify_systemd(_ready: bool) {}
