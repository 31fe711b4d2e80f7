//! Soft-master shell — feature `linux-raw`.
//!
//! Binds two NICs, drives the network to CP4, and runs the cyclic loop
//! until interrupted:
//!
//! ```text
//! sercos3-master <if-p1> <if-p2> [config.json]
//! ```
//!
//! The JSON config file holds a [`CommParams`] object and an optional
//! slave list; without one the master discovers the bus and adopts what
//! it finds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use sercos3::adapters::raw::{MonotonicClock, RawPorts};
use sercos3::app::ports::LogSink;
use sercos3::config::{CommParams, SlaveConfig};
use sercos3::{Master, Phase};

#[derive(serde::Deserialize, Default)]
struct ShellConfig {
    #[serde(default)]
    params: Option<CommParams>,
    #[serde(default)]
    slaves: Vec<SlaveConfig>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <if-p1> <if-p2> [config.json]", args[0]);
    }

    let shell_cfg: ShellConfig = match args.get(3) {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {path}"))?
        }
        None => ShellConfig::default(),
    };
    let params = shell_cfg.params.unwrap_or_default();

    let ports =
        RawPorts::open(&args[1], &args[2]).context("opening raw sockets (CAP_NET_RAW needed)")?;
    let mut clock = MonotonicClock::new();
    clock.request_rt_priority(80);

    let mut master = Master::init(params, ports, clock)?;
    master.set_event_sink(Box::new(LogSink));
    if !shell_cfg.slaves.is_empty() {
        master.set_slave_config(shell_cfg.slaves)?;
    }

    info!("switching to CP4");
    master.phase_switch(Phase::Cp4, 3, Duration::from_secs(30))?;
    let status = master.get_sercos_status();
    info!("up: phase {:?}, topology {:?}", status.phase, status.topology);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing SIGINT handler")?;
    }

    while !stop.load(Ordering::SeqCst) {
        master.cycle();
    }

    info!("shutting down: switching back to CP0");
    if let Err(e) = master.phase_switch(Phase::Cp0, 1, Duration::from_secs(10)) {
        warn!("switch-back failed: {e}");
    }
    if let Err(e) = master.phase_switch(Phase::Nrt, 1, Duration::from_secs(10)) {
        warn!("NRT switch failed: {e}");
    }
    master.close()?;
    Ok(())
}
