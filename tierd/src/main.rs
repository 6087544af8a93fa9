// SPDX-License-Identifier: GPL-2.0
//
// tierd: feedback-driven page placement across a DRAM/NVRAM memory system.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod agent;
mod console;
mod counters;
mod migrate;
mod placement;
mod server;
mod state;
mod stats;
mod tier;
mod topology;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};

use crate::agent::NetlinkAgent;
use crate::counters::{BwCeilings, CounterFile};
use crate::migrate::{Migrator, MovePagesSyscall};
use crate::placement::{PlacementEngine, PlacementParams};
use crate::state::DaemonState;
use crate::stats::Metrics;
use crate::tier::TierLayout;
use crate::topology::SysfsTopology;

const DAEMON_NAME: &str = "tierd";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "tierd",
    version,
    about = "Keeps a hybrid DRAM/NVRAM system balanced by migrating hot and cold pages between tiers."
)]
struct Opts {
    /// NUMA nodes backing the fast (DRAM) tier, e.g. "0" or "0,2".
    #[clap(long, default_value = "0")]
    dram_nodes: String,

    /// NUMA nodes backing the slow (NVRAM) tier.
    #[clap(long, default_value = "1")]
    nvram_nodes: String,

    /// Capacity/bandwidth check interval in seconds.
    #[clap(long, default_value = "4")]
    memcheck_interval: u64,

    /// Write-pressure check interval in seconds.
    #[clap(long, default_value = "2")]
    writecheck_interval: u64,

    /// Settle delay between the clear-dirty hint and the writeback
    /// migration, in milliseconds.
    #[clap(long, default_value = "1000")]
    clear_delay_ms: u64,

    /// DRAM used-fraction high-water mark.
    #[clap(long, default_value = "0.90")]
    dram_limit: f64,

    /// DRAM used-fraction the threshold loop steers towards.
    #[clap(long, default_value = "0.85")]
    dram_target: f64,

    /// NVRAM used-fraction high-water mark.
    #[clap(long, default_value = "0.90")]
    nvram_limit: f64,

    /// NVRAM used-fraction the threshold loop steers towards.
    #[clap(long, default_value = "0.70")]
    nvram_target: f64,

    /// Maximum pages requested from the agent per FIND.
    #[clap(long, default_value = "256")]
    max_find: i32,

    /// DRAM:NVRAM bandwidth ratio the balance loop aims for.
    #[clap(long, default_value = "4.0")]
    bw_ratio: f32,

    /// Total-traffic noise floor in MB/s; below it the balancer idles.
    #[clap(long, default_value = "100.0")]
    bw_floor: f32,

    /// DRAM traffic ceiling in MB/s the balancer must stay under.
    #[clap(long, default_value = "150000.0")]
    dram_bw_limit: f32,

    /// NVRAM traffic ceiling in MB/s the balancer must stay under.
    #[clap(long, default_value = "20000.0")]
    nvram_bw_limit: f32,

    /// NVRAM write pressure in MB/s that triggers writeback relief.
    #[clap(long, default_value = "1000.0")]
    wr_threshold: f32,

    /// Counter values above these are treated as collector glitches and
    /// the sample is dropped (MB/s).
    #[clap(long, default_value = "200000.0")]
    dram_bw_max: f32,

    #[clap(long, default_value = "50000.0")]
    nvram_bw_max: f32,

    /// Mixed App-Direct + Memory-Mode NVRAM: the collector cannot isolate
    /// write traffic, so decisions use app-direct bandwidth instead.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pmm_mixed: bool,

    /// Bandwidth counter snapshot file maintained by the collector.
    #[clap(long, default_value = "/tmp/pcm-memdata")]
    counter_file: PathBuf,

    /// Command socket path.
    #[clap(long, default_value = "./tierd.sock")]
    socket_path: PathBuf,

    /// Start with the capacity/threshold component disabled.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_thresh: bool,

    /// Start with the bandwidth balance component disabled.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_balance: bool,

    /// Start with the write-pressure component disabled.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_writecheck: bool,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

impl Opts {
    fn placement_params(&self) -> PlacementParams {
        PlacementParams {
            dram_limit: self.dram_limit,
            nvram_limit: self.nvram_limit,
            dram_target: self.dram_target,
            nvram_target: self.nvram_target,
            max_find: self.max_find,
            bw_ratio: self.bw_ratio,
            bw_floor: self.bw_floor,
            dram_bw_limit: self.dram_bw_limit,
            nvram_bw_limit: self.nvram_bw_limit,
            wr_threshold: self.wr_threshold,
            pmm_mixed: self.pmm_mixed,
            ceilings: BwCeilings {
                dram_max: self.dram_bw_max,
                nvram_max: self.nvram_bw_max,
            },
            memcheck_interval: Duration::from_secs(self.memcheck_interval),
            writecheck_interval: Duration::from_secs(self.writecheck_interval),
            clear_delay: Duration::from_millis(self.clear_delay_ms),
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let layout = TierLayout::parse(&opts.dram_nodes, &opts.nvram_nodes)
        .map_err(|e| anyhow!("Invalid tier node lists: {}", e))?;
    info!(
        "DRAM nodes: {:?}  NVRAM nodes: {:?}  page size: {} bytes",
        layout.dram_nodes,
        layout.nvram_nodes,
        *topology::PAGE_SIZE
    );

    // Everything that can fail permanently fails here, before any loop
    // starts: agent channel, command socket, thread spawns.
    let agent = NetlinkAgent::connect()?;
    let listener = server::bind_socket(&opts.socket_path)?;

    let state = Arc::new(DaemonState::new(
        !opts.no_thresh,
        !opts.no_balance,
        !opts.no_writecheck,
    ));
    let metrics = Arc::new(Metrics::default());
    let topo: Arc<dyn topology::TierTopology> = Arc::new(SysfsTopology::new(layout));
    let migrator = Migrator::new(topo.clone(), Arc::new(MovePagesSyscall), metrics.clone());
    let engine = Arc::new(PlacementEngine::new(
        Box::new(agent),
        topo,
        migrator,
        state.clone(),
        opts.placement_params(),
        metrics,
    ));

    let sig_state = state.clone();
    ctrlc::set_handler(move || {
        sig_state.shutdown.trigger();
    })
    .context("Error setting Ctrl-C handler")?;

    let memcheck_thread: JoinHandle<()> = {
        let engine = engine.clone();
        let mut counters = CounterFile::new(opts.counter_file.clone());
        std::thread::Builder::new()
            .name("memcheck".into())
            .spawn(move || placement::run_memcheck(&engine, &mut counters))
            .context("Error spawning memcheck thread")?
    };

    let writecheck_thread: JoinHandle<()> = {
        let engine = engine.clone();
        let mut counters = CounterFile::new(opts.counter_file.clone());
        std::thread::Builder::new()
            .name("writecheck".into())
            .spawn(move || placement::run_writecheck(&engine, &mut counters))
            .context("Error spawning writecheck thread")?
    };

    let server_thread: JoinHandle<()> = {
        let engine = engine.clone();
        let socket_path = opts.socket_path.clone();
        std::thread::Builder::new()
            .name("server".into())
            .spawn(move || server::run_server(listener, &socket_path, engine))
            .context("Error spawning socket thread")?
    };

    let console_thread: JoinHandle<()> = {
        let engine = engine.clone();
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || console::run_console(engine))
            .context("Error spawning console thread")?
    };

    // The loops and the server all exit once the shutdown token fires
    // (console `exit`, client EOF on stdin, or SIGINT).
    let _ = memcheck_thread.join();
    let _ = writecheck_thread.join();
    let _ = server_thread.join();
    info!("Exiting {}...", DAEMON_NAME);

    // The console thread may still be parked in a blocking stdin read if
    // shutdown came from SIGINT; give it a moment, then detach.
    let mut joined = false;
    for _ in 0..10 {
        if console_thread.is_finished() {
            let _ = console_thread.join();
            joined = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if !joined {
        warn!("Console thread still blocked on stdin, detaching");
    }

    Ok(())
}
