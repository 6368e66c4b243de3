//! Memory System Simulator CLI.
//!
//! Parses the command line, installs the log subscriber, builds the
//! configured system and drives its event loop.
//!
//! # Usage
//!
//! The simulator runs a configured system until its event queue empties, a
//! component requests an exit, or the tick limit is reached. It can then
//! drain the system into a checkpoint, and a later run can resume from it.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

extern crate memsim;

use memsim::common::SimError;
use memsim::config::Config;
use memsim::sim::ExitCause;
use memsim::soc::{System, SystemCheckpoint};
use memsim::stats::SimStats;

/// Command-line arguments for the memory system simulator.
#[derive(Parser, Debug)]
#[command(author, version, about = "Discrete-Event Memory System Simulator")]
struct Args {
    /// TOML configuration; the built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Stop once the next event lies beyond this tick.
    #[arg(long)]
    max_tick: Option<u64>,

    /// Drain the system after the run and write a checkpoint here.
    #[arg(long)]
    checkpoint: Option<String>,

    /// Resume from a checkpoint written by `--checkpoint`.
    #[arg(long)]
    restore: Option<String>,

    /// Print the pending events when the run stops.
    #[arg(long)]
    dump_queue: bool,
}

/// Main entry point for the memory system simulator.
///
/// # Behavior
///
/// 1. **Configuration**: Parses arguments and loads the TOML configuration.
/// 2. **Initialization**: Builds the `System`, or restores it from a checkpoint.
/// 3. **Simulation Loop**: Services events until an exit condition is met.
/// 4. **Teardown**: Prints statistics and optionally writes a checkpoint.
fn main() {
    let args = Args::parse();
    init_tracing();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[!] FATAL: {e}");
            process::exit(1);
        }
    };

    print_config(&config);

    let mut stats = SimStats::new();
    match run(&args, &config, &mut stats) {
        Ok(cause) => {
            println!("\n[*] Exiting @ tick {} because {}", stats.sim_ticks, cause);
            stats.print();
        }
        Err(e) => {
            eprintln!("\n[!] FATAL: {e}");
            if let SimError::EventFailed { .. } = &e {
                eprintln!("[!] root cause: {}", e.root_cause());
            }
            stats.print();
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let default = if cfg!(feature = "always-trace") {
        "trace"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args, config: &Config, stats: &mut SimStats) -> Result<ExitCause, SimError> {
    let system = match &args.restore {
        Some(path) => {
            let cp = SystemCheckpoint::load(path)?;
            println!("[Restore] Resuming from {} at tick {}", path, cp.queue.cur_tick);
            System::restore(config, &cp)?
        }
        None => System::new(config)?,
    };

    let max_tick = args.max_tick.unwrap_or(config.sim.max_tick);
    let result = system.run(max_tick);
    system.collect_stats(stats);
    let cause = result?;
    stats.exit_cause = cause.to_string();

    if args.dump_queue {
        println!("{}", system.queue().dump());
    }

    if let Some(path) = &args.checkpoint {
        let cp = system.checkpoint()?;
        cp.save(path)?;
        system.collect_stats(stats);
        println!("[Checkpoint] Drained at tick {}, written to {}", cp.queue.cur_tick, path);
    }
    Ok(cause)
}

fn print_config(config: &Config) {
    println!("Global Configuration");
    println!("--------------------");
    println!("Simulation:");
    println!("  Event Queue:        {}", config.sim.name);
    println!("  Max Tick:           {}", config.sim.max_tick);
    println!("Traffic:");
    println!("  Mode:               {:?}", config.traffic.mode);
    println!("  Start Address:      {:#x}", config.traffic.start_addr);
    println!("  Stride / Span:      {} / {:#x}", config.traffic.stride, config.traffic.span);
    println!("  Accesses:           {}", config.traffic.count);
    println!("  Access Size:        {} bytes", config.traffic.size);
    println!("  Write Interval:     {}", config.traffic.write_interval);
    println!("  Max Outstanding:    {}", config.traffic.max_outstanding);
    println!("Cache ({}):", config.cache.name);
    println!("  Block Size:         {} bytes", config.cache.blk_size);
    println!("  Hit Latency:        {}", config.cache.hit_latency);
    println!("  MSHRs:              {}", config.cache.mshrs);
    println!("  Targets per MSHR:   {}", config.cache.targets_per_mshr);
    println!("Bus:");
    println!("  Name:               {} (id {})", config.bus.name, config.bus.bus_id);
    println!("Memory:");
    for (i, m) in config.memory.iter().enumerate() {
        println!(
            "  [{}] {:#x} + {:#x}   {:?} controller",
            i, m.base, m.size, m.controller
        );
    }
    println!("--------------------");
}
