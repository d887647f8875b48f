//! HwShield CLI - Hardware Resource Reservation
//!
//! Reserves exclusive slices of shared platform resources for one
//! measurement run and restores the defaults afterwards.

use clap::Parser;
use hwshield::cache::CacheTopology;
use hwshield::config::{CliArgs, Commands, SessionConfig};
use hwshield::core::Session;
use hwshield::error::Result;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();

    // Initialize logging; RUST_LOG wins over the -v/-q flags.
    let default_filter = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn run(args: CliArgs) -> Result<i32> {
    if let Some(command) = &args.command {
        return handle_command(command, &args);
    }

    let config = SessionConfig::from_cli(&args)?;

    let available = num_cpus::get() as u32;
    if config.workload_cpu >= available || config.tools_cpu >= available {
        warn!(
            workload_cpu = config.workload_cpu,
            tools_cpu = config.tools_cpu,
            available,
            "a configured CPU id is beyond this machine's CPU count"
        );
    }
    debug!(?config, "session configured");

    Session::new(config).run()
}

fn handle_command(command: &Commands, args: &CliArgs) -> Result<i32> {
    match command {
        Commands::Topology { json } => cmd_topology(args, *json),
    }
}

fn cmd_topology(args: &CliArgs, json: bool) -> Result<i32> {
    let config = SessionConfig::from_cli(args)?;
    let topology = CacheTopology::discover(&config.paths.resctrl)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&topology).unwrap_or_default());
    } else {
        println!("=== L3 Cache Allocation Topology ===");
        println!("Domains:          {:?}", topology.domains);
        println!("Total ways:       {}", topology.ways_total);
        println!("Shareable ways:   {}", topology.ways_shareable);
        println!("Exclusive max:    {}", topology.ways_exclusive_max);
        println!("Min contiguous:   {}", topology.min_cbm_bits);
        println!("Capability mask:  {:#x}", topology.capability_mask);
        println!("Shareable mask:   {:#x}", topology.shareable_mask);
        println!("Exclusive base:   {:#x}", topology.exclusive_base);
    }
    Ok(0)
}
