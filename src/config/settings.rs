//! Configuration settings for HwShield
//!
//! Defines all CLI arguments, their typed equivalents, and the pure
//! parsing helpers. Everything here is validated before any hardware
//! interface is touched; a failure at this stage is always fatal and
//! never requires cleanup.

use crate::error::{Result, ShieldError};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HwShield - hardware resource reservation for isolated measurement runs
#[derive(Parser, Debug, Clone)]
#[command(name = "hwshield")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reserve exclusive slices of shared platform resources for a measurement run")]
#[command(long_about = r#"
HwShield carves out exclusive slices of shared platform resources (last-level
cache ways, CPU frequency, RAPL power budgets, turbo state, idle-state depth,
uncore frequency, hardware prefetchers) for the duration of one measurement
run, verifies every reservation against device-reported state, and restores
the prior defaults on both success and failure paths.

Examples:
  hwshield --cache-pct 50 --workload-cpu 2 --tools-cpu 0 --workload "./bench"
  hwshield --turbo off --freq 2.4 --pkg-cap 95 --dram-cap off --workload "./bench"
  hwshield --prefetch 1011 --workload-cpu 4 --tools-cpu 0 --workload "./bench"
  hwshield topology
"#)]
pub struct CliArgs {
    /// Exclusive cache percentage for the workload (1-100)
    #[arg(long, value_name = "PCT")]
    pub cache_pct: Option<u32>,

    /// CPU id the measured workload is pinned to
    #[arg(long, default_value = "1", value_name = "CPU")]
    pub workload_cpu: u32,

    /// CPU id profiling tools and background tasks are pinned to
    #[arg(long, default_value = "0", value_name = "CPU")]
    pub tools_cpu: u32,

    /// Turbo/boost state for the run
    #[arg(long, value_enum, value_name = "STATE")]
    pub turbo: Option<TurboState>,

    /// Package power cap in watts, or "off" to restore the platform default
    #[arg(long, value_name = "WATTS|off")]
    pub pkg_cap: Option<String>,

    /// DRAM power cap in watts, or "off" to restore the platform default
    #[arg(long, value_name = "WATTS|off")]
    pub dram_cap: Option<String>,

    /// Pin core frequency to this value in GHz, or "off" to leave it alone
    #[arg(long, value_name = "GHZ|off")]
    pub freq: Option<String>,

    /// CPUs the frequency pin applies to (e.g. "2" or "0,2-4"); defaults to the workload CPU
    #[arg(long, value_name = "CPULIST")]
    pub freq_cpus: Option<String>,

    /// Uncore frequency pin in GHz, or "off"
    #[arg(long, value_name = "GHZ|off")]
    pub uncore: Option<String>,

    /// Idle states: "off" disables all, an integer disables states above that exit latency (us)
    #[arg(long, value_name = "off|LATENCY")]
    pub idle: Option<String>,

    /// Prefetcher spec: "on", "off", or a 4-bit pattern over
    /// {L2 streamer, L2 adjacent, L1D streamer, L1D IP}, 1 = enabled
    #[arg(long, value_name = "on|off|BITS")]
    pub prefetch: Option<String>,

    /// Workload command to run inside the reservation (pinned to the workload CPU)
    #[arg(long, value_name = "CMD")]
    pub workload: Option<String>,

    /// Sidecar profiler to supervise, as "name=command" (repeatable)
    #[arg(long, value_name = "NAME=CMD")]
    pub sidecar: Vec<String>,

    /// Minimum settle sleep before the workload starts
    #[arg(long, default_value = "45s", value_name = "DUR")]
    pub quiesce_min_sleep: humantime::Duration,

    /// Thermal reading at or below which the system counts as settled
    #[arg(long, default_value = "50000", value_name = "MILLIDEG")]
    pub quiesce_target: i64,

    /// Maximum total time to wait for quiescence
    #[arg(long, default_value = "600s", value_name = "DUR")]
    pub quiesce_max_wait: humantime::Duration,

    /// Interval between thermal polls
    #[arg(long, default_value = "5s", value_name = "DUR")]
    pub quiesce_step: humantime::Duration,

    /// Thermal sensor file to poll (auto-detected when omitted)
    #[arg(long, value_name = "PATH")]
    pub quiesce_sensor: Option<PathBuf>,

    /// Privilege wrapper for sidecar launches and control writes
    #[arg(long, default_value = "sudo", value_name = "CMD", hide = true)]
    pub privilege_cmd: String,

    /// Override the resctrl mount point (bring-up and tests only)
    #[arg(long, value_name = "PATH", hide = true)]
    pub resctrl_root: Option<PathBuf>,

    /// Override the sysfs root (bring-up and tests only)
    #[arg(long, value_name = "PATH", hide = true)]
    pub sysfs_root: Option<PathBuf>,

    /// Print the plan without touching any hardware interface
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Discover and print the cache-allocation topology
    #[command(name = "topology")]
    Topology {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Requested turbo/boost state
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurboState {
    /// Turbo and boost enabled
    On,
    /// Turbo and boost disabled
    Off,
}

/// A power-cap request for one RAPL domain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PowerCapRequest {
    /// Cap the domain at this many watts
    Watts(f64),
    /// Restore the platform default instead of setting a literal cap
    Off,
}

/// A frequency-pin request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FreqRequest {
    /// Pin min = max to this frequency in kHz
    Khz(u64),
    /// Leave frequency scaling alone / restore defaults
    Off,
}

/// An idle-state request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdleRequest {
    /// Disable every idle state
    DisableAll,
    /// Disable idle states whose exit latency exceeds this many microseconds
    MaxLatencyUs(u64),
}

/// User-facing prefetcher request
///
/// Pattern bit order is {L2 streamer, L2 adjacent, L1D streamer, L1D IP},
/// most significant first, and 1 means *enabled*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefetchSpec {
    /// All four prefetch units enabled
    On,
    /// All four prefetch units disabled
    Off,
    /// Explicit enable pattern, low 4 bits significant
    Pattern(u8),
}

impl PrefetchSpec {
    /// The enable pattern as a 4-bit value (1 = enabled)
    pub fn enable_bits(self) -> u8 {
        match self {
            PrefetchSpec::On => 0b1111,
            PrefetchSpec::Off => 0b0000,
            PrefetchSpec::Pattern(bits) => bits & 0xF,
        }
    }
}

/// One supervised sidecar process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarSpec {
    /// Short name used in logs
    pub name: String,
    /// Shell command to launch
    pub command: String,
}

/// Quiescence-wait settings
///
/// The threshold and step values are empirically chosen constants, kept
/// configurable rather than derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuiesceSettings {
    /// Unconditional minimum settle sleep
    pub min_sleep: Duration,
    /// Reading at or below this counts as settled (millidegrees C)
    pub target: i64,
    /// Maximum total wait including the minimum sleep
    pub max_wait: Duration,
    /// Poll interval
    pub step: Duration,
    /// Sensor file to poll; None means auto-detect
    pub sensor: Option<PathBuf>,
}

/// Filesystem roots for every control surface the controllers touch
///
/// All controllers address their control files relative to these paths, so
/// tests can point them at a fake tree and production uses the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPaths {
    /// resctrl mount point
    pub resctrl: PathBuf,
    /// Base of per-CPU sysfs entries (`.../cpu<N>/...`)
    pub cpu_base: PathBuf,
    /// RAPL powercap root
    pub powercap: PathBuf,
    /// Uncore frequency root
    pub uncore: PathBuf,
    /// Base of per-CPU MSR device nodes (`.../cpu/<N>/msr`)
    pub msr_base: PathBuf,
    /// Thermal zone root used for sensor auto-detection
    pub thermal: PathBuf,
}

impl Default for ControlPaths {
    fn default() -> Self {
        Self {
            resctrl: PathBuf::from("/sys/fs/resctrl"),
            cpu_base: PathBuf::from("/sys/devices/system/cpu"),
            powercap: PathBuf::from("/sys/class/powercap"),
            uncore: PathBuf::from("/sys/devices/system/cpu/intel_uncore_frequency"),
            msr_base: PathBuf::from("/dev/cpu"),
            thermal: PathBuf::from("/sys/class/thermal"),
        }
    }
}

impl ControlPaths {
    /// Derive paths from CLI overrides
    fn from_cli(args: &CliArgs) -> Self {
        let mut paths = Self::default();
        if let Some(root) = &args.resctrl_root {
            paths.resctrl = root.clone();
        }
        if let Some(root) = &args.sysfs_root {
            paths.cpu_base = root.join("devices/system/cpu");
            paths.powercap = root.join("class/powercap");
            paths.uncore = root.join("devices/system/cpu/intel_uncore_frequency");
            paths.thermal = root.join("class/thermal");
            paths.msr_base = root.join("dev/cpu");
        }
        paths
    }
}

/// Fully validated session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Exclusive cache percentage, if cache partitioning was requested
    pub cache_pct: Option<u32>,
    /// CPU the measured workload runs on
    pub workload_cpu: u32,
    /// CPU profiling tools run on
    pub tools_cpu: u32,
    /// Turbo request
    pub turbo: Option<TurboState>,
    /// Package power cap request
    pub pkg_cap: Option<PowerCapRequest>,
    /// DRAM power cap request
    pub dram_cap: Option<PowerCapRequest>,
    /// Frequency pin request
    pub freq: Option<FreqRequest>,
    /// CPUs the frequency pin applies to
    pub freq_cpus: Vec<u32>,
    /// Uncore frequency pin request
    pub uncore: Option<FreqRequest>,
    /// Idle-state request
    pub idle: Option<IdleRequest>,
    /// Prefetcher request
    pub prefetch: Option<PrefetchSpec>,
    /// Workload command, pinned to the workload CPU
    pub workload: Option<String>,
    /// Supervised sidecar profilers
    pub sidecars: Vec<SidecarSpec>,
    /// Quiescence settings
    pub quiesce: QuiesceSettings,
    /// Privilege wrapper command
    pub privilege_cmd: String,
    /// Control surface roots
    pub paths: ControlPaths,
    /// Plan-only mode
    pub dry_run: bool,
}

impl SessionConfig {
    /// Build and validate a session configuration from CLI arguments.
    ///
    /// Every check here happens before any hardware interface is opened;
    /// a failure is a plain `ValidationError` with nothing to clean up.
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        if args.workload_cpu == args.tools_cpu {
            return Err(ShieldError::validation(format!(
                "workload CPU and tools CPU must differ (both are {})",
                args.workload_cpu
            )));
        }

        if let Some(pct) = args.cache_pct {
            if !(1..=100).contains(&pct) {
                return Err(ShieldError::validation(format!(
                    "cache percentage must be in 1..=100, got {pct}"
                )));
            }
        }

        let freq = args.freq.as_deref().map(parse_ghz).transpose()?;
        let freq_cpus = match &args.freq_cpus {
            Some(list) => parse_cpu_list(list)?,
            None => vec![args.workload_cpu],
        };
        if freq.is_some() && freq_cpus.is_empty() {
            return Err(ShieldError::validation(
                "frequency pin requested but the CPU list is empty",
            ));
        }

        Ok(Self {
            cache_pct: args.cache_pct,
            workload_cpu: args.workload_cpu,
            tools_cpu: args.tools_cpu,
            turbo: args.turbo,
            pkg_cap: args.pkg_cap.as_deref().map(parse_watts).transpose()?,
            dram_cap: args.dram_cap.as_deref().map(parse_watts).transpose()?,
            freq,
            freq_cpus,
            uncore: args.uncore.as_deref().map(parse_ghz).transpose()?,
            idle: args.idle.as_deref().map(parse_idle).transpose()?,
            prefetch: args.prefetch.as_deref().map(parse_prefetch).transpose()?,
            workload: args.workload.clone(),
            sidecars: args
                .sidecar
                .iter()
                .map(|s| parse_sidecar(s))
                .collect::<Result<Vec<_>>>()?,
            quiesce: QuiesceSettings {
                min_sleep: args.quiesce_min_sleep.into(),
                target: args.quiesce_target,
                max_wait: args.quiesce_max_wait.into(),
                step: args.quiesce_step.into(),
                sensor: args.quiesce_sensor.clone(),
            },
            privilege_cmd: args.privilege_cmd.clone(),
            paths: ControlPaths::from_cli(args),
            dry_run: args.dry_run,
        })
    }
}

/// Parse a power-cap argument: a positive watt value or "off"
pub fn parse_watts(input: &str) -> Result<PowerCapRequest> {
    if input.eq_ignore_ascii_case("off") {
        return Ok(PowerCapRequest::Off);
    }
    let watts: f64 = input
        .parse()
        .map_err(|_| ShieldError::validation(format!("invalid watt value '{input}'")))?;
    if !watts.is_finite() || watts <= 0.0 {
        return Err(ShieldError::validation(format!(
            "power cap must be a positive watt value, got '{input}'"
        )));
    }
    Ok(PowerCapRequest::Watts(watts))
}

/// Parse a frequency argument: GHz value or "off", returned in kHz
pub fn parse_ghz(input: &str) -> Result<FreqRequest> {
    if input.eq_ignore_ascii_case("off") {
        return Ok(FreqRequest::Off);
    }
    let ghz: f64 = input
        .parse()
        .map_err(|_| ShieldError::validation(format!("invalid GHz value '{input}'")))?;
    if !ghz.is_finite() || ghz <= 0.0 || ghz > 20.0 {
        return Err(ShieldError::validation(format!(
            "frequency must be a positive GHz value, got '{input}'"
        )));
    }
    Ok(FreqRequest::Khz((ghz * 1_000_000.0).round() as u64))
}

/// Parse an idle-state argument: "off" disables all states, an integer
/// disables states above that exit latency in microseconds
pub fn parse_idle(input: &str) -> Result<IdleRequest> {
    if input.eq_ignore_ascii_case("off") {
        return Ok(IdleRequest::DisableAll);
    }
    let latency: u64 = input.parse().map_err(|_| {
        ShieldError::validation(format!(
            "idle spec must be 'off' or a latency in microseconds, got '{input}'"
        ))
    })?;
    Ok(IdleRequest::MaxLatencyUs(latency))
}

/// Parse a prefetcher argument: "on", "off", or a 4-bit pattern like "1011"
pub fn parse_prefetch(input: &str) -> Result<PrefetchSpec> {
    match input.to_ascii_lowercase().as_str() {
        "on" => Ok(PrefetchSpec::On),
        "off" => Ok(PrefetchSpec::Off),
        pattern => {
            if pattern.len() != 4 || !pattern.bytes().all(|b| b == b'0' || b == b'1') {
                return Err(ShieldError::validation(format!(
                    "prefetch spec must be 'on', 'off', or 4 binary digits, got '{input}'"
                )));
            }
            let bits = u8::from_str_radix(pattern, 2)
                .map_err(|_| ShieldError::validation(format!("invalid pattern '{input}'")))?;
            Ok(PrefetchSpec::Pattern(bits))
        }
    }
}

/// Parse a sidecar argument of the form "name=command"
fn parse_sidecar(input: &str) -> Result<SidecarSpec> {
    let (name, command) = input.split_once('=').ok_or_else(|| {
        ShieldError::validation(format!("sidecar spec must be 'name=command', got '{input}'"))
    })?;
    if name.is_empty() || command.is_empty() {
        return Err(ShieldError::validation(format!(
            "sidecar spec must name both sides of '=', got '{input}'"
        )));
    }
    Ok(SidecarSpec {
        name: name.to_string(),
        command: command.to_string(),
    })
}

/// Parse a CPU-range expression: single ids and `a-b` ranges, comma-separated.
///
/// Returns the ids in ascending order with duplicates removed. This is the
/// same grammar the kernel uses for cpulist-format sysfs files, so it also
/// parses `thread_siblings_list` and resctrl `cpus_list` contents.
pub fn parse_cpu_list(input: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start
                .trim()
                .parse()
                .map_err(|_| ShieldError::validation(format!("invalid CPU range '{part}'")))?;
            let end: u32 = end
                .trim()
                .parse()
                .map_err(|_| ShieldError::validation(format!("invalid CPU range '{part}'")))?;
            if start > end {
                return Err(ShieldError::validation(format!(
                    "CPU range start must be <= end in '{part}'"
                )));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: u32 = part
                .parse()
                .map_err(|_| ShieldError::validation(format!("invalid CPU id '{part}'")))?;
            cpus.push(cpu);
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watts() {
        assert_eq!(parse_watts("95").unwrap(), PowerCapRequest::Watts(95.0));
        assert_eq!(parse_watts("12.5").unwrap(), PowerCapRequest::Watts(12.5));
        assert_eq!(parse_watts("off").unwrap(), PowerCapRequest::Off);
        assert_eq!(parse_watts("OFF").unwrap(), PowerCapRequest::Off);
        assert!(parse_watts("-3").is_err());
        assert!(parse_watts("lots").is_err());
    }

    #[test]
    fn test_parse_ghz() {
        assert_eq!(parse_ghz("2.4").unwrap(), FreqRequest::Khz(2_400_000));
        assert_eq!(parse_ghz("off").unwrap(), FreqRequest::Off);
        assert!(parse_ghz("0").is_err());
        assert!(parse_ghz("fast").is_err());
    }

    #[test]
    fn test_parse_prefetch() {
        assert_eq!(parse_prefetch("on").unwrap(), PrefetchSpec::On);
        assert_eq!(parse_prefetch("off").unwrap(), PrefetchSpec::Off);
        assert_eq!(parse_prefetch("1011").unwrap(), PrefetchSpec::Pattern(0b1011));
        assert_eq!(parse_prefetch("1011").unwrap().enable_bits(), 0b1011);
        assert!(parse_prefetch("10111").is_err());
        assert!(parse_prefetch("10a1").is_err());
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
        assert_eq!(parse_cpu_list("0,2-4").unwrap(), vec![0, 2, 3, 4]);
        assert_eq!(parse_cpu_list("4,2-3,2").unwrap(), vec![2, 3, 4]);
        assert_eq!(parse_cpu_list("0,32").unwrap(), vec![0, 32]);
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn test_parse_idle() {
        assert_eq!(parse_idle("off").unwrap(), IdleRequest::DisableAll);
        assert_eq!(parse_idle("200").unwrap(), IdleRequest::MaxLatencyUs(200));
        assert!(parse_idle("deep").is_err());
    }

    #[test]
    fn test_parse_sidecar() {
        let spec = parse_sidecar("turbostat=turbostat --interval 1").unwrap();
        assert_eq!(spec.name, "turbostat");
        assert_eq!(spec.command, "turbostat --interval 1");
        assert!(parse_sidecar("nocommand").is_err());
        assert!(parse_sidecar("=cmd").is_err());
    }

    #[test]
    fn test_session_config_rejects_same_cpus() {
        let args = CliArgs::parse_from(["hwshield", "--workload-cpu", "2", "--tools-cpu", "2"]);
        assert!(SessionConfig::from_cli(&args).is_err());
    }

    #[test]
    fn test_session_config_defaults_freq_cpus_to_workload_cpu() {
        let args = CliArgs::parse_from(["hwshield", "--workload-cpu", "3", "--freq", "2.0"]);
        let config = SessionConfig::from_cli(&args).unwrap();
        assert_eq!(config.freq, Some(FreqRequest::Khz(2_000_000)));
        assert_eq!(config.freq_cpus, vec![3]);
    }

    #[test]
    fn test_session_config_rejects_bad_pct() {
        let args = CliArgs::parse_from(["hwshield", "--cache-pct", "0"]);
        assert!(SessionConfig::from_cli(&args).is_err());
        let args = CliArgs::parse_from(["hwshield", "--cache-pct", "101"]);
        assert!(SessionConfig::from_cli(&args).is_err());
    }
}
