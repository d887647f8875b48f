//! # HwShield - Hardware Resource Reservation for Measurement Runs
//!
//! HwShield carves out exclusive slices of shared platform resources for
//! the duration of one measurement run, so that a benchmarked workload is
//! isolated from cache pollution, frequency scaling, power management, and
//! prefetcher interference.
//!
//! ## Features
//!
//! - **Exclusive Cache Partitioning**: percentage-based L3 way carving
//!   through resctrl/CAT, with device-verified exclusive groups
//! - **Frequency Pinning**: per-CPU min = max clock pinning via cpufreq
//! - **Power Capping**: package and DRAM RAPL limits via powercap
//! - **Turbo Control**: intel_pstate and generic boost knobs together
//! - **Idle-State Depth**: disable deep C-states globally or by latency
//! - **Uncore Pinning**: per-die uncore frequency limits
//! - **Prefetcher Bits**: MSR-level control of the four L1/L2 prefetchers,
//!   replicated across hyperthread siblings
//! - **Quiescence Waiting**: thermal settling before the workload starts
//! - **Sidecar Supervision**: profilers pinned off the workload CPU and
//!   stopped with an escalating signal sequence
//! - **Full Restoration**: every reservation is snapshotted once and put
//!   back in reverse order, on failure paths included
//!
//! The control surfaces are machine-wide singletons; nothing here takes a
//! host-wide lock, so callers must serialize sessions on one machine.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use hwshield::config::{CliArgs, SessionConfig};
//! use hwshield::core::Session;
//!
//! let args = CliArgs::parse_from([
//!     "hwshield",
//!     "--cache-pct", "50",
//!     "--workload-cpu", "2",
//!     "--workload", "./bench",
//! ]);
//! let config = SessionConfig::from_cli(&args).unwrap();
//! let exit_code = Session::new(config).run().unwrap();
//! ```
//!
//! ## Topology Inspection
//!
//! ```no_run
//! use hwshield::cache::CacheTopology;
//! use std::path::Path;
//!
//! let topology = CacheTopology::discover(Path::new("/sys/fs/resctrl")).unwrap();
//! println!(
//!     "{} ways total, {} exclusive",
//!     topology.ways_total, topology.ways_exclusive_max
//! );
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod system;
pub mod tune;

// Re-export commonly used types
pub use cache::{CacheTopology, WayMask};
pub use config::{CliArgs, SessionConfig};
pub use core::Session;
pub use error::{Result, ShieldError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use hwshield::prelude::*;
    //! ```

    pub use crate::cache::{
        percent_to_exclusive_mask, validate_percent, CacheTopology, Partition,
        PartitionProgrammer, PartitionRestorer, PartitionVerifier, ResctrlFs, WayMask,
    };
    pub use crate::config::{CliArgs, ControlPaths, SessionConfig};
    pub use crate::core::{RecoveryCoordinator, RollbackAction, Session};
    pub use crate::error::{Result, ShieldError};
    pub use crate::system::{QuiesceOutcome, QuiescenceWaiter, SidecarSupervisor, StopTier};
    pub use crate::tune::{
        FrequencyController, IdleStateController, PowerCapController, PrefetcherController,
        RaplDomainKind, TurboController, UncoreFrequencyController,
    };
}
