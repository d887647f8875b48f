//! System-level utilities used around the controllers

mod cpus;
mod quiesce;
mod sidecar;

pub use cpus::{online_cpus, sibling_threads};
pub use quiesce::{QuiesceOutcome, QuiescenceWaiter};
pub use sidecar::{SidecarHandle, SidecarSupervisor, StopTier};
