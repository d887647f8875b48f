//! Single-resource snapshot/apply/verify/restore controllers
//!
//! Six structurally identical controllers: frequency, power caps, turbo,
//! idle states, uncore frequency, and hardware prefetchers. Each captures
//! the pre-modification value of a unit on first touch, never overwrites
//! that snapshot within a session, warns (without aborting) when a readback
//! disagrees, and skips units whose control interface does not exist on the
//! platform.

mod frequency;
mod idle;
mod powercap;
mod prefetch;
mod turbo;
mod uncore;

pub use frequency::FrequencyController;
pub use idle::IdleStateController;
pub use powercap::{PowerCapController, RaplDomainKind};
pub use prefetch::PrefetcherController;
pub use turbo::TurboController;
pub use uncore::UncoreFrequencyController;

use crate::error::{IoResultExt, Result};
use std::path::Path;
use tracing::warn;

/// Read a sysfs value, trimmed
pub(crate) fn read_sys(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .with_path(path)
}

/// Write a sysfs value
pub(crate) fn write_sys(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).with_path(path)
}

/// Write a sysfs value, read it back, and warn if the device disagrees.
///
/// Returns whether the readback matched. A disagreement here degrades
/// measurement quality but not allocation correctness, so it never aborts.
pub(crate) fn write_sys_verified(path: &Path, value: &str) -> Result<bool> {
    write_sys(path, value)?;
    let actual = read_sys(path)?;
    let matched = actual == value;
    if !matched {
        warn!(
            path = %path.display(),
            requested = value,
            actual,
            "readback disagrees with request"
        );
    }
    Ok(matched)
}
