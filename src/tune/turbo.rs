//! Turbo/boost control
//!
//! Two knobs with inverted polarity from each other: intel_pstate's
//! `no_turbo` (1 = turbo off) and the generic cpufreq `boost` (1 = boost
//! on). "off" flips both at once; a readback mismatch on either knob is a
//! warning, not an abort.

use super::{read_sys, write_sys_verified};
use crate::config::TurboState;
use crate::error::Result;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
struct TurboSnapshot {
    no_turbo: Option<String>,
    boost: Option<String>,
}

/// Controls turbo/boost state through both platform knobs
pub struct TurboController {
    no_turbo_path: PathBuf,
    boost_path: PathBuf,
    snapshot: Option<TurboSnapshot>,
    active: bool,
}

impl TurboController {
    /// Create a controller over a sysfs CPU base directory
    pub fn new(cpu_base: impl Into<PathBuf>) -> Self {
        let base = cpu_base.into();
        Self {
            no_turbo_path: base.join("intel_pstate/no_turbo"),
            boost_path: base.join("cpufreq/boost"),
            snapshot: None,
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Set both knobs to the requested state.
    ///
    /// Absent knobs are skipped; a platform typically exposes only one of
    /// the two interfaces.
    pub fn apply(&mut self, state: TurboState) -> Result<()> {
        self.capture_once();

        let (no_turbo, boost) = match state {
            TurboState::Off => ("1", "0"),
            TurboState::On => ("0", "1"),
        };

        let mut touched = false;
        if self.no_turbo_path.is_file() {
            write_sys_verified(&self.no_turbo_path, no_turbo)?;
            touched = true;
        } else {
            debug!("no intel_pstate/no_turbo knob, skipping");
        }
        if self.boost_path.is_file() {
            write_sys_verified(&self.boost_path, boost)?;
            touched = true;
        } else {
            debug!("no cpufreq/boost knob, skipping");
        }

        if touched {
            info!(?state, "turbo state applied");
            self.active = true;
        }
        Ok(())
    }

    /// Restore both knobs to their snapshot values, or re-enable turbo as
    /// the platform default when nothing was snapshotted.
    pub fn clear(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let snap = self.snapshot.clone().unwrap_or_default();
        if self.no_turbo_path.is_file() {
            let value = snap.no_turbo.as_deref().unwrap_or("0");
            write_sys_verified(&self.no_turbo_path, value)?;
        }
        if self.boost_path.is_file() {
            let value = snap.boost.as_deref().unwrap_or("1");
            write_sys_verified(&self.boost_path, value)?;
        }
        info!("turbo state restored");
        self.active = false;
        Ok(())
    }

    fn capture_once(&mut self) {
        if self.snapshot.is_some() {
            return;
        }
        self.snapshot = Some(TurboSnapshot {
            no_turbo: read_sys(&self.no_turbo_path).ok(),
            boost: read_sys(&self.boost_path).ok(),
        });
    }
}
