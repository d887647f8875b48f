//! Uncore frequency pinning
//!
//! Organized per physical die. A requested frequency is checked against
//! each die's platform-reported initial [min, max] range; dies outside the
//! range are skipped with a warning rather than clamped.

use super::{read_sys, write_sys_verified};
use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct DieSnapshot {
    min_khz: String,
    max_khz: String,
}

/// Pins uncore frequency per die through the intel_uncore_frequency interface
pub struct UncoreFrequencyController {
    dies: Vec<(u32, u32, PathBuf)>,
    snapshot: HashMap<(u32, u32), DieSnapshot>,
    active: bool,
}

impl UncoreFrequencyController {
    /// Discover dies under an uncore frequency root.
    ///
    /// An empty discovery is not an error; the interface may legitimately
    /// be absent.
    pub fn new(uncore_root: impl Into<PathBuf>) -> Self {
        let root = uncore_root.into();
        let mut dies = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&root) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                if let Some(ids) = parse_die_name(&name) {
                    dies.push((ids.0, ids.1, entry.path()));
                }
            }
        }
        dies.sort();
        Self {
            dies,
            snapshot: HashMap::new(),
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Pin min = max = `khz` on every die whose platform range allows it.
    pub fn apply(&mut self, khz: u64) -> Result<()> {
        if self.dies.is_empty() {
            debug!("no uncore frequency interface, skipping");
            return Ok(());
        }
        for (pkg, die, path) in self.dies.clone() {
            let initial_min: u64 = read_sys(&path.join("initial_min_freq_khz"))?
                .parse()
                .unwrap_or(0);
            let initial_max: u64 = read_sys(&path.join("initial_max_freq_khz"))?
                .parse()
                .unwrap_or(u64::MAX);
            if khz < initial_min || khz > initial_max {
                warn!(
                    pkg,
                    die, khz, initial_min, initial_max,
                    "requested uncore frequency outside die range, skipping"
                );
                continue;
            }

            if !self.snapshot.contains_key(&(pkg, die)) {
                self.snapshot.insert(
                    (pkg, die),
                    DieSnapshot {
                        min_khz: read_sys(&path.join("min_freq_khz"))?,
                        max_khz: read_sys(&path.join("max_freq_khz"))?,
                    },
                );
            }

            write_sys_verified(&path.join("max_freq_khz"), &khz.to_string())?;
            write_sys_verified(&path.join("min_freq_khz"), &khz.to_string())?;
            info!(pkg, die, khz, "uncore frequency pinned");
            self.active = true;
        }
        Ok(())
    }

    /// Restore each snapshotted die; dies never touched fall back to their
    /// platform-reported initial range.
    pub fn clear(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for (pkg, die, path) in self.dies.clone() {
            let (min, max) = match self.snapshot.get(&(pkg, die)) {
                Some(snap) => (snap.min_khz.clone(), snap.max_khz.clone()),
                None => (
                    read_sys(&path.join("initial_min_freq_khz"))?,
                    read_sys(&path.join("initial_max_freq_khz"))?,
                ),
            };
            write_sys_verified(&path.join("min_freq_khz"), &min)?;
            write_sys_verified(&path.join("max_freq_khz"), &max)?;
            info!(pkg, die, "uncore frequency restored");
        }
        self.active = false;
        Ok(())
    }
}

/// Parse `package_XX_die_YY` directory names
fn parse_die_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("package_")?;
    let (pkg, rest) = rest.split_once("_die_")?;
    Some((pkg.parse().ok()?, rest.parse().ok()?))
}
