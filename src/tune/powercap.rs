//! RAPL power-cap control
//!
//! Discovers package and DRAM powercap domains, snapshots their limits on
//! first touch, and converts between watts and the interface's microwatts.
//! Clearing a domain that was never snapshotted falls back to the
//! platform-reported maximum limit instead of failing.

use super::{read_sys, write_sys_verified};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// The RAPL domain classes the controller caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaplDomainKind {
    /// Whole-package domain
    Package,
    /// DRAM subdomain
    Dram,
}

#[derive(Debug, Clone)]
struct RaplDomain {
    kind: RaplDomainKind,
    name: String,
    path: PathBuf,
}

/// Caps package/DRAM power through the powercap interface
pub struct PowerCapController {
    domains: Vec<RaplDomain>,
    snapshot: HashMap<usize, u64>,
    active: bool,
}

impl PowerCapController {
    /// Discover RAPL domains under a powercap root.
    ///
    /// An empty discovery is not an error; RAPL may not exist on a given
    /// platform and each apply then becomes a logged skip.
    pub fn new(powercap_root: impl Into<PathBuf>) -> Self {
        let root = powercap_root.into();
        let mut domains = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() || !entry.file_name().to_string_lossy().starts_with("intel-rapl")
                {
                    continue;
                }
                if let Ok(name) = read_sys(&path.join("name")) {
                    let kind = if name.starts_with("package") {
                        RaplDomainKind::Package
                    } else if name == "dram" {
                        RaplDomainKind::Dram
                    } else {
                        continue;
                    };
                    domains.push(RaplDomain { kind, name, path });
                }
            }
        }
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            domains,
            snapshot: HashMap::new(),
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Cap every domain of the given kind at `watts`.
    pub fn apply(&mut self, kind: RaplDomainKind, watts: f64) -> Result<()> {
        let uw = watts_to_microwatts(watts);
        let mut touched = false;
        for idx in self.domain_indices(kind) {
            let limit_path = self.domains[idx].path.join("constraint_0_power_limit_uw");
            if !limit_path.is_file() {
                debug!(domain = self.domains[idx].name, "no power limit file, skipping");
                continue;
            }
            if !self.snapshot.contains_key(&idx) {
                // Only numeric readings are worth keeping; an unparseable
                // limit leaves clear() on its reported-maximum fallback.
                match read_sys(&limit_path)?.parse::<u64>() {
                    Ok(current) => {
                        self.snapshot.insert(idx, current);
                    }
                    Err(_) => {
                        debug!(
                            domain = self.domains[idx].name,
                            "current limit unreadable, not snapshotting"
                        );
                    }
                }
            }
            write_sys_verified(&limit_path, &uw.to_string())?;
            info!(domain = self.domains[idx].name, watts, "power cap applied");
            touched = true;
        }
        if touched {
            self.active = true;
        } else {
            debug!(?kind, "no RAPL domain of this kind present");
        }
        Ok(())
    }

    /// Restore every domain of the given kind to its pre-apply limit.
    ///
    /// Without a snapshot the platform-reported maximum is used as the
    /// default, read lazily at clear time.
    pub fn clear(&mut self, kind: RaplDomainKind) -> Result<()> {
        for idx in self.domain_indices(kind) {
            let domain = &self.domains[idx];
            let limit_path = domain.path.join("constraint_0_power_limit_uw");
            if !limit_path.is_file() {
                continue;
            }
            let restore_uw = match self.snapshot.get(&idx) {
                Some(&uw) => uw,
                None => match read_sys(&domain.path.join("constraint_0_max_power_uw")) {
                    Ok(text) => match text.parse() {
                        Ok(uw) => uw,
                        Err(_) => continue,
                    },
                    Err(_) => {
                        debug!(domain = domain.name, "no default limit to restore");
                        continue;
                    }
                },
            };
            write_sys_verified(&limit_path, &restore_uw.to_string())?;
            info!(
                domain = domain.name,
                watts = microwatts_to_watts(restore_uw),
                "power cap restored"
            );
        }
        self.active = false;
        Ok(())
    }

    fn domain_indices(&self, kind: RaplDomainKind) -> Vec<usize> {
        self.domains
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind == kind)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Convert watts to the interface's microwatt unit
pub fn watts_to_microwatts(watts: f64) -> u64 {
    (watts * 1_000_000.0).round() as u64
}

/// Convert microwatts back to watts
pub fn microwatts_to_watts(uw: u64) -> f64 {
    uw as f64 / 1_000_000.0
}
