//! CPU idle-state depth control
//!
//! The snapshot is a list of (state-name, disable-value) pairs taken from
//! one reference CPU. Restore re-applies each named state's value across
//! every CPU that exposes a state of that name; matching is by name, not
//! index, because state indices can differ across CPUs. Without a snapshot
//! the fallback is to enable all idle states.

use super::{read_sys, write_sys_verified};
use crate::config::IdleRequest;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Controls idle-state availability through the cpuidle interface
pub struct IdleStateController {
    cpu_base: PathBuf,
    snapshot: Vec<(String, String)>,
    active: bool,
}

impl IdleStateController {
    /// Create a controller over a sysfs CPU base directory
    pub fn new(cpu_base: impl Into<PathBuf>) -> Self {
        Self {
            cpu_base: cpu_base.into(),
            snapshot: Vec::new(),
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Disable idle states on every CPU per the request.
    ///
    /// The pre-modification values are snapshotted from `reference_cpu`
    /// before anything is written.
    pub fn apply(&mut self, request: IdleRequest, reference_cpu: u32) -> Result<()> {
        let cpus = self.cpuidle_cpus();
        if cpus.is_empty() {
            debug!("no cpuidle interface, skipping");
            return Ok(());
        }

        self.capture_once(reference_cpu)?;

        for cpu in &cpus {
            for state in self.state_dirs(*cpu) {
                let disable = match request {
                    IdleRequest::DisableAll => true,
                    IdleRequest::MaxLatencyUs(limit) => {
                        let latency: u64 = read_sys(&state.join("latency"))
                            .ok()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0);
                        latency > limit
                    }
                };
                if disable {
                    write_sys_verified(&state.join("disable"), "1")?;
                }
            }
        }
        info!(?request, cpus = cpus.len(), "idle states applied");
        self.active = true;
        Ok(())
    }

    /// Restore idle states on every CPU.
    ///
    /// With a snapshot, each named state gets its snapshotted value back;
    /// without one, every state is re-enabled.
    pub fn clear(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for cpu in self.cpuidle_cpus() {
            for state in self.state_dirs(cpu) {
                let value = if self.snapshot.is_empty() {
                    Some("0".to_string())
                } else {
                    let name = read_sys(&state.join("name")).unwrap_or_default();
                    self.snapshot
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, v)| v.clone())
                };
                if let Some(value) = value {
                    write_sys_verified(&state.join("disable"), &value)?;
                }
            }
        }
        info!("idle states restored");
        self.active = false;
        Ok(())
    }

    fn capture_once(&mut self, reference_cpu: u32) -> Result<()> {
        if !self.snapshot.is_empty() {
            return Ok(());
        }
        for state in self.state_dirs(reference_cpu) {
            let name = read_sys(&state.join("name"))?;
            let disable = read_sys(&state.join("disable"))?;
            self.snapshot.push((name, disable));
        }
        Ok(())
    }

    fn cpuidle_cpus(&self) -> Vec<u32> {
        let mut cpus = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.cpu_base) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                if let Some(id) = name.strip_prefix("cpu").and_then(|s| s.parse().ok()) {
                    if entry.path().join("cpuidle").is_dir() {
                        cpus.push(id);
                    }
                }
            }
        }
        cpus.sort_unstable();
        cpus
    }

    fn state_dirs(&self, cpu: u32) -> Vec<PathBuf> {
        let base = self.cpu_base.join(format!("cpu{cpu}/cpuidle"));
        let mut states: Vec<PathBuf> = std::fs::read_dir(&base)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        p.is_dir()
                            && p.file_name()
                                .map(|n| n.to_string_lossy().starts_with("state"))
                                .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        states.sort();
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_state(base: &Path, cpu: u32, idx: u32, name: &str, latency: &str, disable: &str) {
        let dir = base.join(format!("cpu{cpu}/cpuidle/state{idx}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), name).unwrap();
        fs::write(dir.join("latency"), latency).unwrap();
        fs::write(dir.join("disable"), disable).unwrap();
    }

    fn disable_value(base: &Path, cpu: u32, idx: u32) -> String {
        fs::read_to_string(base.join(format!("cpu{cpu}/cpuidle/state{idx}/disable"))).unwrap()
    }

    #[test]
    fn test_disable_all_and_restore_by_name() {
        let base = TempDir::new().unwrap();
        for cpu in 0..2 {
            fake_state(base.path(), cpu, 0, "POLL", "0", "0");
            fake_state(base.path(), cpu, 1, "C1", "2", "0");
            fake_state(base.path(), cpu, 2, "C6", "133", "1");
        }

        let mut ctl = IdleStateController::new(base.path());
        ctl.apply(IdleRequest::DisableAll, 0).unwrap();
        for cpu in 0..2 {
            for idx in 0..3 {
                assert_eq!(disable_value(base.path(), cpu, idx), "1");
            }
        }

        ctl.clear().unwrap();
        for cpu in 0..2 {
            assert_eq!(disable_value(base.path(), cpu, 0), "0");
            assert_eq!(disable_value(base.path(), cpu, 1), "0");
            // C6 was disabled before the run; the snapshot preserves that.
            assert_eq!(disable_value(base.path(), cpu, 2), "1");
        }
        assert!(!ctl.is_active());
        ctl.clear().unwrap();
    }

    #[test]
    fn test_restore_matches_names_across_shuffled_indices() {
        let base = TempDir::new().unwrap();
        // Same states, different index order on the second CPU.
        fake_state(base.path(), 0, 0, "C1", "2", "0");
        fake_state(base.path(), 0, 1, "C6", "133", "1");
        fake_state(base.path(), 1, 0, "C6", "133", "1");
        fake_state(base.path(), 1, 1, "C1", "2", "0");

        let mut ctl = IdleStateController::new(base.path());
        ctl.apply(IdleRequest::DisableAll, 0).unwrap();
        ctl.clear().unwrap();

        // cpu1's C6 lives at index 0 and must get C6's value, not C1's.
        assert_eq!(disable_value(base.path(), 1, 0), "1");
        assert_eq!(disable_value(base.path(), 1, 1), "0");
    }

    #[test]
    fn test_latency_threshold_spares_shallow_states() {
        let base = TempDir::new().unwrap();
        fake_state(base.path(), 0, 0, "POLL", "0", "0");
        fake_state(base.path(), 0, 1, "C1", "2", "0");
        fake_state(base.path(), 0, 2, "C6", "133", "0");

        let mut ctl = IdleStateController::new(base.path());
        ctl.apply(IdleRequest::MaxLatencyUs(10), 0).unwrap();
        assert_eq!(disable_value(base.path(), 0, 0), "0");
        assert_eq!(disable_value(base.path(), 0, 1), "0");
        assert_eq!(disable_value(base.path(), 0, 2), "1");
    }

    #[test]
    fn test_no_cpuidle_is_a_skip() {
        let base = TempDir::new().unwrap();
        let mut ctl = IdleStateController::new(base.path());
        ctl.apply(IdleRequest::DisableAll, 0).unwrap();
        assert!(!ctl.is_active());
    }
}
