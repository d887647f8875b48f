//! Per-CPU clock pinning
//!
//! Snapshots each CPU's governor and min/max limits on first touch, then
//! pins min = max = target under a fixed/user governor. Restore puts the
//! snapshot values back per CPU.

use super::{read_sys, write_sys, write_sys_verified};
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pre-modification cpufreq state for one CPU
#[derive(Debug, Clone)]
struct FreqSnapshot {
    governor: String,
    min_khz: String,
    max_khz: String,
}

/// Pins per-CPU core frequency through the cpufreq interface
pub struct FrequencyController {
    cpu_base: PathBuf,
    snapshot: HashMap<u32, FreqSnapshot>,
    active: bool,
}

impl FrequencyController {
    /// Create a controller over a sysfs CPU base directory
    pub fn new(cpu_base: impl Into<PathBuf>) -> Self {
        Self {
            cpu_base: cpu_base.into(),
            snapshot: HashMap::new(),
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn cpufreq_dir(&self, cpu: u32) -> PathBuf {
        self.cpu_base.join(format!("cpu{cpu}/cpufreq"))
    }

    /// Pin min = max = `khz` on every listed CPU.
    ///
    /// CPUs without a cpufreq interface are skipped; frequency scaling may
    /// legitimately be absent or disabled on a given platform.
    pub fn apply(&mut self, cpus: &[u32], khz: u64) -> Result<()> {
        for &cpu in cpus {
            let dir = self.cpufreq_dir(cpu);
            if !dir.is_dir() {
                debug!(cpu, "no cpufreq interface, skipping");
                continue;
            }

            self.capture_once(cpu, &dir)?;

            let governor = pick_pinning_governor(&dir);
            write_sys(&dir.join("scaling_governor"), &governor)?;
            // Max before min so the pin never transiently inverts the range.
            write_sys(&dir.join("scaling_max_freq"), &khz.to_string())?;
            write_sys_verified(&dir.join("scaling_min_freq"), &khz.to_string())?;
            write_sys_verified(&dir.join("scaling_max_freq"), &khz.to_string())?;

            info!(cpu, khz, governor, "frequency pinned");
            self.active = true;
        }
        Ok(())
    }

    /// Restore every snapshotted CPU to its pre-apply governor and limits
    pub fn clear(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for (&cpu, snap) in &self.snapshot {
            let dir = self.cpufreq_dir(cpu);
            if !dir.is_dir() {
                continue;
            }
            write_sys(&dir.join("scaling_max_freq"), &snap.max_khz)?;
            write_sys_verified(&dir.join("scaling_min_freq"), &snap.min_khz)?;
            write_sys_verified(&dir.join("scaling_max_freq"), &snap.max_khz)?;
            write_sys_verified(&dir.join("scaling_governor"), &snap.governor)?;
            info!(cpu, "frequency restored");
        }
        self.active = false;
        Ok(())
    }

    fn capture_once(&mut self, cpu: u32, dir: &Path) -> Result<()> {
        if self.snapshot.contains_key(&cpu) {
            return Ok(());
        }
        let snap = FreqSnapshot {
            governor: read_sys(&dir.join("scaling_governor"))?,
            min_khz: read_sys(&dir.join("scaling_min_freq"))?,
            max_khz: read_sys(&dir.join("scaling_max_freq"))?,
        };
        self.snapshot.insert(cpu, snap);
        Ok(())
    }
}

/// Prefer the userspace governor for pinning; fall back to performance
fn pick_pinning_governor(dir: &Path) -> String {
    match read_sys(&dir.join("scaling_available_governors")) {
        Ok(available) if available.split_whitespace().any(|g| g == "userspace") => {
            "userspace".to_string()
        }
        _ => "performance".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_cpu(base: &Path, cpu: u32, governor: &str, min: &str, max: &str) {
        let dir = base.join(format!("cpu{cpu}/cpufreq"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("scaling_governor"), governor).unwrap();
        fs::write(dir.join("scaling_min_freq"), min).unwrap();
        fs::write(dir.join("scaling_max_freq"), max).unwrap();
        fs::write(
            dir.join("scaling_available_governors"),
            "performance powersave userspace",
        )
        .unwrap();
    }

    #[test]
    fn test_apply_pins_and_clear_restores() {
        let base = TempDir::new().unwrap();
        fake_cpu(base.path(), 2, "powersave", "800000", "4200000");
        fake_cpu(base.path(), 3, "powersave", "800000", "4200000");

        let mut ctl = FrequencyController::new(base.path());
        ctl.apply(&[2, 3], 2_400_000).unwrap();
        assert!(ctl.is_active());

        for cpu in [2u32, 3] {
            let dir = base.path().join(format!("cpu{cpu}/cpufreq"));
            assert_eq!(fs::read_to_string(dir.join("scaling_governor")).unwrap(), "userspace");
            assert_eq!(fs::read_to_string(dir.join("scaling_min_freq")).unwrap(), "2400000");
            assert_eq!(fs::read_to_string(dir.join("scaling_max_freq")).unwrap(), "2400000");
        }

        ctl.clear().unwrap();
        assert!(!ctl.is_active());
        for cpu in [2u32, 3] {
            let dir = base.path().join(format!("cpu{cpu}/cpufreq"));
            assert_eq!(fs::read_to_string(dir.join("scaling_governor")).unwrap(), "powersave");
            assert_eq!(fs::read_to_string(dir.join("scaling_min_freq")).unwrap(), "800000");
            assert_eq!(fs::read_to_string(dir.join("scaling_max_freq")).unwrap(), "4200000");
        }

        // Idempotent: second clear with nothing active is a no-op.
        ctl.clear().unwrap();
    }

    #[test]
    fn test_snapshot_not_overwritten_by_second_apply() {
        let base = TempDir::new().unwrap();
        fake_cpu(base.path(), 1, "schedutil", "400000", "3000000");

        let mut ctl = FrequencyController::new(base.path());
        ctl.apply(&[1], 2_000_000).unwrap();
        ctl.apply(&[1], 1_500_000).unwrap();
        ctl.clear().unwrap();

        let dir = base.path().join("cpu1/cpufreq");
        // Restore goes to the original values, not the first pin.
        assert_eq!(fs::read_to_string(dir.join("scaling_governor")).unwrap(), "schedutil");
        assert_eq!(fs::read_to_string(dir.join("scaling_min_freq")).unwrap(), "400000");
        assert_eq!(fs::read_to_string(dir.join("scaling_max_freq")).unwrap(), "3000000");
    }

    #[test]
    fn test_missing_cpufreq_is_skipped() {
        let base = TempDir::new().unwrap();
        let mut ctl = FrequencyController::new(base.path());
        ctl.apply(&[7], 2_000_000).unwrap();
        assert!(!ctl.is_active());
    }

    #[test]
    fn test_falls_back_to_performance_governor() {
        let base = TempDir::new().unwrap();
        fake_cpu(base.path(), 0, "powersave", "800000", "4000000");
        let dir = base.path().join("cpu0/cpufreq");
        fs::write(dir.join("scaling_available_governors"), "performance powersave").unwrap();

        let mut ctl = FrequencyController::new(base.path());
        ctl.apply(&[0], 3_000_000).unwrap();
        assert_eq!(
            fs::read_to_string(dir.join("scaling_governor")).unwrap(),
            "performance"
        );
    }
}
