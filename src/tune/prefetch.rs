//! Hardware prefetcher control
//!
//! Drives the four prefetch-disable bits of MSR 0x1A4
//! (MISC_FEATURE_CONTROL): {L2 streamer, L2 adjacent line, L1D streamer,
//! L1D IP}. The user-facing request uses 1 = enabled, while the register's
//! polarity is inverted (1 = disabled), so the requested pattern is
//! bit-complemented before the write. Writes are replicated across every
//! hardware thread sharing the target's physical core, preserving all
//! non-targeted register bits; restore writes each thread's raw snapshot
//! back verbatim.

use crate::config::PrefetchSpec;
use crate::error::{IoResultExt, Result};
use crate::system::sibling_threads;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// MISC_FEATURE_CONTROL, the prefetcher enable register
pub const MSR_MISC_FEATURE_CONTROL: u64 = 0x1a4;

/// The four prefetch-disable bits within the register
const PREFETCH_BITS: u64 = 0xf;

/// Controls per-thread hardware prefetcher bits through the MSR interface
pub struct PrefetcherController {
    msr_base: PathBuf,
    cpu_base: PathBuf,
    snapshot: HashMap<u32, u64>,
    active: bool,
}

impl PrefetcherController {
    /// Create a controller over MSR device and sysfs CPU base directories
    pub fn new(msr_base: impl Into<PathBuf>, cpu_base: impl Into<PathBuf>) -> Self {
        Self {
            msr_base: msr_base.into(),
            cpu_base: cpu_base.into(),
            snapshot: HashMap::new(),
            active: false,
        }
    }

    /// Whether an apply is outstanding
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn msr_path(&self, cpu: u32) -> PathBuf {
        self.msr_base.join(format!("{cpu}/msr"))
    }

    fn read_msr(&self, cpu: u32) -> Result<u64> {
        let path = self.msr_path(cpu);
        let file = OpenOptions::new().read(true).open(&path).with_path(&path)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, MSR_MISC_FEATURE_CONTROL)
            .with_path(&path)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_msr(&self, cpu: u32, value: u64) -> Result<()> {
        let path = self.msr_path(cpu);
        let file = OpenOptions::new().write(true).open(&path).with_path(&path)?;
        file.write_all_at(&value.to_le_bytes(), MSR_MISC_FEATURE_CONTROL)
            .with_path(&path)
    }

    /// Apply a prefetcher pattern to the target core.
    ///
    /// The inverted-polarity disable mask is written to every hardware
    /// thread sharing the target CPU's physical core, each with its own
    /// read-modify-write so unrelated register bits survive.
    pub fn apply(&mut self, target_cpu: u32, spec: PrefetchSpec) -> Result<()> {
        let disable_mask = u64::from(!spec.enable_bits() & 0xf);
        let siblings = sibling_threads(&self.cpu_base, target_cpu);

        for &thread in &siblings {
            if !self.msr_path(thread).is_file() {
                debug!(thread, "no MSR interface, skipping");
                continue;
            }
            let raw = self.read_msr(thread)?;
            self.snapshot.entry(thread).or_insert(raw);

            let updated = (raw & !PREFETCH_BITS) | disable_mask;
            self.write_msr(thread, updated)?;

            let readback = self.read_msr(thread)?;
            if readback & PREFETCH_BITS != disable_mask {
                warn!(
                    thread,
                    requested = format!("{disable_mask:#x}"),
                    actual = format!("{:#x}", readback & PREFETCH_BITS),
                    "prefetcher readback disagrees with request"
                );
            }
            info!(
                thread,
                disable_mask = format!("{disable_mask:#06b}"),
                "prefetcher bits written"
            );
            self.active = true;
        }
        Ok(())
    }

    /// Write each sibling's raw snapshotted register value back verbatim
    pub fn clear(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        for (&thread, &raw) in &self.snapshot {
            if !self.msr_path(thread).is_file() {
                continue;
            }
            self.write_msr(thread, raw)?;
            let readback = self.read_msr(thread)?;
            if readback != raw {
                warn!(thread, "prefetcher restore readback disagrees");
            }
            info!(thread, "prefetcher register restored");
        }
        self.active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn fake_msr(msr_base: &Path, cpu: u32, value: u64) {
        let dir = msr_base.join(cpu.to_string());
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("msr");
        fs::write(&path, vec![0u8; 0x200]).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&value.to_le_bytes(), MSR_MISC_FEATURE_CONTROL)
            .unwrap();
    }

    fn fake_siblings(cpu_base: &Path, cpu: u32, list: &str) {
        let dir = cpu_base.join(format!("cpu{cpu}/topology"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("thread_siblings_list"), list).unwrap();
    }

    fn read_register(msr_base: &Path, cpu: u32) -> u64 {
        let file = OpenOptions::new()
            .read(true)
            .open(msr_base.join(format!("{cpu}/msr")))
            .unwrap();
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, MSR_MISC_FEATURE_CONTROL).unwrap();
        u64::from_le_bytes(buf)
    }

    #[test]
    fn test_pattern_is_complemented_and_replicated_to_siblings() {
        let msr = TempDir::new().unwrap();
        let cpus = TempDir::new().unwrap();
        // Hyperthread pair 2/34, with unrelated high bits set on each.
        fake_msr(msr.path(), 2, 0xdead_0000_0000_0003);
        fake_msr(msr.path(), 34, 0xbeef_0000_0000_0000);
        fake_siblings(cpus.path(), 2, "2,34\n");

        let mut ctl = PrefetcherController::new(msr.path(), cpus.path());
        // "1011" enabled -> disable mask 0b0100.
        ctl.apply(2, PrefetchSpec::Pattern(0b1011)).unwrap();
        assert!(ctl.is_active());

        assert_eq!(read_register(msr.path(), 2), 0xdead_0000_0000_0004);
        assert_eq!(read_register(msr.path(), 34), 0xbeef_0000_0000_0004);
    }

    #[test]
    fn test_clear_restores_raw_values_verbatim() {
        let msr = TempDir::new().unwrap();
        let cpus = TempDir::new().unwrap();
        fake_msr(msr.path(), 1, 0x0123_4567_89ab_cdef & !0xf | 0x3);
        fake_msr(msr.path(), 33, 0x1111_0000_0000_0001);
        fake_siblings(cpus.path(), 1, "1,33\n");

        let mut ctl = PrefetcherController::new(msr.path(), cpus.path());
        ctl.apply(1, PrefetchSpec::Off).unwrap();
        assert_eq!(read_register(msr.path(), 1) & 0xf, 0xf);

        ctl.clear().unwrap();
        assert_eq!(read_register(msr.path(), 1), 0x0123_4567_89ab_cdef & !0xf | 0x3);
        assert_eq!(read_register(msr.path(), 33), 0x1111_0000_0000_0001);
        assert!(!ctl.is_active());
        ctl.clear().unwrap();
    }

    #[test]
    fn test_snapshot_survives_second_apply() {
        let msr = TempDir::new().unwrap();
        let cpus = TempDir::new().unwrap();
        fake_msr(msr.path(), 0, 0x0000_0000_0000_0000);
        fake_siblings(cpus.path(), 0, "0\n");

        let mut ctl = PrefetcherController::new(msr.path(), cpus.path());
        ctl.apply(0, PrefetchSpec::Off).unwrap();
        ctl.apply(0, PrefetchSpec::Pattern(0b1010)).unwrap();
        ctl.clear().unwrap();
        assert_eq!(read_register(msr.path(), 0), 0);
    }

    #[test]
    fn test_missing_msr_interface_is_a_skip() {
        let msr = TempDir::new().unwrap();
        let cpus = TempDir::new().unwrap();
        fake_siblings(cpus.path(), 5, "5\n");

        let mut ctl = PrefetcherController::new(msr.path(), cpus.path());
        ctl.apply(5, PrefetchSpec::On).unwrap();
        assert!(!ctl.is_active());
    }

    #[test]
    fn test_missing_topology_falls_back_to_target_only() {
        let msr = TempDir::new().unwrap();
        let cpus = TempDir::new().unwrap();
        fake_msr(msr.path(), 3, 0x40);

        let mut ctl = PrefetcherController::new(msr.path(), cpus.path());
        ctl.apply(3, PrefetchSpec::Off).unwrap();
        assert_eq!(read_register(msr.path(), 3), 0x4f);
    }
}
