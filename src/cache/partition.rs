//! Partition programming, verification, and restoration
//!
//! The programmer writes group masks and CPU assignments in a safe order:
//! the root group must shrink to the rest mask before the workload group
//! claims its ways exclusively, or the kernel arbiter rejects the request.
//! The verifier cross-checks every programmed value against device state,
//! and the restorer tears the partition down idempotently.

use crate::cache::{CacheTopology, WayMask};
use crate::error::{IoResultExt, Result, ShieldError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Handle on a resctrl mount point
#[derive(Debug, Clone)]
pub struct ResctrlFs {
    root: PathBuf,
}

impl ResctrlFs {
    /// Create a handle for the given mount point
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The mount point
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: Option<&str>) -> PathBuf {
        match group {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        }
    }

    fn write_control(&self, group: Option<&str>, file: &str, value: &str) -> Result<()> {
        let path = self.group_dir(group).join(file);
        debug!(path = %path.display(), value, "resctrl write");
        std::fs::write(&path, value).with_path(path)
    }

    fn read_control(&self, group: Option<&str>, file: &str) -> Result<String> {
        let path = self.group_dir(group).join(file);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .with_path(path)
    }

    /// Write a group's L3 schemata line, one entry per domain
    pub fn write_schemata(&self, group: Option<&str>, domains: &[u32], mask: WayMask) -> Result<()> {
        let entries: Vec<String> = domains.iter().map(|d| format!("{d}={mask}")).collect();
        self.write_control(group, "schemata", &format!("L3:{}\n", entries.join(";")))
    }

    /// Read back a group's programmed L3 mask.
    ///
    /// Tolerates whitespace and multi-domain formatting by taking the last
    /// value on the L3 line.
    pub fn read_schemata_mask(&self, group: Option<&str>) -> Result<u64> {
        let text = self.read_control(group, "schemata")?;
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("L3:"))
            .ok_or_else(|| {
                ShieldError::mismatch(
                    format!("{} schemata", group.unwrap_or("root")),
                    "an L3 line",
                    "none",
                )
            })?;
        let last = line
            .trim_start_matches("L3:")
            .split(';')
            .last()
            .and_then(|entry| entry.split('=').last())
            .map(str::trim)
            .unwrap_or("");
        u64::from_str_radix(last, 16).map_err(|_| {
            ShieldError::mismatch(
                format!("{} schemata", group.unwrap_or("root")),
                "a hex mask",
                last,
            )
        })
    }

    /// Read a group's CPU assignment
    pub fn read_cpus(&self, group: Option<&str>) -> Result<Vec<u32>> {
        let text = self.read_control(group, "cpus_list")?;
        crate::config::parse_cpu_list(&text)
    }

    /// Read a group's task membership list
    pub fn read_tasks(&self, group: Option<&str>) -> Result<Vec<i32>> {
        let text = self.read_control(group, "tasks")?;
        Ok(text
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    /// Read the device's last-command status feedback
    pub fn last_cmd_status(&self) -> Result<String> {
        self.read_control(None, "info/last_cmd_status")
    }

    /// List custom group directories still present under the mount point
    pub fn custom_groups(&self) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        for entry in std::fs::read_dir(&self.root).with_path(&self.root)? {
            let entry = entry.with_path(&self.root)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name != "info" && name != "mon_groups" && name != "mon_data" {
                groups.push(name);
            }
        }
        Ok(groups)
    }
}

/// A programmed cache partition
#[derive(Debug, Clone)]
pub struct Partition {
    /// Group holding the measured workload
    pub workload_group: String,
    /// Group holding everything else
    pub background_group: String,
    /// Exclusive mask granted to the workload
    pub mask: WayMask,
    /// Remaining ways left to the rest of the system
    pub rest: WayMask,
    /// CPU the workload group owns
    pub workload_cpu: u32,
}

/// Writes group masks and CPU assignments to the control interface
pub struct PartitionProgrammer<'a> {
    fs: &'a ResctrlFs,
    topology: &'a CacheTopology,
}

impl<'a> PartitionProgrammer<'a> {
    /// Create a programmer over a discovered topology
    pub fn new(fs: &'a ResctrlFs, topology: &'a CacheTopology) -> Self {
        Self { fs, topology }
    }

    /// Program the partition.
    ///
    /// The root/background schemata are written to the rest mask first;
    /// the workload group can only claim its ways exclusively once the
    /// root has relinquished them.
    pub fn program(
        &self,
        workload_group: &str,
        background_group: &str,
        workload_cpu: u32,
        online_cpus: &[u32],
        mask: WayMask,
    ) -> Result<Partition> {
        if mask.bits & self.topology.shareable_mask != 0 {
            return Err(ShieldError::validation(format!(
                "workload mask {mask} overlaps shareable bits {:#x}",
                self.topology.shareable_mask
            )));
        }
        let rest = WayMask {
            bits: self.topology.capability_mask & !mask.bits,
            hex_width: self.topology.hex_width,
        };

        // Root relinquishes the ways before anyone claims them.
        self.fs
            .write_schemata(None, &self.topology.domains, rest)?;

        for group in [workload_group, background_group] {
            let dir = self.fs.group_dir(Some(group));
            std::fs::create_dir_all(&dir).with_path(dir)?;
        }

        self.fs
            .write_control(Some(workload_group), "cpus_list", &workload_cpu.to_string())?;
        let background_cpus: Vec<String> = online_cpus
            .iter()
            .filter(|&&cpu| cpu != workload_cpu)
            .map(|cpu| cpu.to_string())
            .collect();
        self.fs.write_control(
            Some(background_group),
            "cpus_list",
            &background_cpus.join(","),
        )?;

        self.fs
            .write_schemata(Some(workload_group), &self.topology.domains, mask)?;
        self.fs
            .write_schemata(Some(background_group), &self.topology.domains, rest)?;

        self.fs.write_control(Some(workload_group), "mode", "exclusive")?;

        let status = self.fs.last_cmd_status()?;
        if status != "ok" {
            return Err(ShieldError::programming(workload_group, status));
        }

        info!(
            group = workload_group,
            mask = %mask,
            rest = %rest,
            cpu = workload_cpu,
            "cache partition programmed"
        );
        Ok(Partition {
            workload_group: workload_group.to_string(),
            background_group: background_group.to_string(),
            mask,
            rest,
            workload_cpu,
        })
    }
}

/// Reads back programmed state and cross-checks it
pub struct PartitionVerifier<'a> {
    fs: &'a ResctrlFs,
}

impl<'a> PartitionVerifier<'a> {
    /// Create a verifier over the same mount point
    pub fn new(fs: &'a ResctrlFs) -> Self {
        Self { fs }
    }

    /// Verify the partition against device-reported state.
    ///
    /// Any mismatch here is fatal for the run: an unverified partition
    /// means the measurement would not actually be isolated.
    pub fn verify(&self, partition: &Partition, pids: &[i32]) -> Result<()> {
        let workload_mask = self
            .fs
            .read_schemata_mask(Some(&partition.workload_group))
            .map_err(|_| {
                ShieldError::mismatch(
                    format!("{} schemata", partition.workload_group),
                    partition.mask.to_string(),
                    "unreadable",
                )
            })?;
        // Hex comparison is by value, so case and zero padding don't matter.
        if workload_mask != partition.mask.bits {
            return Err(ShieldError::mismatch(
                format!("{} schemata", partition.workload_group),
                partition.mask.to_string(),
                format!("{workload_mask:x}"),
            ));
        }

        self.fs
            .read_schemata_mask(Some(&partition.background_group))
            .map_err(|_| {
                ShieldError::mismatch(
                    format!("{} schemata", partition.background_group),
                    partition.rest.to_string(),
                    "unreadable",
                )
            })?;

        let cpus = self.fs.read_cpus(Some(&partition.workload_group))?;
        if !cpus.contains(&partition.workload_cpu) {
            return Err(ShieldError::mismatch(
                format!("{} cpus_list", partition.workload_group),
                partition.workload_cpu.to_string(),
                format!("{cpus:?}"),
            ));
        }

        if !pids.is_empty() {
            let tasks = self.fs.read_tasks(Some(&partition.workload_group))?;
            for pid in pids {
                if !tasks.contains(pid) {
                    return Err(ShieldError::mismatch(
                        format!("{} tasks", partition.workload_group),
                        format!("pid {pid}"),
                        "absent",
                    ));
                }
            }
        }

        debug!(group = partition.workload_group, "cache partition verified");
        Ok(())
    }
}

/// Tears down custom groups and restores the full default mask
pub struct PartitionRestorer {
    fs: ResctrlFs,
    topology: Option<CacheTopology>,
    groups: Vec<String>,
    registered: bool,
    unmount_when_empty: bool,
}

impl PartitionRestorer {
    /// Create an inactive restorer; nothing happens until registration
    pub fn new(fs: ResctrlFs) -> Self {
        Self {
            fs,
            topology: None,
            groups: Vec::new(),
            registered: false,
            unmount_when_empty: false,
        }
    }

    /// Unmount the control interface on restore if no custom groups remain
    pub fn with_unmount(mut self, unmount: bool) -> Self {
        self.unmount_when_empty = unmount;
        self
    }

    /// Arm the restorer.
    ///
    /// This happens before programming starts: once the root group has
    /// relinquished ways, a failure anywhere in the chain must still put
    /// the full mask back.
    pub fn register(&mut self, topology: CacheTopology, workload_group: &str, background_group: &str) {
        self.topology = Some(topology);
        self.groups = vec![workload_group.to_string(), background_group.to_string()];
        self.registered = true;
    }

    /// Whether a restore is outstanding
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Remove the groups and restore the full capability mask.
    ///
    /// Best-effort throughout and safe to call twice; restore failures are
    /// logged, never escalated, because this runs on the failure path too.
    pub fn restore(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }

        for group in &self.groups {
            let dir = self.fs.group_dir(Some(group));
            match std::fs::remove_dir(&dir) {
                Ok(()) => info!(group, "removed cache group"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(group, error = %e, "failed to remove cache group"),
            }
        }

        if let Some(topology) = &self.topology {
            let full = WayMask {
                bits: topology.capability_mask,
                hex_width: topology.hex_width,
            };
            if let Err(e) = self.fs.write_schemata(None, &topology.domains, full) {
                warn!(error = %e, "failed to restore root schemata");
            }
        }

        if self.unmount_when_empty {
            match self.fs.custom_groups() {
                Ok(groups) if groups.is_empty() => self.unmount(),
                Ok(groups) => debug!(?groups, "leaving resctrl mounted, custom groups remain"),
                Err(e) => warn!(error = %e, "could not enumerate custom groups"),
            }
        }

        self.registered = false;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn unmount(&self) {
        if let Err(e) = nix::mount::umount(self.fs.root()) {
            debug!(error = %e, "resctrl unmount skipped");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount(&self) {}
}
