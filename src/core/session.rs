//! Reservation session lifecycle
//!
//! One session covers a single measurement run: acquire every requested
//! resource in dependency order, wait for quiescence, launch sidecars and
//! the workload, then tear everything down again. Teardown runs on the
//! failure path exactly as on the success path, driven by the recovery
//! coordinator's undo stack.

use crate::cache::{
    percent_to_exclusive_mask, validate_percent, CacheTopology, PartitionProgrammer,
    PartitionRestorer, PartitionVerifier, ResctrlFs,
};
use crate::config::{FreqRequest, PowerCapRequest, SessionConfig};
use crate::core::{RecoveryCoordinator, RollbackAction};
use crate::error::{Result, ShieldError};
use crate::system::{online_cpus, QuiescenceWaiter, SidecarHandle, SidecarSupervisor, StopTier};
use crate::tune::{
    FrequencyController, IdleStateController, PowerCapController, PrefetcherController,
    RaplDomainKind, TurboController, UncoreFrequencyController,
};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// resctrl group for the measured workload
const WORKLOAD_GROUP: &str = "workload";
/// resctrl group for everything else
const BACKGROUND_GROUP: &str = "background";

static CANCEL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    CANCEL.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

/// One measurement run's worth of reservations
pub struct Session {
    config: SessionConfig,
    fs: ResctrlFs,
    restorer: PartitionRestorer,
    freq: FrequencyController,
    power: PowerCapController,
    turbo: TurboController,
    idle: IdleStateController,
    uncore: UncoreFrequencyController,
    prefetch: PrefetcherController,
    supervisor: SidecarSupervisor,
    coordinator: RecoveryCoordinator,
    sidecars: Vec<SidecarHandle>,
}

impl Session {
    /// Build a session over the configured control surfaces
    pub fn new(config: SessionConfig) -> Self {
        let paths = &config.paths;
        let fs = ResctrlFs::new(&paths.resctrl);
        let privilege = (!config.privilege_cmd.is_empty() && config.privilege_cmd != "none")
            .then(|| config.privilege_cmd.clone());
        Self {
            fs: fs.clone(),
            restorer: PartitionRestorer::new(fs).with_unmount(true),
            freq: FrequencyController::new(&paths.cpu_base),
            power: PowerCapController::new(&paths.powercap),
            turbo: TurboController::new(&paths.cpu_base),
            idle: IdleStateController::new(&paths.cpu_base),
            uncore: UncoreFrequencyController::new(&paths.uncore),
            prefetch: PrefetcherController::new(&paths.msr_base, &paths.cpu_base),
            supervisor: SidecarSupervisor::new(privilege, config.tools_cpu),
            coordinator: RecoveryCoordinator::new(),
            sidecars: Vec::new(),
            config,
        }
    }

    /// Run the whole session: acquire, quiesce, execute, tear down.
    ///
    /// Returns the workload's exit code. Teardown runs regardless of how
    /// acquisition or execution went; an interrupt surfaces as `Cancelled`
    /// only after teardown has finished.
    pub fn run(&mut self) -> Result<i32> {
        if self.config.dry_run {
            for line in self.plan() {
                println!("{line}");
            }
            return Ok(0);
        }

        install_signal_handlers();
        let result = self.execute();
        self.teardown();
        match result {
            Ok(_) if CANCEL.load(Ordering::SeqCst) => Err(ShieldError::Cancelled),
            other => other,
        }
    }

    fn execute(&mut self) -> Result<i32> {
        self.acquire()?;

        let waiter = QuiescenceWaiter::new(
            self.config.quiesce.clone(),
            self.config.paths.thermal.clone(),
        );
        waiter.idle_wait(&CANCEL)?;

        for spec in self.config.sidecars.clone() {
            let handle = self.supervisor.spawn(&spec)?;
            self.coordinator.push(RollbackAction::Sidecar(handle.clone()));
            self.sidecars.push(handle);
        }

        let code = match self.config.workload.clone() {
            Some(command) => self.run_workload(&command)?,
            None => {
                info!("no workload command; reservations verified and released");
                0
            }
        };

        // Stopping sidecars on the success path is load-bearing: a profiler
        // that outlives SIGKILL invalidates the run.
        for handle in self.sidecars.clone() {
            self.supervisor.ensure_stopped(&handle)?;
        }
        Ok(code)
    }

    /// Acquire every requested resource, pushing a rollback action before
    /// each controller touches hardware
    fn acquire(&mut self) -> Result<()> {
        if let Some(pct) = self.config.cache_pct {
            self.acquire_cache(pct)?;
        }

        if let Some(FreqRequest::Khz(khz)) = self.config.freq {
            self.coordinator.push(RollbackAction::Frequency);
            let cpus = self.config.freq_cpus.clone();
            optional("frequency pin", self.freq.apply(&cpus, khz))?;
        }

        for (request, kind) in [
            (self.config.pkg_cap, RaplDomainKind::Package),
            (self.config.dram_cap, RaplDomainKind::Dram),
        ] {
            match request {
                Some(PowerCapRequest::Watts(watts)) => {
                    self.coordinator.push(RollbackAction::PowerCap(kind));
                    optional("power cap", self.power.apply(kind, watts))?;
                }
                Some(PowerCapRequest::Off) => {
                    // Restores the platform default now; nothing to undo.
                    optional("power cap reset", self.power.clear(kind))?;
                }
                None => {}
            }
        }

        if let Some(state) = self.config.turbo {
            self.coordinator.push(RollbackAction::Turbo);
            optional("turbo state", self.turbo.apply(state))?;
        }

        if let Some(request) = self.config.idle {
            self.coordinator.push(RollbackAction::IdleStates);
            let reference = self.config.workload_cpu;
            optional("idle states", self.idle.apply(request, reference))?;
        }

        match self.config.uncore {
            Some(FreqRequest::Khz(khz)) => {
                self.coordinator.push(RollbackAction::Uncore);
                optional("uncore pin", self.uncore.apply(khz))?;
            }
            Some(FreqRequest::Off) => debug!("uncore left at platform defaults"),
            None => {}
        }

        if let Some(spec) = self.config.prefetch {
            self.coordinator.push(RollbackAction::Prefetcher);
            let cpu = self.config.workload_cpu;
            optional("prefetcher bits", self.prefetch.apply(cpu, spec))?;
        }

        Ok(())
    }

    /// The cache chain: discover, validate, carve, program, verify.
    ///
    /// The restorer is armed before the first schemata write, so a rejected
    /// program still puts the root mask back.
    fn acquire_cache(&mut self, pct: u32) -> Result<()> {
        let topology = CacheTopology::discover(self.config.paths.resctrl.as_path())?;
        validate_percent(&topology, pct)?;
        let mask = percent_to_exclusive_mask(&topology, pct)?;
        info!(
            pct,
            mask = %mask,
            ways = mask.ways(),
            "carved exclusive cache mask"
        );

        self.restorer
            .register(topology.clone(), WORKLOAD_GROUP, BACKGROUND_GROUP);
        self.coordinator.push(RollbackAction::CachePartition);

        let online = online_cpus(&self.config.paths.cpu_base)?;
        let programmer = PartitionProgrammer::new(&self.fs, &topology);
        let partition = programmer.program(
            WORKLOAD_GROUP,
            BACKGROUND_GROUP,
            self.config.workload_cpu,
            &online,
            mask,
        )?;
        PartitionVerifier::new(&self.fs).verify(&partition, &[])?;
        Ok(())
    }

    fn run_workload(&mut self, command: &str) -> Result<i32> {
        let cpu = self.config.workload_cpu as usize;
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        // Pin the child to the workload CPU between fork and exec. Affinity
        // failures are tolerated so runs on machines without that CPU id
        // still execute.
        unsafe {
            cmd.pre_exec(move || {
                let mut set = CpuSet::new();
                if set.set(cpu).is_ok() {
                    let _ = sched_setaffinity(Pid::from_raw(0), &set);
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ShieldError::io(format!("workload '{command}'"), e))?;
        info!(pid = child.id(), cpu, command, "workload started");

        let status = child
            .wait()
            .map_err(|e| ShieldError::io(format!("workload '{command}'"), e))?;
        let code = status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1);
        info!(code, "workload finished");
        Ok(code)
    }

    /// Unwind the undo stack in reverse acquisition order.
    ///
    /// Best-effort throughout: a restore failure is logged and the unwind
    /// continues, because stopping halfway leaves more state behind than
    /// any single failed restore.
    fn teardown(&mut self) {
        for action in self.coordinator.drain_reverse() {
            let result = match &action {
                RollbackAction::Sidecar(handle) => {
                    match self.supervisor.stop(handle) {
                        StopTier::StillAlive => {
                            warn!(name = %handle.name, pid = handle.pid, "sidecar left running");
                        }
                        tier => debug!(name = %handle.name, ?tier, "sidecar stopped"),
                    }
                    Ok(())
                }
                RollbackAction::Prefetcher => self.prefetch.clear(),
                RollbackAction::Uncore => self.uncore.clear(),
                RollbackAction::IdleStates => self.idle.clear(),
                RollbackAction::Turbo => self.turbo.clear(),
                RollbackAction::PowerCap(kind) => self.power.clear(*kind),
                RollbackAction::Frequency => self.freq.clear(),
                RollbackAction::CachePartition => self.restorer.restore(),
            };
            if let Err(e) = result {
                warn!(?action, error = %e, "restore failed, continuing teardown");
            }
        }
    }

    /// Human-readable plan of what a run would do, for dry-run mode
    fn plan(&self) -> Vec<String> {
        let c = &self.config;
        let mut lines = vec!["plan:".to_string()];
        if let Some(pct) = c.cache_pct {
            lines.push(format!(
                "  carve {pct}% of L3 exclusively for CPU {} ({} / {})",
                c.workload_cpu, WORKLOAD_GROUP, BACKGROUND_GROUP
            ));
        }
        if let Some(FreqRequest::Khz(khz)) = c.freq {
            lines.push(format!("  pin CPUs {:?} to {khz} kHz", c.freq_cpus));
        }
        if let Some(PowerCapRequest::Watts(w)) = c.pkg_cap {
            lines.push(format!("  cap package power at {w} W"));
        }
        if let Some(PowerCapRequest::Watts(w)) = c.dram_cap {
            lines.push(format!("  cap DRAM power at {w} W"));
        }
        if let Some(state) = c.turbo {
            lines.push(format!("  set turbo {state:?}"));
        }
        if let Some(request) = c.idle {
            lines.push(format!("  restrict idle states: {request:?}"));
        }
        if let Some(FreqRequest::Khz(khz)) = c.uncore {
            lines.push(format!("  pin uncore to {khz} kHz"));
        }
        if let Some(spec) = c.prefetch {
            lines.push(format!(
                "  set prefetcher enable bits to {:04b} on CPU {}",
                spec.enable_bits(),
                c.workload_cpu
            ));
        }
        for sidecar in &c.sidecars {
            lines.push(format!(
                "  supervise sidecar '{}' on CPU {}: {}",
                sidecar.name, c.tools_cpu, sidecar.command
            ));
        }
        lines.push(format!(
            "  wait for quiescence (min {}, target {}, max {})",
            humantime::format_duration(c.quiesce.min_sleep),
            c.quiesce.target,
            humantime::format_duration(c.quiesce.max_wait),
        ));
        match &c.workload {
            Some(cmd) => lines.push(format!("  run workload on CPU {}: {cmd}", c.workload_cpu)),
            None => lines.push("  no workload; verify and release".to_string()),
        }
        lines.push("  restore everything in reverse order".to_string());
        lines
    }
}

fn optional(what: &str, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_capability() => {
            warn!(what, error = %e, "platform lacks this capability, skipping");
            Ok(())
        }
        other => other,
    }
}
