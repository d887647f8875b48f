//! Quiescence waiting
//!
//! Sleeps an unconditional minimum settle duration, then polls a thermal
//! signal until it drops to the target or the maximum total wait elapses.
//! Without a usable sensor the wait proceeds after the minimum sleep and
//! reports that quiescence could not be confirmed.

use crate::config::QuiesceSettings;
use crate::error::{Result, ShieldError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How an idle wait terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuiesceOutcome {
    /// The reading dropped to the target
    Settled {
        /// Total time waited
        elapsed: Duration,
        /// Final sensor reading
        last_reading: i64,
    },
    /// The maximum wait elapsed with the reading still above target
    TimedOut {
        /// Total time waited
        elapsed: Duration,
        /// Final sensor reading
        last_reading: i64,
    },
    /// No sensor was available; only the minimum sleep was honored
    Unconfirmed {
        /// Time slept
        elapsed: Duration,
    },
}

/// Blocks until the system is thermally settled or a timeout fires
pub struct QuiescenceWaiter {
    settings: QuiesceSettings,
    thermal_root: PathBuf,
}

impl QuiescenceWaiter {
    /// Create a waiter; `thermal_root` is scanned when no explicit sensor
    /// was configured
    pub fn new(settings: QuiesceSettings, thermal_root: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            thermal_root: thermal_root.into(),
        }
    }

    /// Wait for quiescence.
    ///
    /// The cancel flag is honored between sleep slices so an interrupt
    /// reaches teardown promptly.
    pub fn idle_wait(&self, cancel: &AtomicBool) -> Result<QuiesceOutcome> {
        let start = Instant::now();
        info!(
            min_sleep = %humantime::format_duration(self.settings.min_sleep),
            "settling"
        );
        sleep_cancellable(self.settings.min_sleep, cancel)?;

        let sensor = match self.sensor_path() {
            Some(path) => path,
            None => {
                warn!("no thermal sensor available; quiescence unconfirmed");
                return Ok(QuiesceOutcome::Unconfirmed {
                    elapsed: start.elapsed(),
                });
            }
        };

        loop {
            let reading = read_reading(&sensor)?;
            if reading <= self.settings.target {
                let elapsed = start.elapsed();
                info!(
                    reading,
                    elapsed = %humantime::format_duration(elapsed),
                    "quiescence threshold reached"
                );
                return Ok(QuiesceOutcome::Settled {
                    elapsed,
                    last_reading: reading,
                });
            }
            if start.elapsed() >= self.settings.max_wait {
                let elapsed = start.elapsed();
                warn!(
                    reading,
                    target = self.settings.target,
                    elapsed = %humantime::format_duration(elapsed),
                    "quiescence wait timed out"
                );
                return Ok(QuiesceOutcome::TimedOut {
                    elapsed,
                    last_reading: reading,
                });
            }
            debug!(reading, target = self.settings.target, "still settling");
            sleep_cancellable(self.settings.step, cancel)?;
        }
    }

    fn sensor_path(&self) -> Option<PathBuf> {
        if let Some(sensor) = &self.settings.sensor {
            return sensor.is_file().then(|| sensor.clone());
        }
        // First readable thermal zone wins.
        let mut zones: Vec<PathBuf> = std::fs::read_dir(&self.thermal_root)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("thermal_zone"))
                    .unwrap_or(false)
            })
            .collect();
        zones.sort();
        zones
            .into_iter()
            .map(|z| z.join("temp"))
            .find(|t| read_reading(t).is_ok())
    }
}

fn read_reading(path: &Path) -> Result<i64> {
    let text = std::fs::read_to_string(path).map_err(|e| ShieldError::io(path, e))?;
    text.trim()
        .parse()
        .map_err(|_| ShieldError::capability(format!("unparseable sensor reading '{}'", text.trim())))
}

/// Sleep in short slices so an external cancellation is noticed quickly
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) -> Result<()> {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(ShieldError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}
