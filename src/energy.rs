//! Integration of the battery power into transferred energy.
//!
//! A counter samples the battery power register at a fixed interval and accumulates
//! `|power| × elapsed` until the power drops below a threshold or it is told to stop. At most one
//! counter runs per [`EnergyCounter`].

use crate::registers;
use crate::telemetry::{self, POWER_REGISTERS};
use crate::transport::Transport;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "energy::Args")]
pub struct Args {
    /// How often the battery power is sampled.
    #[arg(long, default_value = "1s")]
    pub sample_interval: humantime::Duration,

    /// How often a snapshot of all the power registers is logged while counting.
    #[arg(long, default_value = "8min")]
    pub snapshot_interval: humantime::Duration,

    /// Stop counting on the first sample whose absolute battery power is below this many watts.
    #[arg(long, default_value = "200")]
    pub stop_below_watts: f64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1).into(),
            snapshot_interval: Duration::from_secs(8 * 60).into(),
            stop_below_watts: 200.0,
        }
    }
}

pub struct EnergyAccumulator {
    total_wh: f64,
    last_sample: Instant,
}

impl EnergyAccumulator {
    pub fn new(now: Instant) -> Self {
        Self { total_wh: 0.0, last_sample: now }
    }

    /// Add the energy transferred since the previous sample at `power_w` watts.
    ///
    /// The sign of `power_w` is ignored; charging and discharging both count.
    pub fn add_sample(&mut self, power_w: f64, now: Instant) -> f64 {
        let hours = now.saturating_duration_since(self.last_sample).as_secs_f64() / 3600.0;
        self.total_wh += power_w.abs() * hours;
        self.last_sample = now;
        self.total_wh
    }

    pub fn total_wh(&self) -> f64 {
        self.total_wh
    }
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stop {
    BelowThreshold { power_w: f64 },
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct EnergyReport {
    pub total_wh: f64,
    pub elapsed: Duration,
    pub stop: Stop,
}

/// Count energy until the battery power drops below the threshold or `cancel` fires.
///
/// Read failures are logged and skipped. They do not contribute to the total; the next successful
/// sample covers the time since the last successful one.
pub async fn count_energy<T: Transport>(
    transport: &T,
    args: &Args,
    cancel: &CancellationToken,
) -> EnergyReport {
    let started = Instant::now();
    let mut accumulator = EnergyAccumulator::new(started);
    let mut next_snapshot = started + *args.snapshot_interval;
    info!(message = "energy counting started", threshold_w = args.stop_below_watts);
    let stop = loop {
        if cancel.is_cancelled() {
            break Stop::Cancelled;
        }
        match transport.read_value(registers::BATTERY_POWER.spec).await {
            Ok(value) => match value.as_f64() {
                Some(power_w) if power_w.abs() < args.stop_below_watts => {
                    break Stop::BelowThreshold { power_w };
                }
                Some(power_w) => {
                    let total_wh = accumulator.add_sample(power_w, Instant::now());
                    debug!(message = "battery power sampled", power_w, total_wh);
                }
                None => warn!(message = "battery power did not decode", %value),
            },
            Err(e) => warn!(
                message = "could not read the battery power",
                error = (&e as &dyn std::error::Error)
            ),
        }
        if Instant::now() >= next_snapshot {
            let readings = telemetry::snapshot(transport, POWER_REGISTERS).await;
            let readings = readings
                .iter()
                .map(|r| format!("{}={}", r.register.name, r.display_value()))
                .collect::<Vec<_>>()
                .join(" ");
            info!(message = "energy snapshot", total_wh = accumulator.total_wh(), %readings);
            next_snapshot += *args.snapshot_interval;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(*args.sample_interval) => {}
        }
    };
    let report = EnergyReport { total_wh: accumulator.total_wh(), elapsed: started.elapsed(), stop };
    info!(
        message = "energy counting stopped",
        total_wh = report.total_wh,
        elapsed = %humantime::format_duration(report.elapsed),
        stop = ?report.stop,
    );
    report
}

#[derive(Debug, PartialEq, Eq)]
pub enum Start {
    Started,
    AlreadyRunning,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<EnergyReport>,
}

/// Keeps track of the energy counter of a session.
#[derive(Default)]
pub struct EnergyCounter {
    running: Mutex<Option<Running>>,
}

impl EnergyCounter {
    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a counter unless one is already running.
    ///
    /// The counter stops when `parent` is cancelled too.
    pub fn start<T: Transport + 'static>(
        &self,
        transport: Arc<T>,
        args: Args,
        parent: &CancellationToken,
    ) -> Start {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Start::AlreadyRunning;
        }
        let cancel = parent.child_token();
        let task = tokio::task::spawn({
            let cancel = cancel.clone();
            async move { count_energy(&*transport, &args, &cancel).await }
        });
        *running = Some(Running { cancel, task });
        Start::Started
    }

    pub fn is_running(&self) -> bool {
        self.running().as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Stop the counter and wait for its final report.
    ///
    /// Returns `None` if no counter was started.
    pub async fn stop(&self) -> Option<Result<EnergyReport, JoinError>> {
        let running = self.running().take()?;
        running.cancel.cancel();
        Some(running.task.await)
    }

    /// Wait for the counter to stop on its own.
    pub async fn finish(&self) -> Option<Result<EnergyReport, JoinError>> {
        let running = self.running().take()?;
        Some(running.task.await)
    }
}
