//! Stepping the passive battery power through a range of setpoints.
//!
//! The inverter is first switched into the passive mode matching the sweep direction. Each step writes the setpoint, holds it for a number of minutes and samples the power registers
//! at chosen minutes of the hold. A step whose setpoint cannot be written is skipped; the sweep as
//! a whole always runs to its end.

use crate::control::{self, PassiveMode, Step, StepOutcome};
use crate::registers::{self, Register};
use crate::session::Session;
use crate::telemetry::{self, POWER_REGISTERS, Reading};
use crate::transport::{self, Transport};
use futures::Stream;
use std::time::Duration;
use tracing::{info, warn};

/// Nameplate power the per-unit setpoints are relative to.
pub const RATED_POWER_W: f64 = 5000.0;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, strum::Display, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Charge,
    Discharge,
}

impl Direction {
    pub fn register(self) -> &'static Register {
        match self {
            Direction::Charge => &registers::PASSIVE_BAT_CHARGE_POWER,
            Direction::Discharge => &registers::PASSIVE_BAT_DISCHARGE_POWER,
        }
    }

    /// The passive mode in which this direction's setpoints take effect.
    pub fn passive_mode(self) -> PassiveMode {
        match self {
            Direction::Charge => PassiveMode::Charge,
            Direction::Discharge => PassiveMode::Discharge,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("the sweep step must be larger than zero")]
    ZeroStep,
    #[error("the sweep starts at {start_w} W which is above its end at {stop_w} W")]
    EmptyRange { start_w: u32, stop_w: u32 },
    #[error("sampling at minute {minute} is outside of the {hold_minutes} minute hold")]
    SampleOutsideHold { minute: u32, hold_minutes: u32 },
    #[error("a setpoint of {setpoint_w} W does not fit into the power register")]
    SetpointOutOfRange { setpoint_w: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepPlan {
    direction: Direction,
    start_w: u32,
    stop_w: u32,
    step_w: u32,
    hold_minutes: u32,
    sample_minutes: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PowerSweepStep {
    pub setpoint_w: u32,
    pub raw: u16,
}

#[derive(Debug)]
pub struct Sample {
    pub minute: u32,
    pub readings: Vec<Reading>,
}

#[derive(Debug)]
pub struct StepReport {
    pub step: PowerSweepStep,
    /// The samples taken while the setpoint was held, or why the setpoint could not be written.
    pub outcome: Result<Vec<Sample>, transport::Error>,
}

impl SweepPlan {
    pub fn new(
        direction: Direction,
        start_w: u32,
        stop_w: u32,
        step_w: u32,
        hold_minutes: u32,
        sample_minutes: Vec<u32>,
    ) -> Result<Self, Error> {
        if step_w == 0 {
            return Err(Error::ZeroStep);
        }
        if start_w > stop_w {
            return Err(Error::EmptyRange { start_w, stop_w });
        }
        if let Some(&minute) = sample_minutes.iter().find(|&&m| m == 0 || m > hold_minutes) {
            return Err(Error::SampleOutsideHold { minute, hold_minutes });
        }
        let plan = Self { direction, start_w, stop_w, step_w, hold_minutes, sample_minutes };
        raw_setpoint(plan.direction.register(), stop_w)
            .ok_or(Error::SetpointOutOfRange { setpoint_w: stop_w })?;
        Ok(plan)
    }

    /// 500 W to 4500 W in 500 W steps, each held for two minutes and sampled at its end.
    pub fn charge() -> Self {
        Self {
            direction: Direction::Charge,
            start_w: 500,
            stop_w: 4500,
            step_w: 500,
            hold_minutes: 2,
            sample_minutes: vec![2],
        }
    }

    /// 2000 W to 4500 W in 500 W steps, each held for three minutes and sampled twice.
    pub fn discharge() -> Self {
        Self {
            direction: Direction::Discharge,
            start_w: 2000,
            stop_w: 4500,
            step_w: 500,
            hold_minutes: 3,
            sample_minutes: vec![1, 3],
        }
    }

    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Charge => Self::charge(),
            Direction::Discharge => Self::discharge(),
        }
    }

    /// Replace parts of this plan, validating the result like [`SweepPlan::new`].
    pub fn with_overrides(
        self,
        start_w: Option<u32>,
        stop_w: Option<u32>,
        step_w: Option<u32>,
        hold_minutes: Option<u32>,
        sample_minutes: Option<Vec<u32>>,
    ) -> Result<Self, Error> {
        Self::new(
            self.direction,
            start_w.unwrap_or(self.start_w),
            stop_w.unwrap_or(self.stop_w),
            step_w.unwrap_or(self.step_w),
            hold_minutes.unwrap_or(self.hold_minutes),
            sample_minutes.unwrap_or(self.sample_minutes),
        )
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn steps(&self) -> impl Iterator<Item = PowerSweepStep> + '_ {
        let register = self.direction.register();
        (self.start_w..=self.stop_w).step_by(self.step_w as usize).filter_map(move |setpoint_w| {
            let raw = raw_setpoint(register, setpoint_w)?;
            Some(PowerSweepStep { setpoint_w, raw })
        })
    }

    pub fn duration(&self) -> Duration {
        MINUTE * self.hold_minutes * self.steps().count() as u32
    }
}

fn raw_setpoint(register: &Register, setpoint_w: u32) -> Option<u16> {
    let raw = (f64::from(setpoint_w) / (register.spec.factor() * RATED_POWER_W)).round();
    register.spec.to_word(raw as i64)
}

/// Switch the inverter into the passive mode `plan` needs before any setpoint is written.
pub async fn engage<T: Transport + 'static>(
    session: &Session<T>,
    plan: &SweepPlan,
) -> Result<Vec<(Step, StepOutcome)>, control::Error> {
    control::engage(session, plan.direction.passive_mode(), None).await
}

/// Execute `plan`, yielding a report once each step has completed.
pub fn run<'a, T: Transport>(
    transport: &'a T,
    plan: &'a SweepPlan,
) -> impl Stream<Item = StepReport> + 'a {
    async_stream::stream! {
        let register = plan.direction.register();
        for step in plan.steps() {
            info!(
                message = "setting the power setpoint",
                direction = %plan.direction,
                setpoint_w = step.setpoint_w,
                raw = step.raw
            );
            if let Err(e) = transport.write_holding(register.spec.address, step.raw).await {
                warn!(
                    message = "could not write the setpoint, skipping the step",
                    setpoint_w = step.setpoint_w,
                    error = (&e as &dyn std::error::Error)
                );
                yield StepReport { step, outcome: Err(e) };
                continue;
            }
            let mut samples = Vec::with_capacity(plan.sample_minutes.len());
            for minute in 1..=plan.hold_minutes {
                tokio::time::sleep(MINUTE).await;
                if plan.sample_minutes.contains(&minute) {
                    let readings = telemetry::snapshot(transport, POWER_REGISTERS).await;
                    samples.push(Sample { minute, readings });
                }
            }
            yield StepReport { step, outcome: Ok(samples) };
        }
    }
}
