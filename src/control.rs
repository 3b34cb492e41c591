//! Switching the inverter into passive (externally controlled) charging or discharging.
//!
//! The sequence is:
//!
//! 1. set the application mode to external control;
//! 2. enable passive charging or discharging;
//! 3. optionally start counting the transferred energy.
//!
//! A failed step aborts the rest of the sequence. Steps that already completed are not undone.

use crate::energy::{self, Start};
use crate::registers;
use crate::session::Session;
use crate::transport::{self, Transport};
use tracing::info;

/// [`registers::APP_MODE`] value putting the inverter under external control.
pub const EXTERNAL_CONTROL: u16 = 3;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PassiveMode {
    Charge,
    Discharge,
}

impl PassiveMode {
    /// The [`registers::PASSIVE_CHARGE_ENABLE`] value selecting this mode.
    pub fn enable_code(self) -> u16 {
        match self {
            PassiveMode::Charge => 2,
            PassiveMode::Discharge => 1,
        }
    }

    pub fn parse(mode: &str) -> Result<Self, Error> {
        mode.parse().map_err(|_| Error::InvalidMode(mode.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, serde::Serialize)]
pub enum Step {
    #[strum(to_string = "set the application mode")]
    SetAppMode,
    #[strum(to_string = "enable passive mode")]
    EnablePassive,
    #[strum(to_string = "start energy counting")]
    StartEnergyCounting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Written { address: u16, value: u16 },
    CounterStarted,
    CounterAlreadyRunning,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a passive mode (expected `charge` or `discharge`)")]
    InvalidMode(String),
    #[error("could not {step} (completed steps: {completed:?})")]
    Aborted {
        step: Step,
        completed: Vec<Step>,
        #[source]
        source: transport::Error,
    },
}

/// Put the inverter into passive `mode`, counting energy if `energy` is given.
pub async fn engage<T: Transport + 'static>(
    session: &Session<T>,
    mode: PassiveMode,
    energy: Option<energy::Args>,
) -> Result<Vec<(Step, StepOutcome)>, Error> {
    let mut outcomes = Vec::with_capacity(3);
    let writes = [
        (Step::SetAppMode, registers::APP_MODE.spec.address, EXTERNAL_CONTROL),
        (Step::EnablePassive, registers::PASSIVE_CHARGE_ENABLE.spec.address, mode.enable_code()),
    ];
    for (step, address, value) in writes {
        if let Err(source) = session.transport().write_holding(address, value).await {
            let completed = outcomes.iter().map(|(step, _)| *step).collect();
            return Err(Error::Aborted { step, completed, source });
        }
        info!(message = "control step done", %step, address, value);
        outcomes.push((step, StepOutcome::Written { address, value }));
    }
    if let Some(args) = energy {
        let outcome = match session.start_energy_counting(args) {
            Start::Started => StepOutcome::CounterStarted,
            Start::AlreadyRunning => StepOutcome::CounterAlreadyRunning,
        };
        outcomes.push((Step::StartEnergyCounting, outcome));
    }
    info!(message = "passive mode engaged", %mode);
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    const APP_MODE: u16 = 0x3647;
    const PASSIVE_ENABLE: u16 = 0x3636;

    #[test]
    fn parses_modes() {
        assert_eq!(PassiveMode::parse("Charge").unwrap(), PassiveMode::Charge);
        assert_eq!(PassiveMode::parse("discharge").unwrap(), PassiveMode::Discharge);
        let error = PassiveMode::parse("idle").unwrap_err();
        assert!(matches!(&error, Error::InvalidMode(mode) if mode == "idle"));
    }

    #[tokio::test]
    async fn writes_mode_then_enable() {
        let session = Session::new(MockTransport::default());
        let outcomes = engage(&session, PassiveMode::Discharge, None).await.unwrap();
        assert_eq!(session.transport().writes(), [(APP_MODE, 3), (PASSIVE_ENABLE, 1)]);
        assert_eq!(
            outcomes,
            [
                (Step::SetAppMode, StepOutcome::Written { address: APP_MODE, value: 3 }),
                (Step::EnablePassive, StepOutcome::Written { address: PASSIVE_ENABLE, value: 1 }),
            ]
        );
        assert!(!session.energy().is_running());
    }

    #[tokio::test]
    async fn first_failure_stops_the_sequence() {
        let device = MockTransport::default();
        device.fail_writes(APP_MODE);
        let session = Session::new(device);
        let error = engage(&session, PassiveMode::Charge, Some(energy::Args::default()))
            .await
            .unwrap_err();
        let Error::Aborted { step, completed, source } = error else { panic!("unexpected error") };
        assert_eq!(step, Step::SetAppMode);
        assert!(completed.is_empty());
        assert!(matches!(source, transport::Error::Timeout));
        assert_eq!(session.transport().writes(), [(APP_MODE, 3)]);
        assert!(!session.energy().is_running());
    }

    #[tokio::test]
    async fn enable_failure_names_completed_steps() {
        let device = MockTransport::default();
        device.fail_writes(PASSIVE_ENABLE);
        let session = Session::new(device);
        let error = engage(&session, PassiveMode::Charge, None).await.unwrap_err();
        let Error::Aborted { step, completed, .. } = error else { panic!("unexpected error") };
        assert_eq!(step, Step::EnablePassive);
        assert_eq!(completed, [Step::SetAppMode]);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_energy_counting_once() {
        let device = MockTransport::default();
        device.set(registers::BATTERY_POWER.spec.address, 2500);
        let session = Session::new(device);
        let outcomes =
            engage(&session, PassiveMode::Charge, Some(energy::Args::default())).await.unwrap();
        assert_eq!(outcomes[2], (Step::StartEnergyCounting, StepOutcome::CounterStarted));
        let outcomes =
            engage(&session, PassiveMode::Charge, Some(energy::Args::default())).await.unwrap();
        assert_eq!(outcomes[2], (Step::StartEnergyCounting, StepOutcome::CounterAlreadyRunning));
        assert!(session.shutdown().await.1.is_some());
    }
}
