//! Programming the first scheduled charge or discharge window.

use crate::registers::{self, Register};
use crate::transport::{self, Transport};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Value written to the time-enable register to activate the first window.
pub const FIRST_WINDOW_ENABLED: u16 = 0b1;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a time of day, expected `HH:MM`")]
    InvalidTime(String),
    #[error("hour {0} is out of range (0-23)")]
    HourOutOfRange(u8),
    #[error("minute {0} is out of range (0-59)")]
    MinuteOutOfRange(u8),
    #[error("`{0}` is not a weekday mask")]
    InvalidWeekdays(String),
    #[error("weekday mask {0:#b} has bits set above the sixth day (expected at most 0b111111)")]
    WeekdaysOutOfRange(u16),
    #[error("power of {0}% is out of range (0-100)")]
    PowerOutOfRange(u8),
    #[error("could not enable the {0} window")]
    EnableControl(WindowKind, #[source] transport::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, Error> {
        if hour > 23 {
            return Err(Error::HourOutOfRange(hour));
        }
        if minute > 59 {
            return Err(Error::MinuteOutOfRange(minute));
        }
        Ok(Self { hour, minute })
    }

    fn encode(self) -> u16 {
        u16::from(self.hour) << 8 | u16::from(self.minute)
    }
}

impl FromStr for ClockTime {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Days a window recurs on, one bit per day across six bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const MAX: u16 = 0b11_1111;

    pub fn new(mask: u16) -> Result<Self, Error> {
        u8::try_from(mask)
            .ok()
            .filter(|m| u16::from(*m) <= Self::MAX)
            .map(Weekdays)
            .ok_or(Error::WeekdaysOutOfRange(mask))
    }
}

/// Accepts `0b010000`, `0x10` and plain decimal masks.
impl FromStr for Weekdays {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(binary) = s.strip_prefix("0b") {
            u16::from_str_radix(binary, 2)
        } else if let Some(hex) = s.strip_prefix("0x") {
            u16::from_str_radix(hex, 16)
        } else {
            s.parse()
        };
        Self::new(parsed.map_err(|_| Error::InvalidWeekdays(s.to_string()))?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ScheduleWindow {
    pub start: ClockTime,
    pub end: ClockTime,
    pub weekdays: Weekdays,
    /// Percentage of the rated power.
    pub power_percent: u8,
}

impl ScheduleWindow {
    pub fn new(
        start: ClockTime,
        end: ClockTime,
        weekdays: Weekdays,
        power_percent: u8,
    ) -> Result<Self, Error> {
        if power_percent > 100 {
            return Err(Error::PowerOutOfRange(power_percent));
        }
        Ok(Self { start, end, weekdays, power_percent })
    }

    /// Start, end and recurrence words, in register order.
    pub fn encode(&self) -> [u16; 3] {
        [
            self.start.encode(),
            self.end.encode(),
            u16::from(self.weekdays.0) << 8 | u16::from(self.power_percent),
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, strum::Display, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Charge,
    Discharge,
}

impl WindowKind {
    fn enable_register(self) -> &'static Register {
        match self {
            WindowKind::Charge => &registers::CHARGE_TIME_ENABLE,
            WindowKind::Discharge => &registers::DISCHARGE_TIME_ENABLE,
        }
    }

    fn window_registers(self) -> [&'static Register; 3] {
        match self {
            WindowKind::Charge => [
                &registers::FIRST_CHARGE_START_TIME,
                &registers::FIRST_CHARGE_END_TIME,
                &registers::FIRST_CHARGE_POWER_TIME,
            ],
            WindowKind::Discharge => [
                &registers::FIRST_DISCHARGE_START_TIME,
                &registers::FIRST_DISCHARGE_END_TIME,
                &registers::FIRST_DISCHARGE_POWER_TIME,
            ],
        }
    }
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub register: &'static Register,
    pub value: u16,
    pub result: Result<(), transport::Error>,
}

/// Enable the first `kind` window and write `window` into it.
///
/// Only a failure to enable the window is an error. The window words are then written one by one
/// and the outcome of each write is reported.
pub async fn program<T: Transport>(
    transport: &T,
    kind: WindowKind,
    window: &ScheduleWindow,
) -> Result<Vec<WriteOutcome>, Error> {
    transport
        .write_holding(kind.enable_register().spec.address, FIRST_WINDOW_ENABLED)
        .await
        .map_err(|e| Error::EnableControl(kind, e))?;
    info!(message = "scheduled window enabled", %kind);
    let mut outcomes = Vec::with_capacity(3);
    for (register, value) in kind.window_registers().into_iter().zip(window.encode()) {
        let result = transport.write_holding(register.spec.address, value).await;
        match &result {
            Ok(()) => info!(message = "window word written", register = register.name, value),
            Err(e) => warn!(
                message = "could not write a window word",
                register = register.name,
                value,
                error = (e as &dyn std::error::Error)
            ),
        }
        outcomes.push(WriteOutcome { register, value, result });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    fn window() -> ScheduleWindow {
        ScheduleWindow::new(
            "06:30".parse().unwrap(),
            "23:05".parse().unwrap(),
            "0b010000".parse().unwrap(),
            50,
        )
        .unwrap()
    }

    #[test]
    fn packs_window_words() {
        assert_eq!(window().encode(), [0x061E, 0x1705, 0x1032]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!("24:00".parse::<ClockTime>(), Err(Error::HourOutOfRange(24))));
        assert!(matches!("12:60".parse::<ClockTime>(), Err(Error::MinuteOutOfRange(60))));
        assert!(matches!("noon".parse::<ClockTime>(), Err(Error::InvalidTime(_))));
        assert!(matches!("0x80".parse::<Weekdays>(), Err(Error::WeekdaysOutOfRange(0x80))));
        assert!(matches!("weekend".parse::<Weekdays>(), Err(Error::InvalidWeekdays(_))));
        let time = ClockTime::new(1, 0).unwrap();
        let days = Weekdays::new(0x3F).unwrap();
        assert!(matches!(
            ScheduleWindow::new(time, time, days, 101),
            Err(Error::PowerOutOfRange(101))
        ));
    }

    #[test]
    fn weekday_mask_has_six_days() {
        assert_eq!("0b111111".parse::<Weekdays>().unwrap(), Weekdays::new(0x3F).unwrap());
        assert!(matches!(
            "0b1000000".parse::<Weekdays>(),
            Err(Error::WeekdaysOutOfRange(0b100_0000))
        ));
        assert!(matches!(Weekdays::new(0x7F), Err(Error::WeekdaysOutOfRange(0x7F))));
    }

    #[tokio::test]
    async fn enables_then_writes_window() {
        let device = MockTransport::default();
        let outcomes = program(&device, WindowKind::Charge, &window()).await.unwrap();
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(
            device.writes(),
            [(0x3604, 1), (0x3606, 0x061E), (0x3607, 0x1705), (0x3608, 0x1032)]
        );
    }

    #[tokio::test]
    async fn enable_failure_aborts() {
        let device = MockTransport::default();
        device.fail_writes(0x3605);
        let error = program(&device, WindowKind::Discharge, &window()).await.unwrap_err();
        assert!(matches!(error, Error::EnableControl(WindowKind::Discharge, _)));
        assert_eq!(device.writes(), [(0x3605, 1)]);
    }

    #[tokio::test]
    async fn window_writes_are_best_effort() {
        let device = MockTransport::default();
        device.fail_writes(0x361C);
        let outcomes = program(&device, WindowKind::Discharge, &window()).await.unwrap();
        let failed = outcomes.iter().map(|o| o.result.is_err()).collect::<Vec<_>>();
        assert_eq!(failed, [false, true, false]);
        assert_eq!(device.writes().len(), 4);
    }
}
