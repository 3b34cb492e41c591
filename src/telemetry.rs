//! Register sets read together and the readings produced from them.

use crate::registers::{self, Register, Value};
use crate::transport::{self, Transport};
use futures::Stream;
use std::time::Duration;
use tokio::time::Instant;

/// Registers inspected by the status monitor.
pub static STATUS_REGISTERS: &[&Register] = &[
    &registers::TIME,
    &registers::BATTERY_STATUS,
    &registers::MPV_MODE,
    &registers::BOARD_FAULT_MSG,
    &registers::MASTER_FAULT_MSG,
    &registers::MASTER_FAULT_MSG2,
    &registers::ERROR_COUNT,
];

/// Registers describing the power flow, sampled by the energy counter and the power sweep.
pub static POWER_REGISTERS: &[&Register] = &[
    &registers::METER_A_POWER,
    &registers::BATTERY_POWER,
    &registers::GRID_POWER,
    &registers::PV1_POWER,
    &registers::PV2_POWER,
    &registers::BATTERY_SOC,
    &registers::BATTERY_VOLTAGE,
    &registers::BATTERY_CURRENT,
    &registers::BATTERY_TEMP,
    &registers::SINK_TEMP,
    &registers::AMBIENT_TEMP,
];

#[derive(Debug)]
pub struct Reading {
    pub register: &'static Register,
    pub value: Result<Value, transport::Error>,
}

impl Reading {
    /// The decoded value, if the read succeeded and the data was valid.
    pub fn valid(&self) -> Option<&Value> {
        self.value.as_ref().ok().filter(|v| v.is_valid())
    }

    /// Renders the reading for display, using `unreadable` for transport failures.
    pub fn display_value(&self) -> String {
        match &self.value {
            Ok(value) if self.register.unit.is_empty() => value.to_string(),
            Ok(value @ (Value::Unsigned { .. } | Value::Signed { .. })) => {
                format!("{value} {}", self.register.unit)
            }
            Ok(value) => value.to_string(),
            Err(_) => "unreadable".to_string(),
        }
    }
}

impl serde::Serialize for Reading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("Reading", 4)?;
        s.serialize_field("name", self.register.name)?;
        s.serialize_field("address", &self.register.spec.address)?;
        match &self.value {
            Ok(value) => {
                s.serialize_field("value", value)?;
                s.serialize_field("error", &None::<String>)?;
            }
            Err(e) => {
                s.serialize_field("value", &None::<Value>)?;
                s.serialize_field("error", &e.to_string())?;
            }
        }
        s.end()
    }
}

/// Read every register in `set`, in order.
///
/// A failed read is recorded in its [`Reading`] and does not stop the remaining reads.
pub async fn snapshot<T: Transport>(transport: &T, set: &[&'static Register]) -> Vec<Reading> {
    let mut readings = Vec::with_capacity(set.len());
    for &register in set {
        let value = transport.read_value(register.spec).await;
        if let Err(e) = &value {
            tracing::debug!(
                message = "register read failed",
                register = register.name,
                error = (e as &dyn std::error::Error)
            );
        }
        readings.push(Reading { register, value });
    }
    readings
}

/// Snapshot `set` right away and then every `every`, without end.
///
/// Cycles start `every` apart; a cycle that takes longer delays the next one.
pub fn watch<'a, T: Transport>(
    transport: &'a T,
    set: &'a [&'static Register],
    every: Duration,
) -> impl Stream<Item = Vec<Reading>> + 'a {
    async_stream::stream! {
        let mut ticks = tokio::time::interval(every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            yield snapshot(transport, set).await;
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Average {
    pub register: &'static Register,
    /// Number of cycles that produced a numeric value.
    pub samples: usize,
    pub mean: Option<f64>,
}

/// Read `set` for `cycles` cycles, `interval` apart, and average each register's values.
///
/// Failed reads and non-numeric values are left out of the average.
pub async fn average<T: Transport>(
    transport: &T,
    set: &[&'static Register],
    cycles: usize,
    interval: Duration,
) -> Vec<Average> {
    let mut sums = vec![(0usize, 0.0f64); set.len()];
    for cycle in 0..cycles {
        if cycle != 0 {
            tokio::time::sleep(interval).await;
        }
        let readings = snapshot(transport, set).await;
        for ((samples, sum), reading) in sums.iter_mut().zip(&readings) {
            if let Some(value) = reading.valid().and_then(Value::as_f64) {
                *samples += 1;
                *sum += value;
            }
        }
    }
    set.iter()
        .zip(sums)
        .map(|(&register, (samples, sum))| Average {
            register,
            samples,
            mean: (samples != 0).then(|| sum / samples as f64),
        })
        .collect()
}

#[derive(Debug, PartialEq, serde::Serialize)]
pub struct LatencyStats {
    pub valid: usize,
    pub failed: usize,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub stddev: Duration,
}

/// Time `count` consecutive reads of `register`.
///
/// Only reads that returned data are included in the statistics.
pub async fn probe_latency<T: Transport>(
    transport: &T,
    register: &Register,
    count: usize,
) -> LatencyStats {
    let mut timings = Vec::with_capacity(count);
    for _ in 0..count {
        let start = Instant::now();
        match transport.read_holdings(register.spec.address, register.spec.words).await {
            Ok(_) => timings.push(start.elapsed().as_secs_f64()),
            Err(e) => tracing::debug!(
                message = "latency probe read failed",
                error = (&e as &dyn std::error::Error)
            ),
        }
    }
    let valid = timings.len();
    let mean = if valid == 0 { 0.0 } else { timings.iter().sum::<f64>() / valid as f64 };
    let variance = if valid == 0 {
        0.0
    } else {
        timings.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / valid as f64
    };
    let min = timings.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = timings.iter().copied().reduce(f64::max).unwrap_or(0.0);
    LatencyStats {
        valid,
        failed: count - valid,
        mean: Duration::from_secs_f64(mean),
        min: Duration::from_secs_f64(min),
        max: Duration::from_secs_f64(max),
        stddev: Duration::from_secs_f64(variance.sqrt()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    #[tokio::test]
    async fn snapshot_keeps_going_after_failures() {
        let device = MockTransport::default();
        device
            .set(registers::BATTERY_POWER.spec.address, (-750i16) as u16)
            .fail_reads(registers::GRID_POWER.spec.address);
        let readings = snapshot(&device, POWER_REGISTERS).await;
        assert_eq!(readings.len(), POWER_REGISTERS.len());
        assert_eq!(device.read_count(), POWER_REGISTERS.len());
        let battery = readings.iter().find(|r| r.register.name == "BATTERY_POWER").unwrap();
        assert_eq!(battery.valid().and_then(Value::as_f64), Some(-750.0));
        assert_eq!(battery.display_value(), "-750 W");
        let grid = readings.iter().find(|r| r.register.name == "GRID_POWER").unwrap();
        assert!(grid.value.is_err());
        assert_eq!(grid.display_value(), "unreadable");
    }

    #[test]
    fn status_set_covers_fault_words() {
        for name in ["BOARD_FAULT_MSG", "MASTER_FAULT_MSG", "MASTER_FAULT_MSG2", "ERROR_COUNT"] {
            assert!(STATUS_REGISTERS.iter().any(|r| r.name == name));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watch_repeats_the_power_set() {
        use futures::StreamExt as _;
        let device = MockTransport::default();
        device.script(registers::BATTERY_POWER.spec.address, [100, 200, 300]);
        let start = Instant::now();
        let cycles = watch(&device, POWER_REGISTERS, Duration::from_secs(5))
            .take(3)
            .collect::<Vec<_>>()
            .await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(15));
        assert_eq!(device.read_count(), 3 * POWER_REGISTERS.len());
        let battery = cycles
            .iter()
            .map(|readings| {
                let reading = readings.iter().find(|r| r.register.name == "BATTERY_POWER").unwrap();
                reading.valid().and_then(Value::as_f64).unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(battery, [100.0, 200.0, 300.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn averages_numeric_values() {
        let device = MockTransport::default();
        let soc = registers::BATTERY_SOC.spec.address;
        device.script(soc, [5000, 5100, 5200, 5300, 5400]);
        device.fail_reads(registers::GRID_POWER.spec.address);
        let set = [&registers::BATTERY_SOC, &registers::GRID_POWER, &registers::TIME];
        let start = Instant::now();
        let averages = average(&device, &set, 5, Duration::from_secs(1)).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(averages[0].samples, 5);
        assert!((averages[0].mean.unwrap() - 52.0).abs() < 1e-9);
        assert_eq!((averages[1].samples, averages[1].mean), (0, None));
        assert_eq!((averages[2].samples, averages[2].mean), (0, None));
    }

    #[tokio::test]
    async fn latency_counts_failures() {
        let device = MockTransport::default();
        let stats = probe_latency(&device, &registers::BATTERY_POWER, 10).await;
        assert_eq!((stats.valid, stats.failed), (10, 0));
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        device.fail_reads(registers::BATTERY_POWER.spec.address);
        let stats = probe_latency(&device, &registers::BATTERY_POWER, 4).await;
        assert_eq!((stats.valid, stats.failed), (0, 4));
        assert_eq!(stats.mean, Duration::ZERO);
    }
}
