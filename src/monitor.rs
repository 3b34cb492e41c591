//! Periodic polling of the status and fault registers.
//!
//! Most cycles find nothing of interest. A [`StatusReport`] is only produced when the battery
//! status or one of the fault words is non-zero, or when the device reports more than one error.

use crate::faults::{self, Fault, FaultGroup};
use crate::registers::{self, Register, Value};
use crate::telemetry::{self, Reading, STATUS_REGISTERS};
use crate::transport::Transport;
use futures::{Stream, StreamExt as _};
use std::pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fault words and the table each of them is decoded with.
static FAULT_WORDS: [(&Register, FaultGroup); 3] = [
    (&registers::BOARD_FAULT_MSG, FaultGroup::Display),
    (&registers::MASTER_FAULT_MSG, FaultGroup::Master1),
    (&registers::MASTER_FAULT_MSG2, FaultGroup::Master2),
];

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "monitor::Args")]
pub struct Args {
    /// How often the status and fault registers are read.
    #[arg(long = "status-period", default_value = "2min")]
    pub period: humantime::Duration,
}

#[derive(Debug, serde::Serialize)]
pub struct FaultReport {
    pub register: &'static str,
    pub group: FaultGroup,
    pub bitfield: u32,
    pub faults: Vec<Fault>,
}

#[derive(Debug)]
pub struct StatusReport {
    /// The device clock. Only included in the first report of a monitor.
    pub timestamp: Option<Reading>,
    pub readings: Vec<Reading>,
    pub faults: Vec<FaultReport>,
}

impl StatusReport {
    pub fn log(&self) {
        if let Some(time) = &self.timestamp {
            info!(message = "device clock", time = %time.display_value());
        }
        let readings = self
            .readings
            .iter()
            .map(|r| format!("{}={}", r.register.name, r.display_value()))
            .collect::<Vec<_>>()
            .join(" ");
        warn!(message = "inverter status flagged", %readings);
        for report in &self.faults {
            for fault in &report.faults {
                warn!(
                    message = "active fault",
                    register = report.register,
                    group = %report.group,
                    bit = fault.bit,
                    description = %fault.description,
                );
            }
        }
    }
}

#[derive(Default)]
pub struct StatusMonitor {
    timestamp_reported: bool,
}

impl StatusMonitor {
    /// Read the status registers once and report on them if anything is flagged.
    pub async fn poll_once<T: Transport>(&mut self, transport: &T) -> Option<StatusReport> {
        let readings = telemetry::snapshot(transport, STATUS_REGISTERS).await;
        self.evaluate(readings)
    }

    fn evaluate(&mut self, mut readings: Vec<Reading>) -> Option<StatusReport> {
        let unreadable = unreadable_status_words(&readings);
        if !unreadable.is_empty() {
            warn!(message = "status words could not be read, faults may go unnoticed", ?unreadable);
        }
        let time = readings
            .iter()
            .position(|r| r.register.spec.address == registers::TIME.spec.address)
            .map(|index| readings.remove(index));
        // Unreadable or invalid words count as "nothing flagged".
        let bits = |register: &Register| {
            readings
                .iter()
                .find(|r| r.register.spec.address == register.spec.address)
                .and_then(Reading::valid)
                .and_then(Value::as_bits)
        };
        let status_flagged = [&registers::BATTERY_STATUS]
            .into_iter()
            .chain(FAULT_WORDS.iter().map(|(register, _)| *register))
            .any(|register| bits(register).is_some_and(|b| b != 0));
        let errors_flagged = bits(&registers::ERROR_COUNT).is_some_and(|count| count > 1);
        if !status_flagged && !errors_flagged {
            return None;
        }
        let faults = FAULT_WORDS
            .iter()
            .filter_map(|&(register, group)| {
                let bitfield = bits(register).filter(|b| *b != 0)? as u32;
                Some(FaultReport {
                    register: register.name,
                    group,
                    bitfield,
                    faults: faults::decode_faults(bitfield, group.table()),
                })
            })
            .collect();
        let timestamp = if self.timestamp_reported {
            None
        } else {
            self.timestamp_reported = true;
            time
        };
        Some(StatusReport { timestamp, readings, faults })
    }
}

/// Names of the fault-bearing status words in `readings` that did not produce a valid value.
fn unreadable_status_words(readings: &[Reading]) -> Vec<&'static str> {
    readings
        .iter()
        .filter(|r| {
            let address = r.register.spec.address;
            address == registers::BATTERY_STATUS.spec.address
                || address == registers::ERROR_COUNT.spec.address
                || FAULT_WORDS.iter().any(|(register, _)| register.spec.address == address)
        })
        .filter(|r| r.valid().is_none())
        .map(|r| r.register.name)
        .collect()
}

/// Poll the status registers every `args.period` until `cancel` fires.
///
/// Cancellation is observed between cycles; a cycle that has started runs to completion.
pub fn watch<T: Transport>(
    transport: Arc<T>,
    args: Args,
    cancel: CancellationToken,
) -> impl Stream<Item = StatusReport> {
    async_stream::stream! {
        let mut monitor = StatusMonitor::default();
        while !cancel.is_cancelled() {
            if let Some(report) = monitor.poll_once(&*transport).await {
                yield report;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(*args.period) => {}
            }
        }
    }
}

/// Run [`watch`] in the background, logging every report.
pub fn spawn<T: Transport + 'static>(
    transport: Arc<T>,
    args: Args,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut reports = pin::pin!(watch(transport, args, cancel));
        while let Some(report) = reports.next().await {
            report.log();
        }
        debug!("status monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use std::time::Duration;
    use tokio::time::Instant;

    fn address(register: &Register) -> u16 {
        register.spec.address
    }

    #[tokio::test]
    async fn quiet_device_is_never_reported() {
        let device = MockTransport::default();
        device.set(address(&registers::ERROR_COUNT), 1);
        let mut monitor = StatusMonitor::default();
        for _ in 0..3 {
            assert!(monitor.poll_once(&device).await.is_none());
        }
    }

    #[tokio::test]
    async fn error_count_reports_faults() {
        let device = MockTransport::default();
        device
            .set(address(&registers::ERROR_COUNT), 2)
            .set_words(address(&registers::MASTER_FAULT_MSG), &[0, 1 << 12 | 1 << 8]);
        let report = StatusMonitor::default().poll_once(&device).await.unwrap();
        assert_eq!(report.faults.len(), 1);
        let master = &report.faults[0];
        assert_eq!(master.group, FaultGroup::Master1);
        assert_eq!(master.bitfield, 0x1100);
        let bits = master.faults.iter().map(|f| f.bit).collect::<Vec<_>>();
        assert_eq!(bits, [8, 12]);
        assert_eq!(master.faults[1].description, "grid lost");
    }

    #[tokio::test]
    async fn fault_word_alone_is_reported() {
        let device = MockTransport::default();
        device.set_words(address(&registers::BOARD_FAULT_MSG), &[0x0001, 0]);
        let report = StatusMonitor::default().poll_once(&device).await.unwrap();
        assert_eq!(report.faults[0].group, FaultGroup::Display);
        assert_eq!(report.faults[0].faults[0].bit, 16);
    }

    #[tokio::test]
    async fn unreadable_words_are_not_flagged() {
        let device = MockTransport::default();
        device
            .fail_reads(address(&registers::BATTERY_STATUS))
            .fail_reads(address(&registers::ERROR_COUNT));
        assert!(StatusMonitor::default().poll_once(&device).await.is_none());
    }

    #[tokio::test]
    async fn unreadable_fault_words_are_named() {
        let device = MockTransport::default();
        device
            .fail_reads(address(&registers::MASTER_FAULT_MSG2))
            .fail_reads(address(&registers::ERROR_COUNT))
            .fail_reads(address(&registers::MPV_MODE));
        let readings = telemetry::snapshot(&device, STATUS_REGISTERS).await;
        assert_eq!(unreadable_status_words(&readings), ["MASTER_FAULT_MSG2", "ERROR_COUNT"]);
        let healthy = telemetry::snapshot(&MockTransport::default(), STATUS_REGISTERS).await;
        assert!(unreadable_status_words(&healthy).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timestamp_is_reported_once() {
        let device = Arc::new(MockTransport::default());
        device.set(address(&registers::BATTERY_STATUS), 3);
        let cancel = CancellationToken::new();
        let args = Args { period: Duration::from_secs(120).into() };
        let mut reports = pin::pin!(watch(Arc::clone(&device), args, cancel.clone()));
        let start = Instant::now();
        assert!(reports.next().await.unwrap().timestamp.is_some());
        let second = reports.next().await.unwrap();
        assert!(second.timestamp.is_none());
        assert!(second.readings.iter().all(|r| r.register.name != "TIME"));
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(start.elapsed() < Duration::from_secs(240));
        cancel.cancel();
        assert!(reports.next().await.is_none());
    }
}
