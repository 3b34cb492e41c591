use crate::energy::{self, EnergyCounter, EnergyReport, Start};
use crate::monitor;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One connected device together with the background work running against it.
///
/// Cancelling the session's shutdown token stops the status monitor and the energy counter.
pub struct Session<T> {
    transport: Arc<T>,
    energy: EnergyCounter,
    monitor: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            energy: EnergyCounter::default(),
            monitor: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn energy(&self) -> &EnergyCounter {
        &self.energy
    }

    pub fn start_monitor(&mut self, args: monitor::Args) {
        if self.monitor.as_ref().is_some_and(|m| !m.is_finished()) {
            return;
        }
        let handle =
            monitor::spawn(Arc::clone(&self.transport), args, self.shutdown.child_token());
        self.monitor = Some(handle);
    }

    pub fn start_energy_counting(&self, args: energy::Args) -> Start {
        self.energy.start(Arc::clone(&self.transport), args, &self.shutdown)
    }

    /// Stop all background work and hand back the transport.
    ///
    /// Returns the final report of the energy counter, if one was started.
    pub async fn shutdown(self) -> (Arc<T>, Option<EnergyReport>) {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor {
            if let Err(e) = monitor.await {
                warn!(message = "status monitor panicked", error = (&e as &dyn std::error::Error));
            }
        }
        let report = match self.energy.stop().await {
            None => None,
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                warn!(message = "energy counter panicked", error = (&e as &dyn std::error::Error));
                None
            }
        };
        (self.transport, report)
    }
}
