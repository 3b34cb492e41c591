//! The register transport the control and telemetry logic is written against.
//!
//! Implementations must serialize individual calls against the device themselves. No atomicity
//! is provided across calls.

use crate::registers::{RegisterSpec, Value};
use std::future::Future;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the connection to the device failed")]
    Connection(#[source] crate::connection::Error),
    #[error("the device did not respond in time")]
    Timeout,
    #[error("the device responded with exception code {0}")]
    Exception(u8),
    #[error("expected {expected} words in the response, got {got}")]
    ShortResponse { expected: u16, got: usize },
    #[error("the device answered a different request")]
    UnexpectedResponse,
    #[error(
        "cannot read {0} registers in one request (1 to {max} allowed)",
        max = crate::modbus::MAX_READ_COUNT
    )]
    CountOutOfRange(u16),
}

pub trait Transport: Send + Sync {
    /// Read `count` consecutive holding registers starting at `address`.
    fn read_holdings(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send;

    /// Write a single holding register.
    fn write_holding(&self, address: u16, value: u16)
    -> impl Future<Output = Result<(), Error>> + Send;

    /// Read a register and decode it according to its spec.
    ///
    /// Only transport failures are errors; data that does not decode is reported as
    /// [`Value::Invalid`].
    fn read_value(&self, spec: RegisterSpec) -> impl Future<Output = Result<Value, Error>> + Send {
        async move {
            let words = self.read_holdings(spec.address, spec.words).await?;
            if words.len() < usize::from(spec.words) {
                return Err(Error::ShortResponse { expected: spec.words, got: words.len() });
            }
            Ok(spec.decode(&words))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Error, Transport};
    use std::collections::{BTreeMap, BTreeSet, VecDeque};
    use std::sync::Mutex;

    /// A device stand-in with scriptable register contents and failures.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        values: BTreeMap<u16, u16>,
        /// Values returned by successive reads; the last one sticks.
        scripts: BTreeMap<u16, VecDeque<u16>>,
        failing_reads: BTreeSet<u16>,
        failing_writes: BTreeSet<u16>,
        writes: Vec<(u16, u16)>,
        reads: usize,
    }

    impl MockTransport {
        fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
            f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()))
        }

        pub(crate) fn set(&self, address: u16, value: u16) -> &Self {
            self.with_state(|s| s.values.insert(address, value));
            self
        }

        pub(crate) fn set_words(&self, address: u16, words: &[u16]) -> &Self {
            for (address, &word) in (address..).zip(words) {
                self.set(address, word);
            }
            self
        }

        pub(crate) fn script(&self, address: u16, values: impl IntoIterator<Item = u16>) -> &Self {
            self.with_state(|s| s.scripts.entry(address).or_default().extend(values));
            self
        }

        pub(crate) fn fail_reads(&self, address: u16) -> &Self {
            self.with_state(|s| s.failing_reads.insert(address));
            self
        }

        pub(crate) fn fail_writes(&self, address: u16) -> &Self {
            self.with_state(|s| s.failing_writes.insert(address));
            self
        }

        /// Every attempted write, including the failed ones.
        pub(crate) fn writes(&self) -> Vec<(u16, u16)> {
            self.with_state(|s| s.writes.clone())
        }

        pub(crate) fn read_count(&self) -> usize {
            self.with_state(|s| s.reads)
        }
    }

    impl Transport for MockTransport {
        async fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
            self.with_state(|s| {
                s.reads += 1;
                (address..address + count)
                    .map(|address| {
                        if s.failing_reads.contains(&address) {
                            return Err(Error::Exception(4));
                        }
                        if let Some(script) = s.scripts.get_mut(&address) {
                            if script.len() > 1 {
                                return Ok(script.pop_front().unwrap_or_default());
                            } else if let Some(&last) = script.front() {
                                return Ok(last);
                            }
                        }
                        Ok(s.values.get(&address).copied().unwrap_or_default())
                    })
                    .collect()
            })
        }

        async fn write_holding(&self, address: u16, value: u16) -> Result<(), Error> {
            self.with_state(|s| {
                s.writes.push((address, value));
                if s.failing_writes.contains(&address) {
                    return Err(Error::Timeout);
                }
                s.values.insert(address, value);
                Ok(())
            })
        }
    }
}
