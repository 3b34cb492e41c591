use crate::modbus::{self, ModbusTcpCodec, Operation, Request, Response, ResponseKind};
use crate::transport::{self, Transport};
use futures::{SinkExt, StreamExt as _};
use std::collections::{BTreeMap, VecDeque};
use std::pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

const DEFAULT_PORT: u16 = 502;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("the connection worker panicked")]
    Worker(#[source] JoinError),
}

#[derive(Default)]
struct ResponseTracker {
    state: Mutex<TrackerState>,
    change_notify: Notify,
}

#[derive(Default)]
struct TrackerState {
    responses: BTreeMap<u16, Option<modbus::Response>>,
    closed: bool,
}

impl ResponseTracker {
    fn update(&self, f: impl FnOnce(&mut TrackerState)) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    fn mark_timeout(&self, transaction_id: u16) {
        self.update(|s| {
            s.responses.insert(transaction_id, None);
        });
    }

    fn add_response(&self, response: modbus::Response) {
        self.update(|s| {
            s.responses.insert(response.transaction_id, Some(response));
        });
    }

    /// Wake up everybody still waiting; no more responses will arrive.
    fn close(&self) {
        self.update(|s| s.closed = true);
    }

    async fn wait_for(&self, transaction_id: u16) -> Option<modbus::Response> {
        loop {
            let mut notified = pin::pin!(self.change_notify.notified());
            // Register interest before looking, so that an update between the check and the
            // wait is not missed.
            notified.as_mut().enable();
            {
                let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.responses.remove(&transaction_id) {
                    return v;
                }
                if guard.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Address of the inverter's Modbus TCP endpoint (e.g. `192.168.1.50` or `inverter:502`).
    ///
    /// Port 502 is used when none is given.
    #[arg(long)]
    tcp: String,

    /// The modbus unit ID of the inverter.
    #[arg(long, short = 'i', default_value = "1")]
    unit_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Reconnect, if the modbus request can't be sent in this amount of time.
    #[arg(long, default_value = "3s")]
    send_timeout: humantime::Duration,

    /// Reconnect to the modbus server after the specified number of reads timeout.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,

    /// The amount of additional time to wait between sending requests.
    ///
    /// The inverter's communication module drops requests that arrive back to back.
    #[arg(long, default_value = "50ms")]
    tcp_send_delay: humantime::Duration,

    /// The amount of time to wait after receiving a server busy exception before retrying.
    #[arg(long, default_value = "25ms")]
    server_busy_retry_delay: humantime::Duration,

    /// Give up on a request after the device reported being busy this many times in a row.
    #[arg(long, default_value = "5")]
    server_busy_retries: usize,
}

impl Args {
    fn address(&self) -> String {
        if self.tcp.contains(':') {
            self.tcp.clone()
        } else {
            format!("{}:{DEFAULT_PORT}", self.tcp)
        }
    }
}

/// A Modbus TCP connection to the inverter.
///
/// Requests from any number of tasks are queued to a single worker owning the socket, so calls
/// are serialized and paced. The worker reconnects on its own when the device stops responding.
pub struct Connection {
    request_queue: UnboundedSender<modbus::Request>,
    worker: JoinHandle<Result<(), Error>>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    args: Args,
}

impl Connection {
    /// Connect to the device.
    ///
    /// The first connection attempt happens here, so an unreachable device is reported right
    /// away.
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker = Arc::<ResponseTracker>::default();
        let mut worker = TcpWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args: args.clone(),
            responses: Arc::clone(&response_tracker),
            inflight: VecDeque::with_capacity(4),
        };
        let io = worker.connect().await?;
        let worker = tokio::task::spawn(worker.main_loop(io, jobs));
        Ok(Self {
            request_queue,
            worker,
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            args,
        })
    }

    fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    /// Send out a request, returning `None` if the request timed out.
    pub async fn send(&self, operation: Operation) -> Result<Option<Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { unit_id: self.args.unit_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(self.response_tracker.wait_for(transaction_id).await)
    }

    /// [`Self::send`] but retries `Server Busy` exceptions.
    async fn request(&self, operation: Operation) -> Result<ResponseKind, transport::Error> {
        let mut busy_retries = self.args.server_busy_retries;
        loop {
            let response = self.send(operation).await.map_err(transport::Error::Connection)?;
            let Some(response) = response else {
                return Err(transport::Error::Timeout);
            };
            if !response.is_server_busy() {
                break Ok(response.kind);
            }
            let Some(remaining) = busy_retries.checked_sub(1) else {
                break Ok(response.kind);
            };
            busy_retries = remaining;
            debug!(message = "server busy, retrying", ?operation, remaining);
            tokio::time::sleep(*self.args.server_busy_retry_delay).await;
        }
    }

    /// Stop the worker after it has processed the requests queued so far.
    pub async fn close(self) -> Result<(), Error> {
        drop(self.request_queue);
        self.worker.await.map_err(Error::Worker)?
    }
}

impl Transport for Connection {
    async fn read_holdings(&self, address: u16, count: u16) -> Result<Vec<u16>, transport::Error> {
        if count == 0 || count > modbus::MAX_READ_COUNT {
            return Err(transport::Error::CountOutOfRange(count));
        }
        match self.request(Operation::GetHoldings { address, count }).await? {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => Ok(values),
            ResponseKind::GetHoldings { values } => {
                Err(transport::Error::ShortResponse { expected: count, got: values.len() })
            }
            ResponseKind::Exception(code) => Err(transport::Error::Exception(code)),
            ResponseKind::SetHolding { .. } => Err(transport::Error::UnexpectedResponse),
        }
    }

    async fn write_holding(&self, address: u16, value: u16) -> Result<(), transport::Error> {
        match self.request(Operation::SetHolding { address, value }).await? {
            ResponseKind::SetHolding { address: a, value: v } if (a, v) == (address, value) => {
                Ok(())
            }
            ResponseKind::Exception(code) => Err(transport::Error::Exception(code)),
            ResponseKind::SetHolding { .. } | ResponseKind::GetHoldings { .. } => {
                Err(transport::Error::UnexpectedResponse)
            }
        }
    }
}

struct TcpWorker {
    args: Args,
    responses: Arc<ResponseTracker>,
    /// An in-order list of outstanding requests and their timeout instants.
    ///
    /// The inverter's communication module answers requests in the order it received them. A
    /// response to request N therefore means requests sent before N were dropped and will never
    /// be answered.
    inflight: VecDeque<(u16, Instant)>,
    reconnect_countdown: usize,
}

type TcpIo = Framed<TcpStream, ModbusTcpCodec>;

impl TcpWorker {
    async fn main_loop(
        mut self,
        io: TcpIo,
        jobs: UnboundedReceiver<modbus::Request>,
    ) -> Result<(), Error> {
        let result = self.serve(io, jobs).await;
        for (transaction_id, _) in self.inflight.drain(..) {
            self.responses.mark_timeout(transaction_id);
        }
        self.responses.close();
        if let Err(e) = &result {
            warn!(message = "connection worker stopped", error = (e as &dyn std::error::Error));
        }
        result
    }

    async fn serve(
        &mut self,
        io: TcpIo,
        mut jobs: UnboundedReceiver<modbus::Request>,
    ) -> Result<(), Error> {
        let mut io = Some(io);
        let mut pending_send: Option<modbus::Request> = None;
        'reconnect: loop {
            // If we are reconnecting and had any in-flight requests, it is only proper to report
            // them as timed out.
            for (transaction_id, _) in self.inflight.drain(..) {
                self.responses.mark_timeout(transaction_id);
            }
            if let Some(req) = pending_send.take() {
                self.responses.mark_timeout(req.transaction_id);
            }
            let connection = match io.take() {
                Some(io) => io,
                None => self.connect().await?,
            };
            let (mut io_sink, mut io_source) = connection.split();
            let mut send_time = pin::pin!(tokio::time::sleep_until(Instant::now()));
            let mut recv_time = pin::pin!(tokio::time::sleep_until(Instant::now()));
            loop {
                let time_to_send = send_time.is_elapsed();
                tokio::select! {
                    biased;
                    send_result = io_sink.flush(), if pending_send.is_some() => {
                        if let Err(e) = send_result {
                            warn!(
                                message="sending request failed, will reconnect",
                                error=(&e as &dyn std::error::Error)
                            );
                            continue 'reconnect;
                        }
                        let Some(req) = pending_send.take() else { continue };
                        let now = Instant::now();
                        self.inflight.push_back((req.transaction_id, now + *self.args.read_timeout));
                        recv_time.as_mut().reset(self.inflight[0].1);
                        send_time.as_mut().reset(now + *self.args.tcp_send_delay);
                    }
                    response = io_source.next() => {
                        match response {
                            None => {
                                warn!("the device closed the connection, will reconnect");
                                continue 'reconnect;
                            }
                            Some(Err(e)) => return Err(Error::Receive(e)),
                            Some(Ok(response)) => {
                                self.handle_response(response, send_time.as_mut())
                            }
                        }
                    }
                    _ = &mut recv_time, if !self.inflight.is_empty() => {
                        if !self.handle_timeout(recv_time.as_mut()) {
                            continue 'reconnect;
                        }
                    }
                    // Keep a gap between subsequent requests: this waits until the next sending
                    // slot opens up, or until the pending send has timed out.
                    _ = &mut send_time, if !time_to_send || pending_send.is_some() => {
                        if pending_send.is_some() {
                            warn!("sending a request timed out, will reconnect");
                            continue 'reconnect;
                        }
                    }
                    job = jobs.recv(), if time_to_send && pending_send.is_none() => {
                        match job {
                            None => {
                                io_sink.close().await.map_err(Error::Shutdown)?;
                                return Ok(());
                            },
                            Some(req) => {
                                trace!(message = "sending", ?req);
                                // While we're sending, use `send_time` to track send timeout.
                                send_time.as_mut().reset(Instant::now() + *self.args.send_timeout);
                                io_sink.feed(req).await.map_err(Error::Send)?;
                                pending_send = Some(req);
                            }
                        }
                    },
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = self.args.address();
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.clone()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", address);
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTcpCodec::default()))
    }

    fn handle_response(
        &mut self,
        response: modbus::Response,
        send_time: pin::Pin<&mut tokio::time::Sleep>,
    ) {
        trace!(message = "decoded a response", transaction = response.transaction_id);
        let inflight_index =
            self.inflight.iter().position(|(id, _)| *id == response.transaction_id);
        let Some(inflight_index) = inflight_index else {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
            return;
        };
        if response.is_server_busy() {
            self.inflight.remove(inflight_index);
        } else {
            // Any requests sent out prior to the response we just received
            // were dropped, so lets time them out immediately.
            for (tr_id, _) in self.inflight.drain(..inflight_index) {
                self.responses.mark_timeout(tr_id);
            }
            self.inflight.pop_front();
            self.reconnect_countdown = self.args.reconnect_after_timeouts;
        };
        self.responses.add_response(response);
        if self.inflight.is_empty() {
            send_time.reset(Instant::now() + *self.args.tcp_send_delay);
        }
    }

    fn handle_timeout(&mut self, request_timeout: pin::Pin<&mut tokio::time::Sleep>) -> bool {
        let Some((transaction_id, _)) = self.inflight.pop_front() else {
            return true;
        };
        debug!(
            message = "an inflight request timed out",
            transaction_id,
            reconnect_countdown = self.reconnect_countdown
        );
        self.responses.mark_timeout(transaction_id);
        if let Some(new_count) = self.reconnect_countdown.checked_sub(1) {
            self.reconnect_countdown = new_count;
        } else {
            return false;
        };
        if let Some((_, timeout)) = self.inflight.front() {
            request_timeout.reset(*timeout);
        }
        true
    }
}
