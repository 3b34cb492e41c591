use crate::connection::{self, Connection};
use crate::energy::EnergyReport;
use crate::session::Session;
use std::pin;
use std::sync::Arc;
use tracing::{info, warn};

/// Wait for the session's energy counter to stop on its own, or stop it on Ctrl-C.
async fn await_energy_report(session: &Session<Connection>) -> Option<EnergyReport> {
    let mut finished = pin::pin!(session.energy().finish());
    let result = tokio::select! {
        result = &mut finished => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping the background work");
            session.shutdown_token().cancel();
            finished.await
        }
    };
    match result? {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(message = "energy counter panicked", error = (&e as &dyn std::error::Error));
            None
        }
    }
}

fn print_energy_report(report: &EnergyReport) {
    println!(
        "transferred {:.2} Wh in {} ({:?})",
        report.total_wh,
        humantime::format_duration(report.elapsed),
        report.stop
    );
}

/// Stop the background work of `session` and disconnect.
async fn end_session(session: Session<Connection>) -> Result<(), connection::Error> {
    let (transport, report) = session.shutdown().await;
    if let Some(report) = report {
        print_energy_report(&report);
    }
    match Arc::try_unwrap(transport) {
        Ok(connection) => connection.close().await,
        Err(_) => Ok(()),
    }
}

pub mod registers {
    use crate::output;
    use crate::registers::{Register, all_registers};

    /// Search and output the known registers with the index they can be addressed by.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers whose name, unit or address contains this.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register list")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct RegisterSchema {
        index: usize,
        #[serde(flatten)]
        register: &'static Register,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(&["Index", "Name", "Address", "Mode", "Type", "Words", "Scale", "Unit"])
            .map_err(Error::Output)?;
        for (index, register) in all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![
                            index.to_string(),
                            register.name.to_string(),
                            format!("{:#06x}", register.spec.address),
                            register.access.to_string(),
                            register.spec.data_type.to_string(),
                            register.spec.words.to_string(),
                            register.spec.factor().to_string(),
                            register.unit.to_string(),
                        ]
                    },
                    || RegisterSchema { index, register },
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::output::{self, READING_HEADERS};
    use crate::registers::{LookupError, RegisterRef};
    use crate::telemetry::{self, POWER_REGISTERS};
    use futures::StreamExt as _;
    use std::pin;

    /// Read registers by index or name and output their decoded values.
    ///
    /// Without any registers the power registers are read. With `--every` the reads repeat until
    /// interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Read again at this interval until Ctrl-C is pressed.
        #[arg(long)]
        every: Option<humantime::Duration>,
        /// Registers to read, by index (see `registers`) or by name.
        registers: Vec<RegisterRef>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not select the registers to read")]
        Lookup(#[source] LookupError),
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let registers = if args.registers.is_empty() {
            POWER_REGISTERS.to_vec()
        } else {
            args.registers
                .iter()
                .map(RegisterRef::resolve)
                .collect::<Result<Vec<_>, _>>()
                .map_err(Error::Lookup)?
        };
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(READING_HEADERS).map_err(Error::Output)?;
        match args.every {
            None => {
                for reading in &telemetry::snapshot(&connection, &registers).await {
                    output.reading(reading).map_err(Error::Output)?;
                }
            }
            Some(every) => {
                let mut snapshots = pin::pin!(telemetry::watch(&connection, &registers, *every));
                let mut interrupt = pin::pin!(tokio::signal::ctrl_c());
                loop {
                    let readings = tokio::select! {
                        readings = snapshots.next() => readings,
                        _ = &mut interrupt => None,
                    };
                    let Some(readings) = readings else { break };
                    for reading in &readings {
                        output.reading(reading).map_err(Error::Output)?;
                    }
                    output.flush().map_err(Error::Output)?;
                }
            }
        }
        output.commit().map_err(Error::Output)?;
        connection.close().await.map_err(Error::Close)
    }
}

pub mod write {
    use crate::connection::{self, Connection};
    use crate::registers::{LookupError, RegisterRef};
    use crate::transport::{self, Transport as _};
    use tracing::warn;

    /// Write a physical value to a read/write register and read it back.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// The register to write, by index or by name.
        register: RegisterRef,
        /// The value to write, in the register's unit. It is divided by the register's scale.
        #[arg(allow_negative_numbers = true)]
        value: f64,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not select the register to write")]
        Lookup(#[source] LookupError),
        #[error("{value} encodes to {raw} which does not fit into register `{register}`")]
        OutOfRange { register: &'static str, value: f64, raw: i64 },
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not write register `{0}`")]
        Write(&'static str, #[source] transport::Error),
        #[error("could not read back register `{0}`")]
        ReadBack(&'static str, #[source] transport::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let register = args.register.resolve_writable().map_err(Error::Lookup)?;
        let raw = register.spec.encode(args.value);
        let word = register.spec.to_word(raw).ok_or(Error::OutOfRange {
            register: register.name,
            value: args.value,
            raw,
        })?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        connection
            .write_holding(register.spec.address, word)
            .await
            .map_err(|e| Error::Write(register.name, e))?;
        let words = connection
            .read_holdings(register.spec.address, register.spec.words)
            .await
            .map_err(|e| Error::ReadBack(register.name, e))?;
        let value = register.spec.decode(&words);
        println!("{} = {value} {}", register.name, register.unit);
        if words.first() != Some(&word) {
            warn!(
                message = "read back a different value",
                register = register.name,
                written = word,
                ?words
            );
        }
        connection.close().await.map_err(Error::Close)
    }
}

pub mod monitor {
    use crate::connection::{self, Connection};
    use crate::monitor;
    use crate::session::Session;

    /// Watch the inverter's status and fault registers until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        monitor: monitor::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not wait for Ctrl-C")]
        Signal(#[source] std::io::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let mut session = Session::new(connection);
        session.start_monitor(args.monitor);
        let interrupted = tokio::signal::ctrl_c().await.map_err(Error::Signal);
        super::end_session(session).await.map_err(Error::Close)?;
        interrupted
    }
}

pub mod passive {
    use crate::connection::{self, Connection};
    use crate::control::{self, PassiveMode};
    use crate::session::Session;
    use crate::{energy, monitor};

    /// Switch the inverter to passive charging or discharging.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// `charge` or `discharge`.
        #[arg(value_parser = PassiveMode::parse)]
        mode: PassiveMode,
        /// Count the transferred energy until the battery power drops below the threshold.
        #[arg(long)]
        count_energy: bool,
        #[clap(flatten)]
        energy: energy::Args,
        #[clap(flatten)]
        monitor: monitor::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not engage passive {0} mode")]
        Control(PassiveMode, #[source] control::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let mut session = Session::new(connection);
        session.start_monitor(args.monitor);
        let energy = args.count_energy.then_some(args.energy);
        let result = control::engage(&session, args.mode, energy).await;
        match &result {
            Ok(outcomes) => {
                for (step, outcome) in outcomes {
                    println!("{step}: {outcome:?}");
                }
                if let Some(report) = super::await_energy_report(&session).await {
                    super::print_energy_report(&report);
                }
            }
            Err(control::Error::Aborted { completed, .. }) => {
                for step in completed {
                    println!("{step}: done");
                }
            }
            Err(control::Error::InvalidMode(_)) => {}
        }
        super::end_session(session).await.map_err(Error::Close)?;
        result.map(drop).map_err(|e| Error::Control(args.mode, e))
    }
}

pub mod energy {
    use crate::connection::{self, Connection};
    use crate::energy::{self, Start};
    use crate::session::Session;

    /// Count the energy flowing in or out of the battery, without changing the inverter mode.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        energy: energy::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let session = Session::new(connection);
        if session.start_energy_counting(args.energy) == Start::Started {
            if let Some(report) = super::await_energy_report(&session).await {
                super::print_energy_report(&report);
            }
        }
        super::end_session(session).await.map_err(Error::Close)
    }
}

pub mod sweep {
    use crate::connection::{self, Connection};
    use crate::control;
    use crate::session::Session;
    use crate::sweep::{self, Direction, SweepPlan};
    use crate::{monitor, output};
    use futures::StreamExt as _;
    use std::pin;
    use tracing::warn;

    /// Step the passive battery power through a range of setpoints, sampling the power registers
    /// along the way.
    ///
    /// The inverter is switched into passive charge or discharge mode first.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        #[clap(flatten)]
        monitor: monitor::Args,
        #[arg(value_enum)]
        direction: Direction,
        /// First setpoint in watts [default: 500 for charge, 2000 for discharge].
        #[arg(long)]
        start_w: Option<u32>,
        /// Last setpoint in watts [default: 4500].
        #[arg(long)]
        stop_w: Option<u32>,
        /// Setpoint increment in watts [default: 500].
        #[arg(long)]
        step_w: Option<u32>,
        /// Minutes each setpoint is held [default: 2 for charge, 3 for discharge].
        #[arg(long)]
        hold_minutes: Option<u32>,
        /// Minutes of the hold at which the power registers are sampled [default: 2 for charge,
        /// 1,3 for discharge].
        #[arg(long, value_delimiter = ',')]
        sample_at: Option<Vec<u32>>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("invalid sweep")]
        Plan(#[source] sweep::Error),
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not switch the inverter into passive {0} mode")]
        Engage(Direction, #[source] control::Error),
        #[error("could not output the samples")]
        Output(#[source] output::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[derive(serde::Serialize)]
    struct SampleRecord<'a> {
        #[serde(flatten)]
        step: sweep::PowerSweepStep,
        minute: Option<u32>,
        reading: Option<&'a crate::telemetry::Reading>,
        error: Option<String>,
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let plan = SweepPlan::for_direction(args.direction)
            .with_overrides(args.start_w, args.stop_w, args.step_w, args.hold_minutes, args.sample_at)
            .map_err(Error::Plan)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(&["Setpoint", "Raw", "Minute", "Name", "Value"])
            .map_err(Error::Output)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let mut session = Session::new(connection);
        session.start_monitor(args.monitor);
        if let Err(e) = sweep::engage(&session, &plan).await {
            super::end_session(session).await.map_err(Error::Close)?;
            return Err(Error::Engage(plan.direction(), e));
        }
        {
            let mut reports = pin::pin!(sweep::run(session.transport(), &plan));
            let mut interrupt = pin::pin!(tokio::signal::ctrl_c());
            loop {
                let report = tokio::select! {
                    report = reports.next() => report,
                    _ = &mut interrupt => {
                        warn!("interrupted, the last setpoint stays in effect");
                        None
                    }
                };
                let Some(report) = report else { break };
                let step = report.step;
                let samples = match &report.outcome {
                    Ok(samples) => samples,
                    Err(e) => {
                        output
                            .result(
                                || vec![step.setpoint_w.to_string(), step.raw.to_string()],
                                || SampleRecord {
                                    step,
                                    minute: None,
                                    reading: None,
                                    error: Some(e.to_string()),
                                },
                            )
                            .map_err(Error::Output)?;
                        continue;
                    }
                };
                for sample in samples {
                    for reading in &sample.readings {
                        output
                            .result(
                                || {
                                    vec![
                                        step.setpoint_w.to_string(),
                                        step.raw.to_string(),
                                        sample.minute.to_string(),
                                        reading.register.name.to_string(),
                                        reading.display_value(),
                                    ]
                                },
                                || SampleRecord {
                                    step,
                                    minute: Some(sample.minute),
                                    reading: Some(reading),
                                    error: None,
                                },
                            )
                            .map_err(Error::Output)?;
                    }
                }
            }
        }
        output.commit().map_err(Error::Output)?;
        super::end_session(session).await.map_err(Error::Close)
    }
}

pub mod schedule {
    use crate::connection::{self, Connection};
    use crate::schedule::{self, ClockTime, ScheduleWindow, WindowKind, Weekdays};

    /// Program the first scheduled charge or discharge window.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(value_enum)]
        kind: WindowKind,
        /// Start of the window, `HH:MM`.
        #[arg(long)]
        start: ClockTime,
        /// End of the window, `HH:MM`.
        #[arg(long)]
        end: ClockTime,
        /// Days the window applies to, one bit per day across six bits (e.g. `0b010000`).
        #[arg(long)]
        weekdays: Weekdays,
        /// Power as a percentage of the rated power.
        #[arg(long)]
        power: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("invalid window")]
        Window(#[source] schedule::Error),
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not program the window")]
        Program(#[source] schedule::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let window = ScheduleWindow::new(args.start, args.end, args.weekdays, args.power)
            .map_err(Error::Window)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let outcomes = schedule::program(&connection, args.kind, &window).await;
        let close = connection.close().await.map_err(Error::Close);
        for outcome in outcomes.map_err(Error::Program)? {
            match outcome.result {
                Ok(()) => println!("{} = {:#06x}", outcome.register.name, outcome.value),
                Err(e) => println!("{} = {:#06x} failed: {e}", outcome.register.name, outcome.value),
            }
        }
        close
    }
}

pub mod average {
    use crate::connection::{self, Connection};
    use crate::output;
    use crate::registers::{LookupError, RegisterRef};
    use crate::telemetry;

    /// Read registers repeatedly and output the average of their values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Number of times every register is read.
        #[arg(long, default_value = "5")]
        cycles: usize,
        /// Time between the reading cycles.
        #[arg(long, default_value = "1s")]
        interval: humantime::Duration,
        /// Registers to read, by index or by name.
        #[arg(required = true)]
        registers: Vec<RegisterRef>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not select the registers to read")]
        Lookup(#[source] LookupError),
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not output the averages")]
        Output(#[source] output::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let registers = args
            .registers
            .iter()
            .map(RegisterRef::resolve)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Lookup)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let averages =
            telemetry::average(&connection, &registers, args.cycles, *args.interval).await;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(&["Name", "Samples", "Average", "Unit"]).map_err(Error::Output)?;
        for average in &averages {
            output
                .result(
                    || {
                        vec![
                            average.register.name.to_string(),
                            format!("{}/{}", average.samples, args.cycles),
                            average.mean.map(|m| format!("{m:.3}")).unwrap_or_default(),
                            average.register.unit.to_string(),
                        ]
                    },
                    || average,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)?;
        connection.close().await.map_err(Error::Close)
    }
}

pub mod latency {
    use crate::connection::{self, Connection};
    use crate::registers::{LookupError, RegisterRef};
    use crate::telemetry;

    /// Measure the round trip time of register reads.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// How many reads to perform.
        #[arg(long, default_value = "100")]
        count: usize,
        /// The register to read, by index or by name.
        #[arg(default_value = "BATTERY_POWER")]
        register: RegisterRef,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not select the register to read")]
        Lookup(#[source] LookupError),
        #[error("could not connect to the inverter")]
        Connect(#[source] connection::Error),
        #[error("could not disconnect cleanly")]
        Close(#[source] connection::Error),
    }

    #[tokio::main]
    pub async fn run(args: Args) -> Result<(), Error> {
        let register = args.register.resolve().map_err(Error::Lookup)?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let stats = telemetry::probe_latency(&connection, register, args.count).await;
        println!("valid reads: {}/{}", stats.valid, args.count);
        if stats.valid != 0 {
            println!(
                "mean {:?}, min {:?}, max {:?}, stddev {:?}",
                stats.mean, stats.min, stats.max, stats.stddev
            );
        }
        connection.close().await.map_err(Error::Close)
    }
}
