use clap::Parser as _;
use saj_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const DEFAULT_LOG_FILTER: &str = "warn,saj_tools=info";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Write(commands::write::Args),
    Monitor(commands::monitor::Args),
    Passive(commands::passive::Args),
    Energy(commands::energy::Args),
    Sweep(commands::sweep::Args),
    Schedule(commands::schedule::Args),
    Average(commands::average::Args),
    Latency(commands::latency::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var("SAJ_TOOLS_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("warning: ignoring SAJ_TOOLS_LOG ({e})");
            tracing_subscriber::filter::targets::Targets::new()
                .with_default(tracing::Level::WARN)
                .with_target("saj_tools", tracing::Level::INFO)
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
        Commands::Monitor(args) => end(commands::monitor::run(args)),
        Commands::Passive(args) => end(commands::passive::run(args)),
        Commands::Energy(args) => end(commands::energy::run(args)),
        Commands::Sweep(args) => end(commands::sweep::run(args)),
        Commands::Schedule(args) => end(commands::schedule::run(args)),
        Commands::Average(args) => end(commands::average::run(args)),
        Commands::Latency(args) => end(commands::latency::run(args)),
    }
}
