//! azd-app: local multi-service development orchestrator

#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod context;
mod logging;

/// Exit code when one or more services are unhealthy or failed
pub const EXIT_UNHEALTHY: u8 = 1;
/// Exit code for usage or configuration errors
pub const EXIT_CONFIG: u8 = 2;
/// Exit code when interrupted by the user
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "azd-app")]
#[command(about = "Run, observe and stop a project's services locally")]
#[command(version)]
struct Cli {
    /// Project directory containing azure.yaml
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services and the project dashboard
    Start {
        /// Services to start (empty means all)
        services: Vec<String>,

        /// Abort the whole run when any service fails to start
        #[arg(long)]
        fail_fast: bool,
    },

    /// Stop running services
    Stop {
        /// Services to stop (empty means all)
        services: Vec<String>,
    },

    /// Show registered services for the project
    Status,

    /// Probe service health and print a report
    Health {
        /// Only probe this service
        #[arg(short, long)]
        service: Option<String>,

        /// Probe repeatedly instead of once
        #[arg(long)]
        stream: bool,

        /// Seconds between rounds with --stream
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Per-probe timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Explicit endpoint override (URL or path)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Show captured service logs
    Logs {
        /// Only show logs for this service
        #[arg(short, long)]
        service: Option<String>,

        /// Lines of history to print
        #[arg(short, long, default_value_t = 100)]
        tail: usize,

        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,
    },
}

fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    let code = smol::block_on(async {
        match cli.command {
            Commands::Start {
                services,
                fail_fast,
            } => commands::start::run(&cli.project, services, fail_fast).await,
            Commands::Stop { services } => commands::stop::run(&cli.project, services).await,
            Commands::Status => commands::status::run(&cli.project).await,
            Commands::Health {
                service,
                stream,
                interval,
                timeout,
                endpoint,
            } => {
                commands::health::run(&cli.project, service, stream, interval, timeout, endpoint)
                    .await
            }
            Commands::Logs {
                service,
                tail,
                follow,
            } => commands::logs::run(&cli.project, service, tail, follow).await,
        }
    });

    match code {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
