mod config;
mod session;

use anyhow::Context;
use clap::{Parser, Subcommand};
use common::{JobDescription, VERBOSE_FLAG, WORKER_FLAG};
use config::Config;
use log::LevelFilter;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.toml, .yaml or .yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a job in a worker process. Type p, r or s and Enter to
    /// pause, resume or stop it.
    Encode {
        /// Job description (JSON)
        job: PathBuf,
        /// Print state reports as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the rendezvous socket path
    SocketPath,
}

fn main() -> ExitCode {
    let args: Vec<OsString> = std::env::args_os().collect();
    if args.get(1).map_or(false, |arg| arg == WORKER_FLAG) {
        return worker(&args[2..]);
    }

    match run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Worker mode, entered before any argument parsing of the host.
fn worker(args: &[OsString]) -> ExitCode {
    let verbose = args.iter().filter(|arg| *arg == VERBOSE_FLAG).count();
    let verbosity = u8::try_from(verbose).unwrap_or(u8::MAX);
    if let Err(e) = setup_logging(worker_level(verbosity), None) {
        eprintln!("Failed to set up logging: {:#}", e);
    }

    let config = match Config::load(None) {
        Ok(config) => config.worker,
        Err(e) => {
            log::warn!("Using default worker settings: {:#}", e);
            Default::default()
        }
    };
    transcoder_worker::worker_main(&config, verbosity)
}

fn worker_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var(config::CONFIG_ENV, path);
    }
    let config = Config::load(cli.config.as_deref())?;
    setup_logging(config.logging.level_filter()?, config.logging.output.as_deref())?;

    match cli.command {
        Commands::Encode { job, json } => {
            let text = fs::read_to_string(&job)
                .with_context(|| format!("Failed to read job file: {:?}", job))?;
            let description = JobDescription::from_json(text)
                .with_context(|| format!("Job file is not valid JSON: {:?}", job))?;
            log::info!("Encoding {:?}", job);
            session::encode(&config.server, description, json)
        }
        Commands::SocketPath => {
            println!("{}", config.server.socket_path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Progress goes to stdout, so logs go to stderr and the optional file.
fn setup_logging(level: LevelFilter, output: Option<&Path>) -> anyhow::Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Some(path) = output {
        let file = fern::log_file(path)
            .with_context(|| format!("Failed to open log file: {:?}", path))?;
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
