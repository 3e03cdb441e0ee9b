//! The stratus node daemon: serves downstream subscribers, maintains the
//! standing upstream requests, and runs the configured EXEC children.

use std::path::PathBuf;

use clap::Parser;
use stratus_core::config::{load_config, ENV_LOG};
use stratus_core::{Runtime, SignalControl};

#[derive(Parser, Debug)]
#[clap(about = "store-and-forward product dissemination daemon")]
struct Args {
    /// Runtime configuration file.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// Informational logging.
    #[clap(short, long)]
    verbose: bool,

    /// Debug logging.
    #[clap(short = 'x', long)]
    debug: bool,

    /// Log destination: "-" for standard error, else a file path.
    #[clap(short = 'l', long, value_name = "DEST")]
    logdest: Option<String>,
}

fn init_logging(verbose: bool, debug: bool, dest: Option<&str>) {
    let level = if debug {
        log::LevelFilter::Debug
    } else if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    let dest = dest
        .map(str::to_string)
        .or_else(|| std::env::var(ENV_LOG).ok());
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    match dest.as_deref() {
        None | Some("-") => {}
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("cannot open log {}: {}; using stderr", path, err),
        },
    }
    builder.init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.debug, args.logdest.as_deref());

    let config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("{:#}", err);
                std::process::exit(1);
            }
        },
        None => stratus_core::config::default_config(),
    };

    let control = match SignalControl::install() {
        Ok(control) => control,
        Err(err) => {
            log::error!("cannot install signal handlers: {:#}", err);
            std::process::exit(1);
        }
    };

    let runtime = match Runtime::new(config, control) {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("{:#}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.run() {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}
