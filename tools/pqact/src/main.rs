//! Pattern-action queue consumer.
//!
//! Reads products from a queue, matches each against the compiled rule
//! table, and runs file/pipe/exec actions. Progress is durable: the arrival
//! time of the last processed product is persisted beside the
//! configuration file and picked up on restart.
//!
//! Exit codes: 0 clean shutdown, 1 configuration or fatal error, 4 cannot
//! change to the data directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use stratus_core::config::{ENV_LOG, ENV_PQACT, ENV_QUEUE};
use stratus_core::pqact::{EngineOptions, PatternActionEngine};
use stratus_core::queue::{DEFAULT_CAPACITY, DEFAULT_SLOTS};
use stratus_core::{builtin_table, parse_feedtype, ProductQueue, SignalControl};

const EXIT_CONFIG: i32 = 1;
const EXIT_DATADIR: i32 = 4;

#[derive(Parser, Debug)]
#[clap(about = "pattern-action product consumer")]
struct Args {
    /// Informational logging.
    #[clap(short, long)]
    verbose: bool,

    /// Debug logging.
    #[clap(short = 'x', long)]
    debug: bool,

    /// Log destination: "-" for standard error, else a file path.
    #[clap(short = 'l', long, value_name = "DEST")]
    logdest: Option<String>,

    /// Change to this directory before running actions.
    #[clap(short, long, parse(from_os_str), value_name = "DIR")]
    datadir: Option<PathBuf>,

    /// Product-queue path.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    queue: Option<PathBuf>,

    /// Only consider products whose identifier matches this pattern.
    #[clap(short, long, value_name = "ERE", default_value = ".*")]
    pattern: String,

    /// Only consider products of this feedtype.
    #[clap(short, long, value_name = "FEEDTYPE", default_value = "ANY")]
    feedtype: String,

    /// Empty-queue poll interval, in seconds.
    #[clap(short, long, value_name = "SECS", default_value_t = 15)]
    interval: u64,

    /// Pipe-write timeout, in seconds.
    #[clap(short = 't', long, value_name = "SECS", default_value_t = 60)]
    pipe_timeout: u64,

    /// Ignore the saved cursor and start this many seconds before now.
    #[clap(short, long, value_name = "SECS")]
    offset: Option<u64>,

    /// Pattern-action configuration file.
    #[clap(value_name = "CONFFILE", parse(from_os_str))]
    conffile: Option<PathBuf>,
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

    let conffile = args
        .conffile
        .clone()
        .or_else(|| std::env::var_os(ENV_PQACT).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("etc/pqact.conf"));
    let queue_path = args
        .queue
        .clone()
        .or_else(|| std::env::var_os(ENV_QUEUE).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("var/queues/stratus.pq"));

    let feedtype = match parse_feedtype(&builtin_table(), &args.feedtype) {
        Ok(feedtype) => feedtype,
        Err(err) => {
            log::error!("bad feedtype {:?}: {}", args.feedtype, err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Some(datadir) = &args.datadir {
        if let Err(err) = std::env::set_current_dir(datadir) {
            log::error!("cannot change to {}: {}", datadir.display(), err);
            std::process::exit(EXIT_DATADIR);
        }
    }

    let control = match SignalControl::install() {
        Ok(control) => control,
        Err(err) => {
            log::error!("cannot install signal handlers: {:#}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let queue = match ProductQueue::open_or_create(&queue_path, DEFAULT_SLOTS, DEFAULT_CAPACITY)
    {
        Ok(queue) => Arc::new(queue),
        Err(err) => {
            log::error!("cannot open queue {}: {}", queue_path.display(), err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let options = EngineOptions {
        conffile,
        feedtype,
        pattern: args.pattern.clone(),
        interval: Duration::from_secs(args.interval.max(1)),
        pipe_timeout: Duration::from_secs(args.pipe_timeout.max(1)),
        offset: args.offset.map(Duration::from_secs),
    };
    let mut engine = match PatternActionEngine::new(queue, control, options) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("{:#}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(err) = engine.run() {
        log::error!("{:#}", err);
        std::process::exit(EXIT_CONFIG);
    }
}
