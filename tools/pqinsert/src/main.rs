//! Inserts files into a product queue.
//!
//! The operational stand-in for an ingester: each named file becomes one
//! product whose identifier defaults to the file name and whose signature
//! is computed from the content.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stratus_core::config::ENV_QUEUE;
use stratus_core::queue::{DEFAULT_CAPACITY, DEFAULT_SLOTS};
use stratus_core::{builtin_table, parse_feedtype, InsertOutcome, Product, ProductQueue};

#[derive(Parser, Debug)]
#[clap(about = "insert files into a product queue")]
struct Args {
    /// Product-queue path.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    queue: Option<PathBuf>,

    /// Feedtype to stamp on the products.
    #[clap(short, long, value_name = "FEEDTYPE", default_value = "EXP")]
    feedtype: String,

    /// Product identifier; defaults to each file's name.
    #[clap(short, long, value_name = "ID")]
    product_id: Option<String>,

    /// Starting sequence number.
    #[clap(short, long, value_name = "SEQ", default_value_t = 0)]
    seqno: u32,

    /// Informational logging.
    #[clap(short, long)]
    verbose: bool,

    /// Files to insert.
    #[clap(value_name = "FILE", parse(from_os_str), required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let queue_path = args
        .queue
        .clone()
        .or_else(|| std::env::var_os(ENV_QUEUE).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("var/queues/stratus.pq"));
    let feedtype = parse_feedtype(&builtin_table(), &args.feedtype)
        .with_context(|| format!("bad feedtype {:?}", args.feedtype))?;
    let queue = ProductQueue::open_or_create(&queue_path, DEFAULT_SLOTS, DEFAULT_CAPACITY)
        .with_context(|| format!("cannot open queue {}", queue_path.display()))?;
    let origin = stratus_core::config::default_config().hostname;

    let mut failed = false;
    for (index, path) in args.files.iter().enumerate() {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) => {
                log::error!("cannot read {}: {}", path.display(), err);
                failed = true;
                continue;
            }
        };
        let ident = args.product_id.clone().unwrap_or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });
        let product = Product::new(
            feedtype,
            args.seqno.wrapping_add(index as u32),
            &ident,
            &origin,
            data,
        );
        match queue.insert(&product) {
            Ok(InsertOutcome::Inserted(at)) => {
                log::info!("inserted {} at {}", ident, at);
            }
            Ok(InsertOutcome::Duplicate) => {
                log::warn!("{}: identical product already queued", ident);
            }
            Ok(InsertOutcome::TooBig) => {
                log::error!("{}: larger than the whole queue", ident);
                failed = true;
            }
            Err(err) => {
                log::error!("{}: {}", ident, err);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
