//! The node runtime.
//!
//! Ties everything together: opens (or creates) the product queue, parses
//! the access-control file, starts the peer server, launches one receiver
//! worker per `REQUEST` entry and the `EXEC` children, then sits in the
//! supervision loop reaping workers and handling signals. A HUP rebuilds
//! the access tables from disk and swaps them in atomically; new `REQUEST`
//! and `EXEC` entries take effect, removed ones are logged and wind down
//! with their links.

pub mod server;

pub use self::server::NodeState;

use std::net::TcpListener;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::tick;

use crate::acl::{parse_access_file, ExecEntry, RequestEntry};
use crate::config::RuntimeConfig;
use crate::control::SignalControl;
use crate::feedtype::builtin_table;
use crate::peer::downstream::DownstreamWorker;
use crate::peer::PeerRole;
use crate::queue::ProductQueue;

/// How often the supervision loop wakes.
const TICK: Duration = Duration::from_secs(1);
/// Ticks between queue-occupancy log lines.
const STATS_EVERY: u64 = 60;

struct ExecChild {
    entry: ExecEntry,
    child: Child,
}

/// The stratus node runtime.
pub struct Runtime {
    state: Arc<NodeState>,
    listener: TcpListener,
    requests: Vec<RequestEntry>,
    children: Vec<ExecChild>,
}

impl Runtime {
    /// Builds the runtime from `config`: queue, tables, listener.
    pub fn new(config: RuntimeConfig, control: SignalControl) -> Result<Runtime> {
        let feedtypes = builtin_table();
        let table = parse_access_file(&config.access_file, &feedtypes)
            .with_context(|| format!("loading {}", config.access_file.display()))?;
        let queue_path = config.queue_path();
        let queue = ProductQueue::open_or_create(
            &queue_path,
            config.queue.slots,
            config.queue.capacity,
        )
        .with_context(|| format!("opening queue {}", queue_path.display()))?;
        let listener = TcpListener::bind(&config.server.bind)
            .with_context(|| format!("binding {}", config.server.bind))?;
        log::info!("serving peers on {}", config.server.bind);

        let requests = table.request.clone();
        let state = Arc::new(NodeState::new(
            config,
            Arc::new(queue),
            control,
            feedtypes,
            table,
        ));
        Ok(Runtime {
            state,
            listener,
            requests,
            children: vec![],
        })
    }

    /// Runs until TERM. Returns once every subsystem has wound down.
    pub fn run(mut self) -> Result<()> {
        let listener = self.listener.try_clone()?;
        let listener_state = Arc::clone(&self.state);
        let listener_thread = std::thread::spawn(move || server::serve(listener, listener_state));

        for request in self.requests.clone() {
            self.spawn_request(request);
        }
        for entry in self.state.access().exec.clone() {
            self.spawn_exec(entry);
        }

        let ticker = tick(TICK);
        let mut ticks: u64 = 0;
        loop {
            let _instant = ticker.recv();
            ticks += 1;
            let control = self.state.control;
            if control.is_done() {
                break;
            }
            if control.take_hup() {
                self.reload();
            }
            if control.take_reopen_log() {
                log::info!("log reopen requested");
            }
            control.take_cycle_verbosity();

            self.state.registry.reap();
            self.reap_children();
            if ticks % STATS_EVERY == 0 {
                let stats = self.state.queue.stats();
                log::info!(
                    "queue: {} products, {}/{} bytes, {} evictions; {} peers",
                    stats.live,
                    stats.used_bytes,
                    stats.data_capacity,
                    stats.evictions,
                    self.state.registry.len()
                );
            }
        }

        log::info!("draining: stopping workers and children");
        for exec in &mut self.children {
            if let Err(err) = exec.child.kill() {
                log::debug!("kill {:?}: {}", exec.entry.argv, err);
            }
            let _unused = exec.child.wait();
        }
        // Workers notice the done flag at their next quiescent point.
        self.state.registry.join_all();
        if listener_thread.join().is_err() {
            log::error!("listener thread panicked");
        }
        log::info!("done.");
        Ok(())
    }

    fn spawn_request(&self, request: RequestEntry) {
        let id = self.state.registry.register(
            &request.host,
            PeerRole::Downstream,
            request.mode,
            request.class(),
        );
        let worker = DownstreamWorker {
            id,
            queue: Arc::clone(&self.state.queue),
            registry: Arc::clone(&self.state.registry),
            control: self.state.control,
            request,
            tuning: self.state.config.peer.clone(),
        };
        let handle = std::thread::spawn(move || worker.run());
        self.state.registry.attach(id, handle);
    }

    fn spawn_exec(&mut self, entry: ExecEntry) {
        if entry.argv.is_empty() {
            return;
        }
        match Command::new(&entry.argv[0]).args(&entry.argv[1..]).spawn() {
            Ok(child) => {
                log::info!("exec child {:?} (pid {})", entry.argv, child.id());
                self.children.push(ExecChild { entry, child });
            }
            Err(err) => log::error!("cannot exec {:?}: {}", entry.argv, err),
        }
    }

    /// HUP: rebuild the tables from disk, swap atomically, apply additions.
    fn reload(&mut self) {
        log::info!(
            "rereading {}",
            self.state.config.access_file.display()
        );
        let table = match parse_access_file(&self.state.config.access_file, &self.state.feedtypes)
        {
            Ok(table) => table,
            Err(err) => {
                log::error!("reload failed, keeping the previous tables: {}", err);
                return;
            }
        };

        let fresh_requests: Vec<RequestEntry> = table
            .request
            .iter()
            .filter(|request| {
                !self.requests.iter().any(|have| {
                    have.host == request.host
                        && have.port == request.port
                        && have.feedtype == request.feedtype
                        && have.pattern.source() == request.pattern.source()
                })
            })
            .cloned()
            .collect();
        let fresh_execs: Vec<ExecEntry> = table
            .exec
            .iter()
            .filter(|entry| !self.children.iter().any(|have| have.entry.argv == entry.argv))
            .cloned()
            .collect();

        self.requests = table.request.clone();
        self.state.replace_access(table);

        for request in fresh_requests {
            log::info!("new request: {}:{}", request.host, request.port);
            self.spawn_request(request);
        }
        for entry in fresh_execs {
            self.spawn_exec(entry);
        }
    }

    fn reap_children(&mut self) {
        self.children.retain_mut(|exec| match exec.child.try_wait() {
            Ok(Some(status)) => {
                log::warn!("exec child {:?} exited: {}", exec.entry.argv, status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                log::error!("cannot reap {:?}: {}", exec.entry.argv, err);
                false
            }
        });
    }
}
