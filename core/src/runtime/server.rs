//! The peer-facing server: subscription handshakes and push links.
//!
//! One thread per accepted connection. The first frame decides the shape of
//! the rest: `FeedMe`/`NotifyMe` turn the thread into a sender worker for
//! that downstream, `Hiya` turns it into a receive loop for a pushing
//! upstream, `IsAlive` is answered and the connection closed.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::acl::{AccessTable, Reduction, TransferMode};
use crate::config::RuntimeConfig;
use crate::control::SignalControl;
use crate::feedtype::FeedtypeTable;
use crate::peer::downstream::receive_products;
use crate::peer::upstream::UpstreamWorker;
use crate::peer::{PeerRegistry, PeerRole};
use crate::queue::ProductQueue;
use crate::wire::{read_message, write_message, Message, HEREIS_UNLIMITED};

/// Everything the server and the reload path share.
pub struct NodeState {
    pub config: RuntimeConfig,
    pub queue: Arc<ProductQueue>,
    pub registry: Arc<PeerRegistry>,
    pub control: SignalControl,
    pub feedtypes: FeedtypeTable,
    /// Swapped whole on HUP; readers clone the Arc and keep going.
    table: Mutex<Arc<AccessTable>>,
}

impl NodeState {
    pub fn new(
        config: RuntimeConfig,
        queue: Arc<ProductQueue>,
        control: SignalControl,
        feedtypes: FeedtypeTable,
        table: AccessTable,
    ) -> NodeState {
        NodeState {
            config,
            queue,
            registry: Arc::new(PeerRegistry::new()),
            control,
            feedtypes,
            table: Mutex::new(Arc::new(table)),
        }
    }

    pub fn access(&self) -> Arc<AccessTable> {
        Arc::clone(&self.table.lock().unwrap())
    }

    pub fn replace_access(&self, table: AccessTable) {
        *self.table.lock().unwrap() = Arc::new(table);
    }
}

/// Accept loop. Polls so shutdown is noticed without a final connection.
pub fn serve(listener: TcpListener, state: Arc<NodeState>) {
    if let Err(err) = listener.set_nonblocking(true) {
        log::error!("cannot poll the listener: {}", err);
        return;
    }
    loop {
        if state.control.is_done() {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("connection from {}", addr);
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let state = Arc::clone(&state);
                std::thread::spawn(move || handle_peer(stream, state));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                log::error!("accept failed: {}", err);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    log::info!("listener stopped");
}

fn handle_peer(mut stream: TcpStream, state: Arc<NodeState>) {
    let host = match stream.peer_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => return,
    };
    let handshake_timeout = Duration::from_millis(state.config.peer.connect_timeout_ms);
    if stream.set_read_timeout(Some(handshake_timeout)).is_err() {
        return;
    }
    let first = match read_message(&mut stream) {
        Ok(message) => message,
        Err(err) => {
            log::info!("handshake from {} failed: {}", host, err);
            return;
        }
    };
    match first {
        Message::FeedMe { class, max_hereis } => {
            subscribe_peer(stream, state, &host, class, max_hereis, false)
        }
        Message::NotifyMe { class } => {
            subscribe_peer(stream, state, &host, class, HEREIS_UNLIMITED, true)
        }
        Message::Hiya { class } => push_link(stream, state, &host, class),
        Message::IsAlive { id } => {
            let alive = state.registry.is_alive(id);
            let _unused = write_message(&mut stream, &Message::Alive { alive });
        }
        other => log::warn!("unexpected opening frame from {}: {:?}", host, other),
    }
}

/// `FeedMe`/`NotifyMe`: reduce, reply, become the sender worker.
fn subscribe_peer(
    mut stream: TcpStream,
    state: Arc<NodeState>,
    host: &str,
    class: crate::class::ProductClass,
    max_hereis: u32,
    notify_only: bool,
) {
    let (class, hint) = class.take_signature_hint();
    let table = state.access();
    let existing = state.registry.classes_for_host(host);
    let granted = match table.reduce(host, &class, &existing) {
        Reduction::AsRequested(granted) => granted,
        Reduction::Reduced(granted) => {
            let _unused = write_message(&mut stream, &Message::Reclass { class: granted });
            return;
        }
        Reduction::Denied => {
            let _unused = write_message(
                &mut stream,
                &Message::Reclass {
                    class: crate::class::ProductClass::empty(),
                },
            );
            return;
        }
    };

    let id = state.registry.register(
        host,
        PeerRole::Upstream,
        TransferMode::Primary,
        granted.clone(),
    );
    if write_message(&mut stream, &Message::Ok { value: id }).is_err() {
        state.registry.deregister(id);
        return;
    }
    let worker = UpstreamWorker {
        id,
        host: host.to_string(),
        queue: Arc::clone(&state.queue),
        registry: Arc::clone(&state.registry),
        control: state.control,
        class: granted,
        filter: table.allow_entries_for(host),
        mode: TransferMode::Primary,
        max_hereis,
        signature_hint: hint,
        tuning: state.config.peer.clone(),
        notify_only,
    };
    worker.run(stream);
}

/// `Hiya`: narrow the offer to what we accept, then receive.
fn push_link(
    mut stream: TcpStream,
    state: Arc<NodeState>,
    host: &str,
    offered: crate::class::ProductClass,
) {
    let (offered, _hint) = offered.take_signature_hint();
    let table = state.access();
    let acceptable = table.accept_class(host);
    let adjusted = offered.intersect(&acceptable);
    if adjusted.is_empty() {
        log::info!("accepting nothing of {}'s offer", host);
        let _unused = write_message(
            &mut stream,
            &Message::Reclass {
                class: crate::class::ProductClass::empty(),
            },
        );
        return;
    }
    let reply = if adjusted == offered {
        Message::Ok {
            value: HEREIS_UNLIMITED,
        }
    } else {
        Message::Reclass {
            class: adjusted.clone(),
        }
    };
    if write_message(&mut stream, &reply).is_err() {
        return;
    }
    let id = state.registry.register(
        host,
        PeerRole::Downstream,
        TransferMode::Primary,
        adjusted.clone(),
    );
    let idle = Duration::from_secs(state.config.peer.suspend_secs.max(1) * 4);
    let _unused = stream.set_read_timeout(Some(idle));
    let mut last_sig = None;
    receive_products(
        &mut stream,
        &state.queue,
        &adjusted,
        &state.control,
        &mut last_sig,
    );
    state.registry.deregister(id);
}
