//! The receiver side of a peer link: one worker per standing `REQUEST`.
//!
//! The worker keeps a connection to its upstream, subscribes with the
//! request's class, and inserts every arriving product into the queue.
//! `Duplicate` and `TooBig` outcomes are logged and swallowed. When the
//! upstream reduces the subscription (`Reclass`), the worker narrows its
//! class and resubscribes; an empty reduction drops the link for good.
//! Reconnection backs off exponentially, capped, with jitter, and resumes
//! after the last received product via the trailing-signature hint.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::acl::RequestEntry;
use crate::class::ProductClass;
use crate::config::PeerConfig;
use crate::control::SignalControl;
use crate::peer::PeerRegistry;
use crate::product::{Product, ProductInfo, Signature};
use crate::queue::{InsertOutcome, ProductQueue};
use crate::wire::{read_message, write_message, Message, WireError, HEREIS_UNLIMITED};

/// Link phases, in connection order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Subscribing,
    Subscribed,
    Receiving,
}

/// Why a session over one connection ended.
pub enum SessionEnd {
    /// Transport failed or timed out; reconnect with backoff.
    Disconnected,
    /// The upstream narrowed our class; resubscribe immediately.
    Reclassed,
    /// Nothing left of the subscription; stop for good.
    Denied,
    /// Shutdown requested.
    Shutdown,
}

pub struct DownstreamWorker {
    pub id: u32,
    pub queue: Arc<ProductQueue>,
    pub registry: Arc<PeerRegistry>,
    pub control: SignalControl,
    pub request: RequestEntry,
    pub tuning: PeerConfig,
}

impl DownstreamWorker {
    /// Runs the connect/subscribe/receive loop until shutdown or a
    /// permanent denial. Consumes the worker; deregisters on the way out.
    pub fn run(self) {
        let mut class = self.request.class();
        let mut last_sig: Option<Signature> = None;
        let mut attempt: u32 = 0;

        loop {
            if self.control.is_done() {
                break;
            }
            log::debug!(
                "{}:{} link {:?}",
                self.request.host,
                self.request.port,
                LinkState::Connecting
            );
            let stream = match self.connect() {
                Ok(stream) => stream,
                Err(err) => {
                    log::info!(
                        "cannot reach {}:{}: {}",
                        self.request.host,
                        self.request.port,
                        err
                    );
                    attempt = attempt.saturating_add(1);
                    if !self.backoff(attempt) {
                        break;
                    }
                    continue;
                }
            };
            match self.session(stream, &mut class, &mut last_sig) {
                SessionEnd::Reclassed => {
                    attempt = 0;
                    continue;
                }
                SessionEnd::Disconnected => {
                    attempt = attempt.saturating_add(1);
                    if !self.backoff(attempt) {
                        break;
                    }
                }
                SessionEnd::Denied => {
                    log::warn!(
                        "{} grants nothing of {}; dropping the request",
                        self.request.host,
                        class
                    );
                    break;
                }
                SessionEnd::Shutdown => break,
            }
        }
        self.registry.deregister(self.id);
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let timeout = Duration::from_millis(self.tuning.connect_timeout_ms);
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in (self.request.host.as_str(), self.request.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// One connection's worth of work: subscribe, then receive until the
    /// transport ends.
    fn session(
        &self,
        mut stream: TcpStream,
        class: &mut ProductClass,
        last_sig: &mut Option<Signature>,
    ) -> SessionEnd {
        log::debug!("{} link {:?}", self.request.host, LinkState::Subscribing);
        let subscribe = match last_sig {
            // Resume strictly after the last product we saw.
            Some(sig) => class.clone().with_signature_hint(*sig),
            None => class.clone(),
        };
        let sent = write_message(
            &mut stream,
            &Message::FeedMe {
                class: subscribe,
                max_hereis: HEREIS_UNLIMITED,
            },
        );
        if let Err(err) = sent {
            log::info!("subscribe to {} failed: {}", self.request.host, err);
            return SessionEnd::Disconnected;
        }
        match read_message(&mut stream) {
            Ok(Message::Ok { value }) => {
                log::info!(
                    "{} link {:?}: subscribed to {} (remote worker {})",
                    self.request.host,
                    LinkState::Subscribed,
                    class,
                    value
                );
            }
            Ok(Message::Reclass { class: narrowed }) => {
                if narrowed.is_empty() {
                    return SessionEnd::Denied;
                }
                log::info!(
                    "{} narrowed the subscription to {}",
                    self.request.host,
                    narrowed
                );
                *class = narrowed;
                return SessionEnd::Reclassed;
            }
            Ok(Message::BadPattern) => {
                log::error!("{} rejected the request pattern", self.request.host);
                return SessionEnd::Denied;
            }
            Ok(other) => {
                log::warn!("unexpected subscribe reply: {:?}", other);
                return SessionEnd::Disconnected;
            }
            Err(err) => {
                log::info!("subscribe reply from {} lost: {}", self.request.host, err);
                return SessionEnd::Disconnected;
            }
        }

        // Idle links drop out of the read and reconnect with a resume hint.
        let idle = Duration::from_secs(self.tuning.suspend_secs.max(1));
        if stream.set_read_timeout(Some(idle)).is_err() {
            return SessionEnd::Disconnected;
        }
        log::debug!("{} link {:?}", self.request.host, LinkState::Receiving);
        receive_products(
            &mut stream,
            &self.queue,
            class,
            &self.control,
            last_sig,
        )
    }

    /// Sleeps the capped, jittered exponential delay. False on shutdown.
    fn backoff(&self, attempt: u32) -> bool {
        let base = self.tuning.backoff_base_ms.max(1);
        let cap = self.tuning.backoff_cap_ms.max(base);
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        // Up to 25% jitter, from a hasher rather than an RNG dependency.
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u32(attempt);
        let jitter = hasher.finish() % (exp / 4 + 1);
        let delay = Duration::from_millis(exp - exp / 8 + jitter);
        log::debug!("reconnect to {} in {:?}", self.request.host, delay);

        let step = Duration::from_millis(100);
        let mut remaining = delay;
        while remaining > Duration::ZERO {
            if self.control.is_done() {
                return false;
            }
            let chunk = step.min(remaining);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
        !self.control.is_done()
    }
}

/// In-flight alternate-mode assembly, keyed by signature.
struct Assembly {
    info: ProductInfo,
    data: Vec<u8>,
    filled: usize,
}

/// Receives frames and inserts completed products until the transport ends.
///
/// Shared between the `REQUEST` worker and the server's push path (an
/// upstream that announced itself with `Hiya`): both end in the same
/// receive-verify-insert loop.
pub fn receive_products(
    stream: &mut TcpStream,
    queue: &ProductQueue,
    class: &ProductClass,
    control: &SignalControl,
    last_sig: &mut Option<Signature>,
) -> SessionEnd {
    let mut pending: HashMap<Signature, Assembly> = HashMap::new();
    loop {
        if control.is_done() {
            return SessionEnd::Shutdown;
        }
        let message = match read_message(stream) {
            Ok(message) => message,
            Err(WireError::Io(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                log::debug!("receive idle timeout; cycling the link");
                return SessionEnd::Disconnected;
            }
            Err(err) => {
                log::info!("receive failed: {}", err);
                return SessionEnd::Disconnected;
            }
        };
        match message {
            Message::HereIs { product } => {
                accept_product(queue, class, product, last_sig);
            }
            Message::Notification { info } => {
                log::info!("notified: {}", info);
            }
            Message::ComingSoon { info, size } => {
                let have = matches!(queue.cursor_from_signature(&info.signature), Ok(Some(_)));
                let reply = if have {
                    Message::DontSend
                } else {
                    pending.insert(
                        info.signature,
                        Assembly {
                            data: vec![0u8; size as usize],
                            filled: 0,
                            info,
                        },
                    );
                    Message::Ok { value: 0 }
                };
                if write_message(stream, &reply).is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            Message::BlkData {
                signature,
                offset,
                data,
            } => {
                let complete = match pending.get_mut(&signature) {
                    Some(assembly) => {
                        let offset = offset as usize;
                        let end = offset + data.len();
                        if end > assembly.data.len() {
                            log::error!("block past announced size for {}", signature);
                            pending.remove(&signature);
                            continue;
                        }
                        assembly.data[offset..end].copy_from_slice(&data);
                        assembly.filled += data.len();
                        assembly.filled >= assembly.data.len()
                    }
                    None => {
                        log::warn!("unannounced block for {}", signature);
                        continue;
                    }
                };
                if complete {
                    let assembly = pending.remove(&signature).unwrap();
                    accept_product(
                        queue,
                        class,
                        Product {
                            info: assembly.info,
                            data: assembly.data,
                        },
                        last_sig,
                    );
                }
            }
            other => {
                log::warn!("unexpected frame on receive link: {:?}", other);
            }
        }
    }
}

/// Verifies and inserts one received product.
fn accept_product(
    queue: &ProductQueue,
    class: &ProductClass,
    product: Product,
    last_sig: &mut Option<Signature>,
) {
    let computed = Signature::of(&product.data);
    if computed != product.info.signature {
        log::error!(
            "signature mismatch on {} (claimed {}, computed {})",
            product.info.ident,
            product.info.signature,
            computed
        );
        return;
    }
    // The arrival time is local; only the class's pattern/feedtype side
    // gates what we store.
    let mut probe = product.info.clone();
    probe.arrival = crate::product::Timestamp::now();
    if !class.is_empty() && !class.matches(&probe) {
        log::debug!("ignoring out-of-class product {}", product.info.ident);
        return;
    }
    match queue.insert(&product) {
        Ok(InsertOutcome::Inserted(at)) => {
            log::debug!("received {} at {}", product.info.ident, at);
        }
        Ok(InsertOutcome::Duplicate) => {
            log::debug!("duplicate product {}", product.info.signature);
        }
        Ok(InsertOutcome::TooBig) => {
            log::warn!(
                "received product {} too big for the queue",
                product.info.ident
            );
        }
        Err(err) => {
            log::error!("insert failed for {}: {}", product.info.ident, err);
        }
    }
    *last_sig = Some(product.info.signature);
}
