//! Peer link workers and their registry.
//!
//! Each subscribed downstream peer is served by one sender worker; each
//! standing upstream `REQUEST` is driven by one receiver worker. Workers are
//! OS threads with blocking sockets; the registry tracks the live set so
//! subscription reduction can see a peer's existing streams, `IsAlive`
//! probes can be answered, and shutdown can reap everything.

pub mod downstream;
pub mod upstream;

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::acl::TransferMode;
use crate::class::ProductClass;

/// Which side of a link our worker is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// We feed products to a downstream subscriber.
    Upstream,
    /// We receive products from an upstream.
    Downstream,
}

/// One live peer link.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub id: u32,
    pub host: String,
    pub role: PeerRole,
    pub mode: TransferMode,
    pub class: ProductClass,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u32,
    entries: HashMap<u32, PeerEntry>,
    handles: HashMap<u32, JoinHandle<()>>,
}

/// Process-wide registry of peer workers, keyed by worker id. The id plays
/// the role a child pid would in a forking deployment: it is what `Ok`
/// replies carry and what `IsAlive` probes ask about.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry::default()
    }

    /// Registers a link and returns its id.
    pub fn register(
        &self,
        host: &str,
        role: PeerRole,
        mode: TransferMode,
        class: ProductClass,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            PeerEntry {
                id,
                host: host.to_string(),
                role,
                mode,
                class,
            },
        );
        log::info!("registered {:?} peer {} as worker {}", role, host, id);
        id
    }

    /// Attaches the worker thread handle for later reaping.
    pub fn attach(&self, id: u32, handle: JoinHandle<()>) {
        self.inner.lock().unwrap().handles.insert(id, handle);
    }

    /// Removes a link; workers call this on the way out.
    pub fn deregister(&self, id: u32) {
        if self.inner.lock().unwrap().entries.remove(&id).is_some() {
            log::info!("deregistered worker {}", id);
        }
    }

    pub fn is_alive(&self, id: u32) -> bool {
        self.inner.lock().unwrap().entries.contains_key(&id)
    }

    /// Classes the host is already being fed; input to subscription
    /// reduction.
    pub fn classes_for_host(&self, host: &str) -> Vec<ProductClass> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|entry| entry.role == PeerRole::Upstream && entry.host == host)
            .map(|entry| entry.class.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins finished worker threads and drops their handles.
    pub fn reap(&self) {
        let finished: Vec<(u32, JoinHandle<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            let done: Vec<u32> = inner
                .handles
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            done.into_iter()
                .filter_map(|id| inner.handles.remove(&id).map(|handle| (id, handle)))
                .collect()
        };
        for (id, handle) in finished {
            if handle.join().is_err() {
                log::error!("worker {} panicked", id);
            }
            self.deregister(id);
        }
    }

    /// Blocks until every worker thread has exited. Callers set the done
    /// flag first; workers notice at their next quiescent point.
    pub fn join_all(&self) {
        let handles: Vec<(u32, JoinHandle<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.handles.drain().collect()
        };
        for (id, handle) in handles {
            if handle.join().is_err() {
                log::error!("worker {} panicked", id);
            }
            self.deregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassSpec, ProductClass};
    use crate::feedtype::Feedtype;

    fn class() -> ProductClass {
        ProductClass::new(vec![ClassSpec::new(Feedtype(1), ".*").unwrap()])
    }

    #[test]
    fn registry_register_probe_deregister() {
        let registry = PeerRegistry::new();
        let id = registry.register("peer.example", PeerRole::Upstream, TransferMode::Primary, class());
        assert!(registry.is_alive(id));
        assert_eq!(registry.len(), 1);
        registry.deregister(id);
        assert!(!registry.is_alive(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_classes_for_host_filters_role() {
        let registry = PeerRegistry::new();
        registry.register("a.example", PeerRole::Upstream, TransferMode::Primary, class());
        registry.register("a.example", PeerRole::Downstream, TransferMode::Primary, class());
        registry.register("b.example", PeerRole::Upstream, TransferMode::Primary, class());
        assert_eq!(registry.classes_for_host("a.example").len(), 1);
    }

    #[test]
    fn registry_reap_joins_finished() {
        let registry = PeerRegistry::new();
        let id = registry.register("x", PeerRole::Upstream, TransferMode::Primary, class());
        registry.attach(id, std::thread::spawn(|| {}));
        std::thread::sleep(std::time::Duration::from_millis(50));
        registry.reap();
        assert!(!registry.is_alive(id));
    }
}
