//! A store-and-forward node for real-time product dissemination.
//!
//! A stratus node receives data-products from upstream peers, stores them in
//! a bounded memory-mapped product queue, re-feeds them to downstream peers
//! whose subscriptions match, and runs local file/pipe/exec actions through
//! the pattern-action engine. The pieces:
//!
//! - [`queue`] — the crash-resistant shared product queue: concurrent
//!   inserts, independent per-consumer cursors, oldest-first eviction.
//! - [`feedtype`] — the 32-bit feed categories, their registry and algebra.
//! - [`class`] — subscription predicates: time window, feedtype, patterns.
//! - [`acl`] — ALLOW/REQUEST/ACCEPT/EXEC tables and subscription reduction.
//! - [`wire`] — the framed peer protocol.
//! - [`peer`] — sender and receiver workers plus the live-link registry.
//! - [`pqact`] — the pattern-action engine and its durable cursor.
//! - [`runtime`] — the daemon that wires all of it together.
//!
//! The queue file is shared between processes and coordinated purely
//! through advisory byte-range locks, so `stratusd`, `pqact`, and
//! `pqinsert` interoperate on one queue without knowing about each other.

pub mod acl;
pub mod class;
pub mod config;
pub mod control;
pub mod feedtype;
pub mod peer;
pub mod pqact;
pub mod product;
pub mod queue;
pub mod runtime;
pub mod state;
pub mod util;
pub mod wire;

pub use self::class::{ClassSpec, Pattern, ProductClass};
pub use self::control::SignalControl;
pub use self::feedtype::{builtin_table, parse_feedtype, Feedtype};
pub use self::product::{Product, ProductInfo, Signature, Timestamp};
pub use self::queue::{Cursor, InsertOutcome, NextOutcome, ProductQueue, Wake};
pub use self::runtime::Runtime;

#[macro_use]
extern crate lazy_static;
