//! Access control: who may pull what, what we request, what we accept.
//!
//! The access-control file yields four rule lists. `ALLOW` bounds what a
//! downstream host may subscribe to; `REQUEST` names the standing
//! subscriptions this node holds with upstreams; `ACCEPT` bounds what an
//! upstream may push at us; `EXEC` names auxiliary child processes. The
//! tables are immutable once built — a HUP builds a fresh set and swaps it
//! in whole.

mod parser;

pub use self::parser::{parse_access_file, parse_access_str};

use std::fmt;
use std::net::IpAddr;

use crate::class::{ClassSpec, Pattern, ProductClass};
use crate::feedtype::Feedtype;
use crate::product::ProductInfo;

/// How a rule names hosts: literal hostname, dotted-quad prefix, or regex.
#[derive(Clone, Debug)]
pub enum HostPattern {
    Literal(String),
    DottedQuad(String),
    Pattern(Pattern),
}

impl HostPattern {
    /// Classifies the spelling: a parseable address or an all-digits-and-dots
    /// string is a dotted quad, a plain hostname is literal, anything else
    /// is a regex.
    pub fn classify(s: &str) -> Result<HostPattern, crate::class::ClassError> {
        if s.parse::<IpAddr>().is_ok() || s.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Ok(HostPattern::DottedQuad(s.to_string()));
        }
        if s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return Ok(HostPattern::Literal(s.to_string()));
        }
        Ok(HostPattern::Pattern(Pattern::compile(s)?))
    }

    /// Matches a peer's hostname or printed address. Dotted quads match by
    /// prefix so `128.117` covers the whole net.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Literal(name) => name.eq_ignore_ascii_case(host),
            HostPattern::DottedQuad(prefix) => {
                let prefix = prefix.trim_end_matches('.');
                host == prefix
                    || host
                        .strip_prefix(prefix)
                        .map(|rest| rest.starts_with('.'))
                        .unwrap_or(false)
            }
            HostPattern::Pattern(pattern) => pattern.matches(host),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Literal(s) | HostPattern::DottedQuad(s) => write!(f, "{}", s),
            HostPattern::Pattern(p) => write!(f, "{}", p.source()),
        }
    }
}

/// Transfer mode for a peer link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// Whole products in single `HereIs` frames.
    #[default]
    Primary,
    /// `ComingSoon` announcement plus `BlkData` blocks.
    Alternate,
}

/// `ALLOW feedtype host_pattern [ok_ere [not_ere]]`
#[derive(Clone, Debug)]
pub struct AllowEntry {
    pub feedtype: Feedtype,
    pub hosts: HostPattern,
    /// Products must match this to be sent (default `.*`).
    pub ok: Pattern,
    /// Products matching this are withheld even when `ok` matches.
    pub not: Option<Pattern>,
}

impl AllowEntry {
    /// The fine-grained per-product gate applied on the send path.
    pub fn permits(&self, info: &ProductInfo) -> bool {
        if !info.feedtype.intersects(self.feedtype) {
            return false;
        }
        if !self.ok.matches(&info.ident) {
            return false;
        }
        match &self.not {
            Some(not) => !not.matches(&info.ident),
            None => true,
        }
    }
}

/// `REQUEST feedtype identifier_pattern upstream_host[:port]`
#[derive(Clone, Debug)]
pub struct RequestEntry {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
    pub host: String,
    pub port: u16,
    pub mode: TransferMode,
}

impl RequestEntry {
    pub fn class(&self) -> ProductClass {
        ProductClass::new(vec![ClassSpec {
            feedtype: self.feedtype,
            patterns: vec![self.pattern.clone()],
        }])
    }
}

/// `ACCEPT feedtype identifier_pattern host_pattern [primary|alternate]`
#[derive(Clone, Debug)]
pub struct AcceptEntry {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
    pub hosts: HostPattern,
    pub mode: TransferMode,
}

/// `EXEC argv...`
#[derive(Clone, Debug)]
pub struct ExecEntry {
    pub argv: Vec<String>,
}

/// The whole access-control table; rebuilt and swapped atomically on HUP.
#[derive(Clone, Debug, Default)]
pub struct AccessTable {
    pub allow: Vec<AllowEntry>,
    pub request: Vec<RequestEntry>,
    pub accept: Vec<AcceptEntry>,
    pub exec: Vec<ExecEntry>,
}

/// Outcome of reducing a downstream subscription request.
#[derive(Clone, Debug)]
pub enum Reduction {
    /// Request granted as asked.
    AsRequested(ProductClass),
    /// Request narrowed; the peer must continue with this class.
    Reduced(ProductClass),
    /// Nothing of the request is allowed; the peer is expected to drop.
    Denied,
}

impl AccessTable {
    /// The union class a host may pull: one spec per matching ALLOW entry.
    pub fn allowed_class(&self, host: &str) -> ProductClass {
        let specs = self
            .allow
            .iter()
            .filter(|entry| entry.hosts.matches(host))
            .map(|entry| ClassSpec {
                feedtype: entry.feedtype,
                patterns: vec![entry.ok.clone()],
            })
            .collect();
        ProductClass::new(specs)
    }

    /// The ALLOW entries backing a host's upstream filter (`ok`/`not` gates).
    pub fn allow_entries_for(&self, host: &str) -> Vec<AllowEntry> {
        self.allow
            .iter()
            .filter(|entry| entry.hosts.matches(host))
            .cloned()
            .collect()
    }

    /// Whether an offered product from `host` is acceptable, and in which
    /// mode. Used by the `Hiya` path.
    pub fn accepts(&self, host: &str, info: &ProductInfo) -> Option<TransferMode> {
        self.accept
            .iter()
            .find(|entry| {
                entry.hosts.matches(host)
                    && info.feedtype.intersects(entry.feedtype)
                    && entry.pattern.matches(&info.ident)
            })
            .map(|entry| entry.mode)
    }

    /// The class this node will accept from `host` when offered via `Hiya`.
    pub fn accept_class(&self, host: &str) -> ProductClass {
        let specs = self
            .accept
            .iter()
            .filter(|entry| entry.hosts.matches(host))
            .map(|entry| ClassSpec {
                feedtype: entry.feedtype,
                patterns: vec![entry.pattern.clone()],
            })
            .collect();
        ProductClass::new(specs)
    }

    /// Reduces a subscription request from `host`.
    ///
    /// The request is intersected with the union of the host's ALLOW
    /// entries, then stripped of specs identical to ones the peer is
    /// already being fed (`existing`) so one peer cannot open duplicate
    /// streams for the same data.
    pub fn reduce(
        &self,
        host: &str,
        requested: &ProductClass,
        existing: &[ProductClass],
    ) -> Reduction {
        let allowed = self.allowed_class(host);
        let mut granted = requested.intersect(&allowed);
        if granted != *requested {
            log::info!(
                "reduced request from {}: {} -> {}",
                host,
                requested,
                granted
            );
        }

        let before = granted.specs.len();
        granted.specs.retain(|spec| {
            !existing
                .iter()
                .any(|class| class.specs.iter().any(|have| have == spec))
        });
        if granted.specs.len() != before {
            log::info!(
                "dropped {} spec(s) already subscribed by {}",
                before - granted.specs.len(),
                host
            );
        }

        if granted.is_empty() {
            Reduction::Denied
        } else if granted == *requested {
            Reduction::AsRequested(granted)
        } else {
            Reduction::Reduced(granted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::Product;

    fn info(ft: u32, ident: &str) -> ProductInfo {
        Product::new(Feedtype(ft), 0, ident, "t", vec![1]).info
    }

    fn allow(ft: u32, host: &str, ok: &str, not: Option<&str>) -> AllowEntry {
        AllowEntry {
            feedtype: Feedtype(ft),
            hosts: HostPattern::classify(host).unwrap(),
            ok: Pattern::compile(ok).unwrap(),
            not: not.map(|n| Pattern::compile(n).unwrap()),
        }
    }

    #[test]
    fn acl_host_literal_case_insensitive() {
        let host = HostPattern::classify("Node1.Example.EDU").unwrap();
        assert!(matches!(host, HostPattern::Literal(_)));
        assert!(host.matches("node1.example.edu"));
        assert!(!host.matches("node2.example.edu"));
    }

    #[test]
    fn acl_host_dotted_quad_prefix() {
        let host = HostPattern::classify("128.117").unwrap();
        assert!(matches!(host, HostPattern::DottedQuad(_)));
        assert!(host.matches("128.117.140.1"));
        assert!(host.matches("128.117"));
        assert!(!host.matches("128.11"));
        assert!(!host.matches("10.0.0.1"));
    }

    #[test]
    fn acl_host_regex() {
        let host = HostPattern::classify(r"^node[0-9]\.example\.net$").unwrap();
        assert!(matches!(host, HostPattern::Pattern(_)));
        assert!(host.matches("node3.example.net"));
        assert!(!host.matches("node33.example.net"));
    }

    #[test]
    fn acl_allow_ok_not_gates() {
        let entry = allow(0b1, "anywhere.example", "^SD", Some("KDDC$"));
        assert!(entry.permits(&info(0b1, "SDUS54 KTLX")));
        assert!(!entry.permits(&info(0b1, "SDUS54 KDDC"))); // not_ere withheld
        assert!(!entry.permits(&info(0b1, "WXUS01"))); // fails ok_ere
        assert!(!entry.permits(&info(0b10, "SDUS54 KTLX"))); // feedtype
    }

    #[test]
    fn acl_reduce_narrows_to_allowed() {
        let table = AccessTable {
            allow: vec![
                allow(0b1, "peer.example", "^sa.*", None),
                allow(0b1, "peer.example", "^fo.*", None),
            ],
            ..Default::default()
        };
        let requested =
            ProductClass::new(vec![ClassSpec::new(Feedtype(0b1), ".*").unwrap()]);
        match table.reduce("peer.example", &requested, &[]) {
            Reduction::Reduced(class) => {
                assert!(class.matches(&info(0b1, "salmon")));
                assert!(class.matches(&info(0b1, "fox")));
                assert!(!class.matches(&info(0b1, "other")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn acl_reduce_passes_exact_subset() {
        let table = AccessTable {
            allow: vec![allow(0b11, "peer.example", ".*", None)],
            ..Default::default()
        };
        let requested =
            ProductClass::new(vec![ClassSpec::new(Feedtype(0b01), ".*").unwrap()]);
        assert!(matches!(
            table.reduce("peer.example", &requested, &[]),
            Reduction::AsRequested(_)
        ));
    }

    #[test]
    fn acl_reduce_denies_unknown_host() {
        let table = AccessTable {
            allow: vec![allow(0b1, "peer.example", ".*", None)],
            ..Default::default()
        };
        let requested =
            ProductClass::new(vec![ClassSpec::new(Feedtype(0b1), ".*").unwrap()]);
        assert!(matches!(
            table.reduce("stranger.example", &requested, &[]),
            Reduction::Denied
        ));
    }

    #[test]
    fn acl_reduce_drops_duplicate_stream() {
        let table = AccessTable {
            allow: vec![allow(0b1, "peer.example", ".*", None)],
            ..Default::default()
        };
        let requested =
            ProductClass::new(vec![ClassSpec::new(Feedtype(0b1), ".*").unwrap()]);
        let existing = match table.reduce("peer.example", &requested, &[]) {
            Reduction::AsRequested(class) => class,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            table.reduce("peer.example", &requested, &[existing]),
            Reduction::Denied
        ));
    }

    #[test]
    fn acl_accepts_by_mode() {
        let table = AccessTable {
            accept: vec![AcceptEntry {
                feedtype: Feedtype(0b1),
                pattern: Pattern::compile("^SDUS5").unwrap(),
                hosts: HostPattern::classify("up.example").unwrap(),
                mode: TransferMode::Alternate,
            }],
            ..Default::default()
        };
        assert_eq!(
            table.accepts("up.example", &info(0b1, "SDUS54 KTLX")),
            Some(TransferMode::Alternate)
        );
        assert_eq!(table.accepts("up.example", &info(0b1, "WXUS01")), None);
        assert_eq!(table.accepts("other.example", &info(0b1, "SDUS54")), None);
    }
}
