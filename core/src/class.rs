//! Product classes: the request/filter predicates peers subscribe with.
//!
//! A class is a time window plus a disjunction of `(feedtype, pattern)`
//! specifications. Because the intersection of two regexes is not in general
//! a regex, intersecting two classes produces specs whose pattern component
//! is a *conjunction list*, evaluated left to right at match time.
//!
//! A class may carry a trailing resume hint: a spec whose feedtype is `NONE`
//! and whose pattern is `SIG=<32 hex digits>`. Construction strips such a
//! spec from the predicate and surfaces the signature separately.

use std::fmt;

use itertools::Itertools;
use regex::Regex;
use thiserror::Error;

use crate::feedtype::{Feedtype, NONE};
use crate::product::{ProductInfo, Signature, Timestamp, TS_END, TS_ZERO};

#[derive(Error, Debug)]
pub enum ClassError {
    #[error("bad pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// One compiled identifier pattern.
#[derive(Clone, Debug)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, ClassError> {
        let regex = Regex::new(source).map_err(|source_err| ClassError::BadPattern {
            pattern: source.to_string(),
            source: source_err,
        })?;
        Ok(Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, ident: &str) -> bool {
        self.regex.is_match(ident)
    }

    /// Capture groups of the first match, if any. Group 0 is the whole match.
    pub fn captures<'t>(&self, ident: &'t str) -> Option<regex::Captures<'t>> {
        self.regex.captures(ident)
    }
}

// Identity is the pattern source; the compiled automaton is derived state.
impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}
impl Eq for Pattern {}

/// One specification: a feedtype mask and a conjunction of patterns.
///
/// A freshly parsed class has single-pattern specs; intersection grows the
/// conjunction list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassSpec {
    pub feedtype: Feedtype,
    pub patterns: Vec<Pattern>,
}

impl ClassSpec {
    pub fn new(feedtype: Feedtype, pattern: &str) -> Result<Self, ClassError> {
        Ok(ClassSpec {
            feedtype,
            patterns: vec![Pattern::compile(pattern)?],
        })
    }

    fn matches(&self, info: &ProductInfo) -> bool {
        info.feedtype.intersects(self.feedtype) && self.patterns.iter().all(|p| p.matches(&info.ident))
    }
}

impl fmt::Display for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:#x}, {})",
            self.feedtype.0,
            self.patterns.iter().map(Pattern::source).join(" & ")
        )
    }
}

/// A canonical product-class predicate.
///
/// An empty specification list matches nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductClass {
    pub from: Timestamp,
    pub to: Timestamp,
    pub specs: Vec<ClassSpec>,
}

impl ProductClass {
    /// The match-nothing class.
    pub fn empty() -> Self {
        ProductClass {
            from: TS_ZERO,
            to: TS_END,
            specs: vec![],
        }
    }

    /// An unbounded-time class over `specs`.
    pub fn new(specs: Vec<ClassSpec>) -> Self {
        ProductClass {
            from: TS_ZERO,
            to: TS_END,
            specs,
        }
        .canonical()
    }

    /// Canonical form: duplicate specs removed, order preserved.
    pub fn canonical(mut self) -> Self {
        let mut seen: Vec<(Feedtype, Vec<String>)> = vec![];
        self.specs.retain(|spec| {
            let key = (
                spec.feedtype,
                spec.patterns.iter().map(|p| p.source.clone()).collect(),
            );
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
        self
    }

    /// Strips a trailing `(NONE, "SIG=<hex>")` spec into a resume hint.
    /// Malformed hints are dropped from the predicate and ignored.
    pub fn take_signature_hint(mut self) -> (Self, Option<Signature>) {
        let mut hint = None;
        self.specs.retain(|spec| {
            if !spec.feedtype.is_none() || spec.patterns.len() != 1 {
                return true;
            }
            match spec.patterns[0].source().strip_prefix("SIG=") {
                Some(hex_digits) => {
                    match hex_digits.parse::<Signature>() {
                        Ok(sig) => hint = Some(sig),
                        Err(_) => log::warn!("ignoring malformed signature hint: {}", spec),
                    }
                    false
                }
                None => true,
            }
        });
        (self, hint)
    }

    /// Appends the resume-hint encoding of `sig` to the spec list.
    pub fn with_signature_hint(mut self, sig: Signature) -> Self {
        // The hint pattern never compiles to a useful regex; it rides along
        // as an inert spec with an empty feedtype.
        let pattern = Pattern {
            source: format!("SIG={}", sig),
            regex: Regex::new("^\\z").expect("static pattern"),
        };
        self.specs.push(ClassSpec {
            feedtype: NONE,
            patterns: vec![pattern],
        });
        self
    }

    /// Returns `true` iff `info` falls in the time window and some spec
    /// matches both feedtype and identifier.
    pub fn matches(&self, info: &ProductInfo) -> bool {
        if info.arrival < self.from || info.arrival > self.to {
            return false;
        }
        self.specs.iter().any(|spec| spec.matches(info))
    }

    /// Returns `true` if no product can ever match.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Class intersection. The time window is the overlap; the spec list is
    /// the cross product of spec pairs whose feedtypes overlap, each carrying
    /// the conjunction of both sides' patterns.
    pub fn intersect(&self, other: &ProductClass) -> ProductClass {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        let mut specs = vec![];
        for a in &self.specs {
            for b in &other.specs {
                let feedtype = a.feedtype & b.feedtype;
                if feedtype.is_none() {
                    continue;
                }
                let mut patterns = a.patterns.clone();
                for p in &b.patterns {
                    if !patterns.contains(p) {
                        patterns.push(p.clone());
                    }
                }
                specs.push(ClassSpec { feedtype, patterns });
            }
        }
        ProductClass { from, to, specs }.canonical()
    }
}

impl fmt::Display for ProductClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{} [", self.from, self.to)?;
        write!(f, "{}", self.specs.iter().join(", "))?;
        write!(f, "]")
    }
}
