//! Feedtype sets and the named-feedtype registry.
//!
//! A feedtype is a subset of a fixed 32-bit universe of data categories. Most
//! feedtypes are *masks*: plain unions of primitive bits (`DDPLUS = PPS|DDS`).
//! A *value* feedtype is a named composite identified by the unordered set of
//! leaf entries it contains plus an optional mask part; set operations on
//! values are closed only when the registry holds a name for the result.
//!
//! The registry maps names to entries and entries back to names. Both
//! directions must agree; registering a name twice fails with
//! [`FeedtypeError::NameDefined`], while re-registering a *value* with
//! `overwrite = true` redirects the value-to-name direction to the newer name.

mod parse;
mod table;

pub use self::parse::parse_feedtype;
pub use self::table::builtin_table;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use thiserror::Error;

/// A 32-bit feedtype mask.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Feedtype(pub u32);

/// The empty feedtype.
pub const NONE: Feedtype = Feedtype(0);
/// The full universe.
pub const ANY: Feedtype = Feedtype(u32::MAX);

impl Feedtype {
    /// Returns `true` if no bits are set.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if `self` and `other` share at least one bit.
    pub fn intersects(&self, other: Feedtype) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Feedtype {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Feedtype(self.0 | rhs.0)
    }
}

impl BitAnd for Feedtype {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Feedtype(self.0 & rhs.0)
    }
}

impl Not for Feedtype {
    type Output = Self;

    fn not(self) -> Self {
        Feedtype(!self.0)
    }
}

/// Identifier of a registered value entry.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueId(usize);

/// A feedtype operand: either an anonymous mask or a registered value entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedSpec {
    Mask(Feedtype),
    Value(ValueId),
}

impl FeedSpec {
    pub fn is_none(&self) -> bool {
        matches!(self, FeedSpec::Mask(ft) if ft.is_none())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeedtypeError {
    #[error("feedtype name already defined: {0}")]
    NameDefined(String),

    #[error("no entry named {0}")]
    UnknownName(String),

    #[error("no name exists for the result of this operation")]
    NoSuchEntry,

    #[error("bit index out of range: {0}")]
    BadBit(u8),

    #[error("bit {0} already named {1}")]
    BitDefined(u8, String),

    #[error("not a pure union of primitive bits: {0:#010x}")]
    NotAMask(u32),

    #[error("invalid feedtype expression: {0}")]
    BadExpression(String),
}

#[derive(Clone, Debug)]
enum Entry {
    Bit(u8),
    Mask(Feedtype),
    Value(ValueId),
}

#[derive(Clone, Debug)]
struct ValueEntry {
    name: String,
    leaves: BTreeSet<ValueId>,
    mask: Feedtype,
}

/// Composite key a value entry is identified by: its unordered leaf set plus
/// its mask part.
type ValueKey = (Vec<ValueId>, Feedtype);

/// Registry of named feedtypes.
///
/// Bit and mask entries resolve to plain [`Feedtype`] masks; value entries
/// resolve to [`ValueId`]s into an internal arena. The `(leaf-set, mask)`
/// composite lookup is an ordered-map lookup.
#[derive(Default)]
pub struct FeedtypeTable {
    by_name: BTreeMap<String, Entry>,
    bit_names: [Option<String>; 32],
    mask_names: BTreeMap<Feedtype, String>,
    values: Vec<ValueEntry>,
    value_keys: BTreeMap<ValueKey, ValueId>,
    primitive_or: Feedtype,
}

impl FeedtypeTable {
    pub fn new() -> Self {
        FeedtypeTable::default()
    }

    /// Registers a primitive bit entry. The bit and the name must both be new.
    pub fn add_bit(&mut self, name: &str, bit: u8) -> Result<Feedtype, FeedtypeError> {
        if bit > 31 {
            return Err(FeedtypeError::BadBit(bit));
        }
        if let Some(existing) = &self.bit_names[bit as usize] {
            return Err(FeedtypeError::BitDefined(bit, existing.clone()));
        }
        if self.by_name.contains_key(name) {
            return Err(FeedtypeError::NameDefined(name.to_string()));
        }
        let ft = Feedtype(1 << bit);
        self.bit_names[bit as usize] = Some(name.to_string());
        self.by_name.insert(name.to_string(), Entry::Bit(bit));
        self.mask_names.entry(ft).or_insert_with(|| name.to_string());
        self.primitive_or = self.primitive_or | ft;
        Ok(ft)
    }

    /// Registers a named mask: a pure union of already-registered bits.
    pub fn add_mask(
        &mut self,
        name: &str,
        mask: Feedtype,
        overwrite: bool,
    ) -> Result<(), FeedtypeError> {
        if !(mask & !self.primitive_or).is_none() {
            return Err(FeedtypeError::NotAMask(mask.0));
        }
        if self.by_name.contains_key(name) {
            return Err(FeedtypeError::NameDefined(name.to_string()));
        }
        self.by_name.insert(name.to_string(), Entry::Mask(mask));
        if overwrite || !self.mask_names.contains_key(&mask) {
            self.mask_names.insert(mask, name.to_string());
        }
        Ok(())
    }

    /// Registers a value entry: an unordered set of leaf entries plus a mask
    /// part. The `(leaves, mask)` pair identifies the value; `overwrite`
    /// controls which name wins the value-to-name direction on collision.
    pub fn add_value(
        &mut self,
        name: &str,
        leaves: BTreeSet<ValueId>,
        mask: Feedtype,
        overwrite: bool,
    ) -> Result<ValueId, FeedtypeError> {
        if self.by_name.contains_key(name) {
            return Err(FeedtypeError::NameDefined(name.to_string()));
        }
        let id = ValueId(self.values.len());
        self.values.push(ValueEntry {
            name: name.to_string(),
            leaves: leaves.clone(),
            mask,
        });
        self.by_name.insert(name.to_string(), Entry::Value(id));
        let key = (leaves.iter().copied().collect::<Vec<_>>(), mask);
        if overwrite || !self.value_keys.contains_key(&key) {
            self.value_keys.insert(key, id);
        }
        Ok(id)
    }

    /// Resolves a name to an operand.
    pub fn lookup(&self, name: &str) -> Result<FeedSpec, FeedtypeError> {
        match self.by_name.get(name) {
            Some(Entry::Bit(bit)) => Ok(FeedSpec::Mask(Feedtype(1 << bit))),
            Some(Entry::Mask(mask)) => Ok(FeedSpec::Mask(*mask)),
            Some(Entry::Value(id)) => Ok(FeedSpec::Value(*id)),
            None => Err(FeedtypeError::UnknownName(name.to_string())),
        }
    }

    /// Resolves a name to a plain mask. Value entries resolve to their mask
    /// part or'd with their leaves' masks.
    pub fn mask_of(&self, spec: &FeedSpec) -> Feedtype {
        match spec {
            FeedSpec::Mask(ft) => *ft,
            FeedSpec::Value(id) => self.value_mask(*id),
        }
    }

    fn value_mask(&self, id: ValueId) -> Feedtype {
        let entry = &self.values[id.0];
        entry
            .leaves
            .iter()
            .fold(entry.mask, |acc, leaf| acc | self.value_mask(*leaf))
    }

    /// The registered name of an operand, if one exists.
    pub fn name_of(&self, spec: &FeedSpec) -> Option<&str> {
        match spec {
            FeedSpec::Mask(ft) => self.mask_names.get(ft).map(String::as_str),
            FeedSpec::Value(id) => Some(self.values[id.0].name.as_str()),
        }
    }

    fn lookup_value_key(&self, leaves: &BTreeSet<ValueId>, mask: Feedtype) -> Option<ValueId> {
        let key = (leaves.iter().copied().collect::<Vec<_>>(), mask);
        self.value_keys.get(&key).copied()
    }

    /// Flattens an operand to `(leaf set, mask part)`. A plain mask has no
    /// leaves.
    fn parts(&self, spec: &FeedSpec) -> (BTreeSet<ValueId>, Feedtype) {
        match spec {
            FeedSpec::Mask(ft) => (BTreeSet::new(), *ft),
            FeedSpec::Value(id) => {
                let entry = &self.values[id.0];
                (entry.leaves.clone(), entry.mask)
            }
        }
    }

    /// Set union. Mask|mask needs no name; any union involving a value entry
    /// must resolve to a registered `(leaves, mask)` key.
    pub fn union(&self, a: &FeedSpec, b: &FeedSpec) -> Result<FeedSpec, FeedtypeError> {
        match (a, b) {
            (FeedSpec::Mask(fa), FeedSpec::Mask(fb)) => Ok(FeedSpec::Mask(*fa | *fb)),
            _ => {
                let (la, ma) = self.parts(a);
                let (lb, mb) = self.parts(b);
                let leaves: BTreeSet<ValueId> = la.union(&lb).copied().collect();
                self.lookup_value_key(&leaves, ma | mb)
                    .map(FeedSpec::Value)
                    .ok_or(FeedtypeError::NoSuchEntry)
            }
        }
    }

    /// Set intersection. Identical value entries intersect to themselves;
    /// otherwise the smaller side's leaves are filtered through the larger
    /// side's leaf set and the result is looked up by key. An empty result is
    /// `NONE`, which needs no name.
    pub fn intersect(&self, a: &FeedSpec, b: &FeedSpec) -> Result<FeedSpec, FeedtypeError> {
        match (a, b) {
            (FeedSpec::Mask(fa), FeedSpec::Mask(fb)) => Ok(FeedSpec::Mask(*fa & *fb)),
            (FeedSpec::Value(ia), FeedSpec::Value(ib)) if ia == ib => Ok(a.clone()),
            _ => {
                let (la, ma) = self.parts(a);
                let (lb, mb) = self.parts(b);
                let (small, large) = if la.len() <= lb.len() {
                    (&la, &lb)
                } else {
                    (&lb, &la)
                };
                let leaves: BTreeSet<ValueId> =
                    small.iter().filter(|id| large.contains(id)).copied().collect();
                let mask = ma & mb;
                if leaves.is_empty() {
                    return Ok(FeedSpec::Mask(mask));
                }
                self.lookup_value_key(&leaves, mask)
                    .map(FeedSpec::Value)
                    .ok_or(FeedtypeError::NoSuchEntry)
            }
        }
    }

    /// Set difference, on the leaf-set representation.
    pub fn difference(&self, a: &FeedSpec, b: &FeedSpec) -> Result<FeedSpec, FeedtypeError> {
        match (a, b) {
            (FeedSpec::Mask(fa), FeedSpec::Mask(fb)) => Ok(FeedSpec::Mask(*fa & !*fb)),
            (FeedSpec::Value(ia), FeedSpec::Value(ib)) if ia == ib => Ok(FeedSpec::Mask(NONE)),
            _ => {
                let (la, ma) = self.parts(a);
                let (lb, mb) = self.parts(b);
                let leaves: BTreeSet<ValueId> =
                    la.iter().filter(|id| !lb.contains(id)).copied().collect();
                let mask = ma & !mb;
                if leaves.is_empty() {
                    return Ok(FeedSpec::Mask(mask));
                }
                self.lookup_value_key(&leaves, mask)
                    .map(FeedSpec::Value)
                    .ok_or(FeedtypeError::NoSuchEntry)
            }
        }
    }

    /// Returns `true` iff `general` and `particular` overlap.
    pub fn mask_match(&self, general: &FeedSpec, particular: &FeedSpec) -> bool {
        match self.intersect(general, particular) {
            Ok(result) => !result.is_none(),
            // An unnamed non-empty intersection still overlaps.
            Err(FeedtypeError::NoSuchEntry) => true,
            Err(_) => false,
        }
    }

    /// Renders a mask as a `|`-joined expression of registered names, longest
    /// masks first. Unnamed residue renders as hex.
    pub fn format(&self, ft: Feedtype) -> String {
        if ft.is_none() {
            return "NONE".to_string();
        }
        if let Some(name) = self.mask_names.get(&ft) {
            return name.clone();
        }
        let mut residue = ft;
        let mut parts = vec![];
        // Widest named masks first, so DDPLUS wins over PPS|DDS.
        let mut named: Vec<(&Feedtype, &String)> = self.mask_names.iter().collect();
        named.sort_by_key(|(mask, _)| std::cmp::Reverse(mask.0.count_ones()));
        for (mask, name) in named {
            if mask.is_none() || mask.0 == u32::MAX {
                continue;
            }
            if (residue & *mask) == *mask {
                parts.push(name.clone());
                residue = residue & !*mask;
                if residue.is_none() {
                    break;
                }
            }
        }
        if !residue.is_none() {
            parts.push(format!("{:#010x}", residue.0));
        }
        parts.join("|")
    }
}

impl fmt::Debug for FeedtypeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedtypeTable")
            .field("names", &self.by_name.len())
            .field("values", &self.values.len())
            .finish()
    }
}
