#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A domain-level key identifying a logical row or column.
///
/// Keys are totally ordered (variant order first, then payload) and may be
/// hierarchical: a `Tuple` key has one component per level. Nested tuples
/// flatten structurally, so `(a, (b, c))` and `(a, b, c)` expose the same
/// three levels through [`Key::levels`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Key {
    Int64(i64),
    Utf8(String),
    Tuple(Vec<Key>),
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Tuple(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn collect_levels<'a>(key: &'a Key, out: &mut Vec<&'a Key>) {
    match key {
        Key::Tuple(parts) => {
            for part in parts {
                collect_levels(part, out);
            }
        }
        scalar => out.push(scalar),
    }
}

impl Key {
    #[must_use]
    pub fn tuple(parts: Vec<Key>) -> Self {
        Self::Tuple(parts)
    }

    /// Flattened scalar components of this key, left to right.
    ///
    /// Scalars yield themselves; tuples recurse, so nesting shape does not
    /// affect the level sequence.
    #[must_use]
    pub fn levels(&self) -> Vec<&Key> {
        let mut out = Vec::new();
        collect_levels(self, &mut out);
        out
    }

    /// Number of flattened levels (1 for scalar keys).
    #[must_use]
    pub fn arity(&self) -> usize {
        match self {
            Self::Tuple(parts) => parts.iter().map(Key::arity).sum(),
            _ => 1,
        }
    }
}

/// Dense zero-based physical offset into a backing store.
///
/// Addresses are an implementation detail of one index instance; two index
/// instances never share an address space. A missing address is
/// `Option<Address>`, never a sentinel value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Address(usize);

impl Address {
    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for Address {
    fn from(offset: usize) -> Self {
        Self(offset)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Policy for resolving a key that is not exactly present.
///
/// `ExactOrGreater` and `ExactOrSmaller` are the "nearest" kinds exposed to
/// callers; `Greater` and `Smaller` are the strict directional kinds used
/// internally by range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup {
    Exact,
    /// Strictly greater than the probe key.
    Greater,
    /// Strictly smaller than the probe key.
    Smaller,
    /// The probe key itself when present, otherwise the nearest greater key.
    ExactOrGreater,
    /// The probe key itself when present, otherwise the nearest smaller key.
    ExactOrSmaller,
}

impl Lookup {
    /// True for the kinds that scan forward (toward greater keys).
    #[must_use]
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Greater | Self::ExactOrGreater)
    }

    /// True for the kinds that scan backward (toward smaller keys).
    #[must_use]
    pub fn is_backward(self) -> bool {
        matches!(self, Self::Smaller | Self::ExactOrSmaller)
    }
}

/// Which end of a sequence carries the incomplete window or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryEnd {
    AtBeginning,
    AtEnding,
}

/// Boundary policy for windowing and chunking.
///
/// The `end` picks where the incomplete segment lives (which also controls
/// chunk alignment: `AtBeginning` aligns chunks from the ending so the
/// leftover is first). When `skip` is set the incomplete segment is
/// suppressed instead of emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    pub end: BoundaryEnd,
    pub skip: bool,
}

impl Boundary {
    pub const AT_BEGINNING: Self = Self {
        end: BoundaryEnd::AtBeginning,
        skip: false,
    };
    pub const AT_ENDING: Self = Self {
        end: BoundaryEnd::AtEnding,
        skip: false,
    };
    pub const SKIP_AT_BEGINNING: Self = Self {
        end: BoundaryEnd::AtBeginning,
        skip: true,
    };
    pub const SKIP_AT_ENDING: Self = Self {
        end: BoundaryEnd::AtEnding,
        skip: true,
    };
}

/// Partial specification of a hierarchical key: one slot per level, where
/// `Some(key)` pins the level to an exact value and `None` is a hole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTemplate {
    slots: Vec<Option<Key>>,
}

impl KeyTemplate {
    #[must_use]
    pub fn new(slots: Vec<Option<Key>>) -> Self {
        Self { slots }
    }

    /// Template with only position `pinned_at` fixed out of `arity` levels.
    #[must_use]
    pub fn pin_one(arity: usize, pinned_at: usize, value: Key) -> Self {
        let mut slots = vec![None; arity];
        if pinned_at < arity {
            slots[pinned_at] = Some(value);
        }
        Self { slots }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slots(&self) -> &[Option<Key>] {
        &self.slots
    }

    #[must_use]
    pub fn is_fully_pinned(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Positions of the holes, in order.
    #[must_use]
    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect()
    }

    /// True iff the key's flattened levels equal this template's arity and
    /// every pinned slot equals the corresponding level. Holes always match.
    #[must_use]
    pub fn matches(&self, key: &Key) -> bool {
        let levels = key.levels();
        if levels.len() != self.slots.len() {
            return false;
        }
        self.slots
            .iter()
            .zip(levels)
            .all(|(slot, level)| match slot {
                Some(pinned) => pinned == level,
                None => true,
            })
    }

    /// The key with pinned levels removed. A single remaining level unwraps
    /// to a scalar key; with no holes the key is returned whole.
    #[must_use]
    pub fn strip_pinned(&self, key: &Key) -> Key {
        if self.is_fully_pinned() {
            return key.clone();
        }
        let levels = key.levels();
        let mut kept: Vec<Key> = self
            .slots
            .iter()
            .zip(levels)
            .filter_map(|(slot, level)| slot.is_none().then(|| level.clone()))
            .collect();
        if kept.len() == 1 {
            kept.pop().unwrap_or(Key::Tuple(Vec::new()))
        } else {
            Key::Tuple(kept)
        }
    }
}

/// Positional binary search over `[0, len)` with a caller-supplied probe.
///
/// `probe(i)` compares position `i` against the target: `Less` means the
/// target is after `i`, `Greater` means before. Returns `Ok(position)` on an
/// exact hit and `Err(insertion_point)` otherwise, like
/// `slice::binary_search_by`. Shared by the ranges and index crates so the
/// nearest-match scans sit on one search routine.
pub fn binary_search_by(len: usize, probe: impl Fn(usize) -> Ordering) -> Result<usize, usize> {
    let mut lo = 0_usize;
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match probe(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

#[cfg(test)]
mod tests {
    use super::{binary_search_by, Address, Boundary, BoundaryEnd, Key, KeyTemplate, Lookup};

    #[test]
    fn scalar_key_has_one_level() {
        let key = Key::from(42);
        assert_eq!(key.arity(), 1);
        assert_eq!(key.levels(), vec![&Key::Int64(42)]);
    }

    #[test]
    fn nested_tuple_flattens_like_flat_tuple() {
        let flat = Key::tuple(vec!["a".into(), "hi".into(), 1.into()]);
        let nested = Key::tuple(vec![
            "a".into(),
            Key::tuple(vec!["hi".into(), 1.into()]),
        ]);
        assert_eq!(flat.arity(), 3);
        assert_eq!(nested.arity(), 3);
        assert_eq!(flat.levels(), nested.levels());
    }

    #[test]
    fn key_ordering_is_total() {
        let mut keys = vec![Key::from("b"), Key::from(2), Key::from("a"), Key::from(1)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::from(1), Key::from(2), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn address_round_trips_through_usize() {
        let addr = Address::new(17);
        assert_eq!(addr.as_usize(), 17);
        assert_eq!(Address::from(17_usize), addr);
    }

    #[test]
    fn lookup_direction_flags() {
        assert!(Lookup::Greater.is_forward());
        assert!(Lookup::ExactOrGreater.is_forward());
        assert!(Lookup::Smaller.is_backward());
        assert!(Lookup::ExactOrSmaller.is_backward());
        assert!(!Lookup::Exact.is_forward());
        assert!(!Lookup::Exact.is_backward());
    }

    #[test]
    fn boundary_consts_combine_end_and_skip() {
        assert_eq!(Boundary::SKIP_AT_BEGINNING.end, BoundaryEnd::AtBeginning);
        assert!(Boundary::SKIP_AT_BEGINNING.skip);
        assert!(!Boundary::AT_ENDING.skip);
    }

    #[test]
    fn template_matches_pinned_level() {
        let key = Key::tuple(vec!["a".into(), "hi".into(), 1.into()]);
        let template = KeyTemplate::pin_one(3, 1, "hi".into());
        assert!(template.matches(&key));

        let miss = KeyTemplate::pin_one(3, 1, "bye".into());
        assert!(!miss.matches(&key));
    }

    #[test]
    fn template_matches_nested_and_flat_identically() {
        let flat = Key::tuple(vec!["a".into(), "hi".into(), 1.into()]);
        let nested = Key::tuple(vec![
            "a".into(),
            Key::tuple(vec!["hi".into(), 1.into()]),
        ]);
        for pos in 0..3 {
            let value = flat.levels()[pos].clone();
            let template = KeyTemplate::pin_one(3, pos, value);
            assert!(template.matches(&flat), "flat, slot {pos}");
            assert!(template.matches(&nested), "nested, slot {pos}");
        }
        let wrong = KeyTemplate::pin_one(3, 0, "z".into());
        assert!(!wrong.matches(&flat));
        assert!(!wrong.matches(&nested));
    }

    #[test]
    fn template_arity_mismatch_never_matches() {
        let template = KeyTemplate::pin_one(2, 0, "a".into());
        let three_level = Key::tuple(vec!["a".into(), "b".into(), "c".into()]);
        assert!(!template.matches(&three_level));
        assert!(!template.matches(&Key::from("a")));
    }

    #[test]
    fn strip_pinned_unwraps_single_remaining_level() {
        let key = Key::tuple(vec!["us".into(), 2024.into()]);
        let template = KeyTemplate::pin_one(2, 0, "us".into());
        assert_eq!(template.strip_pinned(&key), Key::Int64(2024));
    }

    #[test]
    fn strip_pinned_keeps_tuple_when_multiple_holes_remain() {
        let key = Key::tuple(vec!["us".into(), 2024.into(), "q1".into()]);
        let template = KeyTemplate::pin_one(3, 1, 2024.into());
        assert_eq!(
            template.strip_pinned(&key),
            Key::tuple(vec!["us".into(), "q1".into()])
        );
    }

    #[test]
    fn fully_pinned_template_keeps_key_whole() {
        let key = Key::tuple(vec!["us".into(), 2024.into()]);
        let template = KeyTemplate::new(vec![Some("us".into()), Some(2024.into())]);
        assert!(template.is_fully_pinned());
        assert_eq!(template.strip_pinned(&key), key);
    }

    #[test]
    fn free_slots_lists_holes_in_order() {
        let template = KeyTemplate::new(vec![None, Some(1.into()), None]);
        assert_eq!(template.free_slots(), vec![0, 2]);
    }

    #[test]
    fn binary_search_finds_and_inserts() {
        let values = [10, 20, 30, 40];
        let probe = |i: usize| values[i].cmp(&30);
        assert_eq!(binary_search_by(values.len(), probe), Ok(2));

        let probe = |i: usize| values[i].cmp(&25);
        assert_eq!(binary_search_by(values.len(), probe), Err(2));

        let probe = |i: usize| values[i].cmp(&5);
        assert_eq!(binary_search_by(values.len(), probe), Err(0));

        let probe = |i: usize| values[i].cmp(&99);
        assert_eq!(binary_search_by(values.len(), probe), Err(4));
    }

    #[test]
    fn binary_search_empty_input() {
        assert_eq!(
            binary_search_by(0, |_| std::cmp::Ordering::Equal),
            Err(0)
        );
    }
}
