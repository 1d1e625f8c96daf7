#![forbid(unsafe_code)]

use std::cell::OnceCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_ranges::{Ranges, RangesError};
use vx_types::{binary_search_by, Address, Key, Lookup};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("{semantics:?} lookup requires an ordered index")]
    UnorderedLookup { semantics: Lookup },
    #[error(transparent)]
    Ranges(#[from] RangesError),
}

/// The two closed index backends.
///
/// `Linear` stores explicit keys in address order. `Virtual` describes its
/// keys through a `Ranges` value and never materializes them eagerly; it is
/// always ordered and unique by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Backend {
    Linear { keys: Vec<Key> },
    Virtual { ranges: Ranges },
}

/// Maps domain keys to dense zero-based addresses.
///
/// The address space is 0-based and contiguous per instance; two instances
/// never share address spaces. Sortedness and duplicate facts are detected
/// lazily and cached (`OnceCell`), and cache state never affects equality.
/// Every operation that "changes" an index returns a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    backend: Backend,
    #[serde(skip)]
    ordered_cache: OnceCell<bool>,
    #[serde(skip)]
    duplicate_cache: OnceCell<bool>,
    #[serde(skip)]
    position_cache: OnceCell<HashMap<Key, usize>>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.backend == other.backend
    }
}

fn detect_ordered(keys: &[Key]) -> bool {
    keys.windows(2).all(|w| w[0] < w[1])
}

fn detect_duplicates(keys: &[Key]) -> bool {
    let mut seen = HashMap::<&Key, ()>::new();
    keys.iter().any(|key| seen.insert(key, ()).is_some())
}

impl Index {
    /// Builds an index from an explicit key sequence.
    ///
    /// `ordered_hint` short-circuits sortedness detection: `Some(true)`
    /// asserts the keys are strictly ascending without re-verifying (a wrong
    /// assertion makes subsequent binary-search lookups unspecified),
    /// `Some(false)` forces the unordered paths, `None` detects lazily.
    #[must_use]
    pub fn from_keys(keys: Vec<Key>, ordered_hint: Option<bool>) -> Self {
        let ordered_cache = OnceCell::new();
        if let Some(hint) = ordered_hint {
            let _ = ordered_cache.set(hint);
        }
        Self {
            backend: Backend::Linear { keys },
            ordered_cache,
            duplicate_cache: OnceCell::new(),
            position_cache: OnceCell::new(),
        }
    }

    /// Builds a virtual index over a `Ranges` key description.
    #[must_use]
    pub fn from_ranges(ranges: Ranges) -> Self {
        Self {
            backend: Backend::Virtual { ranges },
            ordered_cache: OnceCell::new(),
            duplicate_cache: OnceCell::new(),
            position_cache: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self::from_keys(values.into_iter().map(Key::from).collect(), None)
    }

    #[must_use]
    pub fn from_utf8(values: Vec<String>) -> Self {
        Self::from_keys(values.into_iter().map(Key::from).collect(), None)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Linear { keys } => keys.len(),
            Backend::Virtual { ranges } => ranges.size(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self.backend, Backend::Virtual { .. })
    }

    /// The `Ranges` behind a virtual index, if any.
    #[must_use]
    pub fn ranges(&self) -> Option<&Ranges> {
        match &self.backend {
            Backend::Linear { .. } => None,
            Backend::Virtual { ranges } => Some(ranges),
        }
    }

    /// Keys in address order. Virtual indexes produce keys lazily.
    pub fn keys(&self) -> Box<dyn Iterator<Item = Key> + '_> {
        match &self.backend {
            Backend::Linear { keys } => Box::new(keys.iter().cloned()),
            Backend::Virtual { ranges } => Box::new(ranges.keys().map(Key::Int64)),
        }
    }

    #[must_use]
    pub fn key_at(&self, address: Address) -> Option<Key> {
        match &self.backend {
            Backend::Linear { keys } => keys.get(address.as_usize()).cloned(),
            Backend::Virtual { ranges } => ranges.key_of_address(address).map(Key::Int64),
        }
    }

    /// First and last key by address. Meaningful as a key span only for
    /// ordered indexes.
    #[must_use]
    pub fn key_range(&self) -> Option<(Key, Key)> {
        if self.is_empty() {
            return None;
        }
        let first = self.key_at(Address::new(0))?;
        let last = self.key_at(Address::new(self.len() - 1))?;
        Some((first, last))
    }

    /// True when keys are strictly ascending (which also implies unique).
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        match &self.backend {
            Backend::Linear { keys } => {
                *self.ordered_cache.get_or_init(|| detect_ordered(keys))
            }
            Backend::Virtual { .. } => true,
        }
    }

    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        match &self.backend {
            Backend::Linear { keys } => {
                *self.duplicate_cache.get_or_init(|| detect_duplicates(keys))
            }
            Backend::Virtual { .. } => false,
        }
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        !self.has_duplicates()
    }

    fn position_map(&self, keys: &[Key]) -> &HashMap<Key, usize> {
        self.position_cache.get_or_init(|| {
            let mut positions = HashMap::with_capacity(keys.len());
            for (position, key) in keys.iter().enumerate() {
                positions.entry(key.clone()).or_insert(position);
            }
            positions
        })
    }

    /// Binary search position for `key` in an ordered linear backend.
    fn search_ordered(keys: &[Key], key: &Key) -> Result<usize, usize> {
        binary_search_by(keys.len(), |i| keys[i].cmp(key))
    }

    /// Exact lookup: first-occurrence address of `key`.
    ///
    /// Ordered linear backends binary-search; unordered ones consult a
    /// lazily-built first-occurrence map; virtual backends translate through
    /// their ranges.
    #[must_use]
    pub fn locate(&self, key: &Key) -> Option<Address> {
        match &self.backend {
            Backend::Linear { keys } => {
                if self.is_ordered() {
                    Self::search_ordered(keys, key).ok().map(Address::new)
                } else {
                    self.position_map(keys).get(key).copied().map(Address::new)
                }
            }
            Backend::Virtual { ranges } => match key {
                Key::Int64(k) => ranges.address_of_key(*k).ok(),
                _ => None,
            },
        }
    }

    /// Lookup with directional fallback.
    ///
    /// `Exact` works on any index. The directional kinds require an ordered
    /// index and fail with `UnorderedLookup` otherwise; on an ordered index
    /// they share the `Ranges` semantics: gap keys resolve toward the scan
    /// direction, `ExactOr*` clamp to the first/last address when the key is
    /// outside the covered span on the approachable side, and the `check`
    /// predicate is consulted for every candidate address until it succeeds
    /// or the boundary is exceeded. A miss is `Ok(None)`, never an error.
    pub fn lookup(
        &self,
        key: &Key,
        semantics: Lookup,
        check: impl Fn(Address) -> bool,
    ) -> Result<Option<(Key, Address)>, IndexError> {
        if let Lookup::Exact = semantics {
            let found = self
                .locate(key)
                .filter(|address| check(*address))
                .map(|address| (key.clone(), address));
            return Ok(found);
        }
        if !self.is_ordered() {
            return Err(IndexError::UnorderedLookup { semantics });
        }

        match &self.backend {
            Backend::Linear { keys } => Ok(Self::lookup_linear(keys, key, semantics, check)),
            Backend::Virtual { ranges } => {
                let probe = match key {
                    Key::Int64(k) => *k,
                    // Non-integer keys order after every integer key, so the
                    // forward kinds have nothing to find and the backward
                    // kinds degrade to a scan from the last address.
                    _ if semantics.is_forward() => return Ok(None),
                    _ => {
                        let found = ranges
                            .lookup(i64::MAX, Lookup::ExactOrSmaller, check)
                            .map(|(k, address)| (Key::Int64(k), address));
                        return Ok(found);
                    }
                };
                Ok(ranges
                    .lookup(probe, semantics, check)
                    .map(|(k, address)| (Key::Int64(k), address)))
            }
        }
    }

    fn lookup_linear(
        keys: &[Key],
        key: &Key,
        semantics: Lookup,
        check: impl Fn(Address) -> bool,
    ) -> Option<(Key, Address)> {
        if keys.is_empty() {
            return None;
        }
        let start = match (semantics, Self::search_ordered(keys, key)) {
            (Lookup::Greater, Ok(i)) => i + 1,
            (Lookup::Greater | Lookup::ExactOrGreater, Err(insertion)) => insertion,
            (Lookup::ExactOrGreater, Ok(i)) => i,
            (Lookup::Smaller, Ok(i)) => i.checked_sub(1)?,
            (Lookup::Smaller | Lookup::ExactOrSmaller, Err(insertion)) => {
                insertion.checked_sub(1)?
            }
            (Lookup::ExactOrSmaller, Ok(i)) => i,
            (Lookup::Exact, _) => unreachable!("exact handled by caller"),
        };
        if start >= keys.len() {
            return None;
        }

        let positions: Box<dyn Iterator<Item = usize>> = if semantics.is_forward() {
            Box::new(start..keys.len())
        } else {
            Box::new((0..=start).rev())
        };
        positions
            .map(Address::new)
            .find(|address| check(*address))
            .map(|address| (keys[address.as_usize()].clone(), address))
    }

    /// Contiguous sub-index covering `len` addresses from `start`.
    ///
    /// A virtual index stays virtual: the slice is expressed as a clipped
    /// `Ranges` rather than materialized keys.
    #[must_use]
    pub fn slice(&self, start: usize, len: usize) -> Index {
        match &self.backend {
            Backend::Linear { keys } => {
                let lo = start.min(keys.len());
                let hi = (start + len).min(keys.len());
                // An ordered whole guarantees an ordered slice; an unordered
                // whole says nothing about the slice, so re-detect lazily.
                let hint = match self.ordered_cache.get() {
                    Some(true) => Some(true),
                    _ => None,
                };
                Index::from_keys(keys[lo..hi].to_vec(), hint)
            }
            Backend::Virtual { ranges } => {
                if len == 0 || start >= ranges.size() {
                    return Index::from_ranges(Ranges::empty());
                }
                let end = (start + len - 1).min(ranges.size() - 1);
                let lo_key = ranges.key_of_address(Address::new(start));
                let hi_key = ranges.key_of_address(Address::new(end));
                match (lo_key, hi_key) {
                    (Some(lo), Some(hi)) => Index::from_ranges(ranges.restrict(lo, hi)),
                    _ => Index::from_ranges(Ranges::empty()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Index, IndexError};
    use vx_ranges::Ranges;
    use vx_types::{Address, Key, Lookup};

    const ALWAYS: fn(Address) -> bool = |_| true;

    #[test]
    fn ordered_detection_is_strict() {
        assert!(Index::from_i64(vec![1, 2, 3]).is_ordered());
        assert!(!Index::from_i64(vec![3, 1, 2]).is_ordered());
        assert!(!Index::from_i64(vec![1, 2, 2]).is_ordered());
        assert!(Index::from_i64(vec![]).is_ordered());
        assert!(Index::from_i64(vec![7]).is_ordered());
    }

    #[test]
    fn ordered_hint_skips_verification() {
        // The caller asserts sortedness; the flag reflects the assertion.
        let index = Index::from_keys(vec![3.into(), 1.into()], Some(true));
        assert!(index.is_ordered());

        let forced = Index::from_keys(vec![1.into(), 2.into()], Some(false));
        assert!(!forced.is_ordered());
    }

    #[test]
    fn duplicates_detected_on_linear_backend() {
        assert!(Index::from_i64(vec![1, 2, 1]).has_duplicates());
        assert!(Index::from_i64(vec![1, 2, 3]).is_unique());
    }

    #[test]
    fn locate_uses_binary_search_on_ordered_keys() {
        let index = Index::from_i64(vec![10, 20, 30, 40]);
        assert_eq!(index.locate(&20.into()), Some(Address::new(1)));
        assert_eq!(index.locate(&40.into()), Some(Address::new(3)));
        assert_eq!(index.locate(&25.into()), None);
    }

    #[test]
    fn locate_first_occurrence_on_unordered_keys() {
        let index = Index::from_i64(vec![30, 10, 30, 20]);
        assert_eq!(index.locate(&30.into()), Some(Address::new(0)));
        assert_eq!(index.locate(&20.into()), Some(Address::new(3)));
        assert_eq!(index.locate(&99.into()), None);
    }

    #[test]
    fn exact_lookup_works_on_unordered_index() {
        let index = Index::from_i64(vec![30, 10, 20]);
        let found = index.lookup(&10.into(), Lookup::Exact, ALWAYS).expect("exact is valid");
        assert_eq!(found, Some((Key::Int64(10), Address::new(1))));
    }

    #[test]
    fn directional_lookup_on_unordered_index_is_an_error() {
        let index = Index::from_i64(vec![30, 10, 20]);
        let err = index
            .lookup(&10.into(), Lookup::ExactOrGreater, ALWAYS)
            .unwrap_err();
        assert!(matches!(err, IndexError::UnorderedLookup { .. }));
    }

    #[test]
    fn directional_lookup_resolves_gaps() {
        let index = Index::from_i64(vec![10, 20, 30]);
        assert_eq!(
            index.lookup(&15.into(), Lookup::ExactOrGreater, ALWAYS).expect("ordered"),
            Some((Key::Int64(20), Address::new(1)))
        );
        assert_eq!(
            index.lookup(&15.into(), Lookup::ExactOrSmaller, ALWAYS).expect("ordered"),
            Some((Key::Int64(10), Address::new(0)))
        );
        assert_eq!(
            index.lookup(&20.into(), Lookup::Greater, ALWAYS).expect("ordered"),
            Some((Key::Int64(30), Address::new(2)))
        );
        assert_eq!(
            index.lookup(&20.into(), Lookup::Smaller, ALWAYS).expect("ordered"),
            Some((Key::Int64(10), Address::new(0)))
        );
    }

    #[test]
    fn directional_lookup_clamps_at_the_approachable_end() {
        let index = Index::from_i64(vec![10, 20, 30]);
        assert_eq!(
            index.lookup(&1.into(), Lookup::ExactOrGreater, ALWAYS).expect("ordered"),
            Some((Key::Int64(10), Address::new(0)))
        );
        assert_eq!(
            index.lookup(&1.into(), Lookup::ExactOrSmaller, ALWAYS).expect("ordered"),
            None
        );
        assert_eq!(
            index.lookup(&99.into(), Lookup::ExactOrSmaller, ALWAYS).expect("ordered"),
            Some((Key::Int64(30), Address::new(2)))
        );
        assert_eq!(
            index.lookup(&99.into(), Lookup::ExactOrGreater, ALWAYS).expect("ordered"),
            None
        );
    }

    #[test]
    fn lookup_predicate_scans_until_satisfied() {
        let index = Index::from_i64(vec![10, 20, 30, 40]);
        let found = index
            .lookup(&5.into(), Lookup::ExactOrGreater, |a| a.as_usize() >= 2)
            .expect("ordered");
        assert_eq!(found, Some((Key::Int64(30), Address::new(2))));

        let found = index
            .lookup(&99.into(), Lookup::ExactOrSmaller, |a| a.as_usize() <= 1)
            .expect("ordered");
        assert_eq!(found, Some((Key::Int64(20), Address::new(1))));

        let found = index
            .lookup(&5.into(), Lookup::ExactOrGreater, |_| false)
            .expect("ordered");
        assert_eq!(found, None);
    }

    #[test]
    fn utf8_keys_order_lexicographically() {
        let index = Index::from_utf8(vec!["apple".into(), "cherry".into()]);
        assert!(index.is_ordered());
        assert_eq!(
            index
                .lookup(&"banana".into(), Lookup::ExactOrGreater, ALWAYS)
                .expect("ordered"),
            Some((Key::from("cherry"), Address::new(1)))
        );
    }

    #[test]
    fn virtual_index_translates_through_ranges() {
        let ranges = Ranges::create(vec![(10, 19), (30, 39)]).expect("valid");
        let index = Index::from_ranges(ranges);
        assert!(index.is_virtual());
        assert!(index.is_ordered());
        assert!(index.is_unique());
        assert_eq!(index.len(), 20);
        assert_eq!(index.locate(&35.into()), Some(Address::new(15)));
        assert_eq!(index.locate(&25.into()), None);
        assert_eq!(index.key_at(Address::new(10)), Some(Key::Int64(30)));
        assert_eq!(
            index.key_range(),
            Some((Key::Int64(10), Key::Int64(39)))
        );
    }

    #[test]
    fn virtual_index_directional_lookup() {
        let ranges = Ranges::create(vec![(10, 19), (30, 39)]).expect("valid");
        let index = Index::from_ranges(ranges);
        assert_eq!(
            index.lookup(&25.into(), Lookup::ExactOrGreater, ALWAYS).expect("ordered"),
            Some((Key::Int64(30), Address::new(10)))
        );
        assert_eq!(
            index.lookup(&25.into(), Lookup::ExactOrSmaller, ALWAYS).expect("ordered"),
            Some((Key::Int64(19), Address::new(9)))
        );
    }

    #[test]
    fn virtual_index_non_integer_keys_sort_after_all_integers() {
        let ranges = Ranges::create(vec![(10, 19)]).expect("valid");
        let index = Index::from_ranges(ranges);
        assert_eq!(index.locate(&"a".into()), None);
        assert_eq!(
            index.lookup(&"a".into(), Lookup::ExactOrGreater, ALWAYS).expect("ordered"),
            None
        );
        assert_eq!(
            index.lookup(&"a".into(), Lookup::ExactOrSmaller, ALWAYS).expect("ordered"),
            Some((Key::Int64(19), Address::new(9)))
        );
    }

    #[test]
    fn keys_iterator_matches_key_at() {
        let index = Index::from_i64(vec![5, 1, 9]);
        let keys: Vec<Key> = index.keys().collect();
        assert_eq!(keys, vec![5.into(), 1.into(), 9.into()]);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(index.key_at(Address::new(i)).as_ref(), Some(key));
        }
    }

    #[test]
    fn slice_preserves_linear_keys() {
        let index = Index::from_i64(vec![10, 20, 30, 40, 50]);
        let sliced = index.slice(1, 3);
        assert_eq!(
            sliced.keys().collect::<Vec<_>>(),
            vec![20.into(), 30.into(), 40.into()]
        );
        assert_eq!(index.slice(4, 10).len(), 1);
        assert!(index.slice(9, 3).is_empty());
    }

    #[test]
    fn slice_of_virtual_index_stays_virtual() {
        let ranges = Ranges::create(vec![(10, 19), (30, 39)]).expect("valid");
        let index = Index::from_ranges(ranges);
        let sliced = index.slice(5, 10);
        assert!(sliced.is_virtual());
        assert_eq!(sliced.len(), 10);
        assert_eq!(
            sliced.keys().collect::<Vec<_>>(),
            (15..=19).chain(30..=34).map(Key::Int64).collect::<Vec<_>>()
        );
        assert!(index.slice(0, 0).is_empty());
    }

    #[test]
    fn equality_ignores_cache_state() {
        let warmed = Index::from_i64(vec![1, 2, 3]);
        assert!(warmed.is_ordered());
        let fresh = Index::from_i64(vec![1, 2, 3]);
        assert_eq!(warmed, fresh);
    }

    #[test]
    fn tuple_keys_participate_in_exact_lookup() {
        let keys = vec![
            Key::tuple(vec!["us".into(), 2023.into()]),
            Key::tuple(vec!["us".into(), 2024.into()]),
            Key::tuple(vec!["eu".into(), 2023.into()]),
        ];
        let index = Index::from_keys(keys.clone(), None);
        assert_eq!(index.locate(&keys[2]), Some(Address::new(2)));
        assert_eq!(
            index.locate(&Key::tuple(vec!["eu".into(), 2024.into()])),
            None
        );
    }
}
