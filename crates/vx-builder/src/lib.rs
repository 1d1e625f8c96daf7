#![forbid(unsafe_code)]

use std::collections::{BinaryHeap, HashMap};
use std::mem::size_of;

use bumpalo::{collections::Vec as BumpVec, Bump};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_index::{Index, IndexError};
use vx_types::{Address, Boundary, BoundaryEnd, Key, KeyTemplate, Lookup};
use vx_vector::{MergeRule, VectorCommand};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuilderError {
    #[error("append conflict: key {0} exists on both sides under the fail policy")]
    DuplicateKeyOnAppend(Key),
    #[error("{operation} requires an ordered index")]
    OrderedIndexRequired { operation: &'static str },
    #[error("resample target keys must be strictly ascending")]
    UnsortedTargets,
    #[error("window and chunk sizes must be at least 1")]
    InvalidSegmentSize,
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// How `append` treats a key present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// A shared key is an error: an appended index cannot hold duplicates.
    Fail,
    /// The left (first) occurrence wins.
    FirstWins,
    /// The right (last) occurrence wins.
    LastWins,
}

/// Windowing specification for `aggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Aggregation {
    /// Floating windows of the given size.
    WindowSize(usize, Boundary),
    /// Consecutive chunks of the given size.
    ChunkSize(usize, Boundary),
}

/// Which end of a resample chunk the target key bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The target key is the inclusive lower bound of its chunk.
    Forward,
    /// The target key is the inclusive upper bound of its chunk.
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Complete,
    Incomplete,
}

/// One window or chunk produced by `aggregate`, aligned with the address of
/// the same position in the returned index.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub command: VectorCommand,
}

/// New index plus one construction command. The command's source slot 0 is
/// the operation's (single or left) input vector; `append` additionally uses
/// slot 1 for the right input.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    pub index: Index,
    pub command: VectorCommand,
}

/// New index plus one command per side. Each command references its own
/// side's vector as source slot 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPlan {
    pub index: Index,
    pub left_command: VectorCommand,
    pub right_command: VectorCommand,
}

/// New index plus one command per input, in input order; each command
/// references its own input's vector as source slot 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiPlan {
    pub index: Index,
    pub commands: Vec<VectorCommand>,
}

/// One group produced by `group_by`, in first-seen group-key order.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: Key,
    pub index: Index,
    pub command: VectorCommand,
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Arena opt-out and byte budget for the hash-phase scratch of the set
/// combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

fn estimate_scratch_bytes(rows: usize) -> usize {
    rows.saturating_mul(size_of::<(Address, Address)>().saturating_mul(2))
}

fn relocation_command(new_len: usize, relocations: Vec<(Address, Address)>) -> VectorCommand {
    VectorCommand::relocate(VectorCommand::ret(0), new_len, relocations)
}

// ── Union ──────────────────────────────────────────────────────────────

/// Outer-join-style key union.
///
/// Ordered inputs merge in ascending key order; otherwise the result keeps
/// left order followed by right-only keys, resolving duplicates to first
/// occurrences. Every present key records its originating address in the
/// per-side relocation commands; absence is the missing marker.
#[must_use]
pub fn union(left: &Index, right: &Index) -> SetPlan {
    union_with_options(left, right, ExecutionOptions::default())
}

#[must_use]
pub fn union_with_options(left: &Index, right: &Index, options: ExecutionOptions) -> SetPlan {
    if left.is_ordered() && right.is_ordered() {
        return union_ordered(left, right);
    }
    let rows = left.len() + right.len();
    let use_arena =
        options.use_arena && estimate_scratch_bytes(rows) <= options.arena_budget_bytes;
    if use_arena {
        union_hashed_with_arena(left, right)
    } else {
        union_hashed_with_global_allocator(left, right)
    }
}

enum MergeStep {
    TakeLeft,
    TakeRight,
    TakeBoth,
}

fn union_ordered(left: &Index, right: &Index) -> SetPlan {
    let mut left_iter = left.keys().enumerate().peekable();
    let mut right_iter = right.keys().enumerate().peekable();

    let mut keys = Vec::with_capacity(left.len() + right.len());
    let mut left_pairs = Vec::with_capacity(left.len());
    let mut right_pairs = Vec::with_capacity(right.len());

    loop {
        let step = match (left_iter.peek(), right_iter.peek()) {
            (Some((_, lk)), Some((_, rk))) => match lk.cmp(rk) {
                std::cmp::Ordering::Less => MergeStep::TakeLeft,
                std::cmp::Ordering::Greater => MergeStep::TakeRight,
                std::cmp::Ordering::Equal => MergeStep::TakeBoth,
            },
            (Some(_), None) => MergeStep::TakeLeft,
            (None, Some(_)) => MergeStep::TakeRight,
            (None, None) => break,
        };
        let position = Address::new(keys.len());
        match step {
            MergeStep::TakeLeft => {
                if let Some((addr, key)) = left_iter.next() {
                    left_pairs.push((position, Address::new(addr)));
                    keys.push(key);
                }
            }
            MergeStep::TakeRight => {
                if let Some((addr, key)) = right_iter.next() {
                    right_pairs.push((position, Address::new(addr)));
                    keys.push(key);
                }
            }
            MergeStep::TakeBoth => {
                if let (Some((la, key)), Some((ra, _))) = (left_iter.next(), right_iter.next()) {
                    left_pairs.push((position, Address::new(la)));
                    right_pairs.push((position, Address::new(ra)));
                    keys.push(key);
                }
            }
        }
    }

    let new_len = keys.len();
    SetPlan {
        index: Index::from_keys(keys, Some(true)),
        left_command: relocation_command(new_len, left_pairs),
        right_command: relocation_command(new_len, right_pairs),
    }
}

fn union_keys(left_keys: &[Key], right_keys: &[Key]) -> Vec<Key> {
    let mut seen = HashMap::<&Key, ()>::new();
    let mut keys = Vec::with_capacity(left_keys.len() + right_keys.len());
    for key in left_keys.iter().chain(right_keys) {
        if seen.insert(key, ()).is_none() {
            keys.push(key.clone());
        }
    }
    keys
}

fn first_occurrence_map(keys: &[Key]) -> HashMap<&Key, usize> {
    let mut map = HashMap::with_capacity(keys.len());
    for (position, key) in keys.iter().enumerate() {
        map.entry(key).or_insert(position);
    }
    map
}

fn union_hashed_with_global_allocator(left: &Index, right: &Index) -> SetPlan {
    let left_keys: Vec<Key> = left.keys().collect();
    let right_keys: Vec<Key> = right.keys().collect();
    let keys = union_keys(&left_keys, &right_keys);
    let left_map = first_occurrence_map(&left_keys);
    let right_map = first_occurrence_map(&right_keys);

    let mut left_pairs = Vec::with_capacity(left_keys.len());
    let mut right_pairs = Vec::with_capacity(right_keys.len());
    for (position, key) in keys.iter().enumerate() {
        if let Some(&addr) = left_map.get(key) {
            left_pairs.push((Address::new(position), Address::new(addr)));
        }
        if let Some(&addr) = right_map.get(key) {
            right_pairs.push((Address::new(position), Address::new(addr)));
        }
    }

    let new_len = keys.len();
    SetPlan {
        index: Index::from_keys(keys, None),
        left_command: relocation_command(new_len, left_pairs),
        right_command: relocation_command(new_len, right_pairs),
    }
}

fn union_hashed_with_arena(left: &Index, right: &Index) -> SetPlan {
    let arena = Bump::new();
    let left_keys: Vec<Key> = left.keys().collect();
    let right_keys: Vec<Key> = right.keys().collect();
    let keys = union_keys(&left_keys, &right_keys);
    let left_map = first_occurrence_map(&left_keys);
    let right_map = first_occurrence_map(&right_keys);

    let mut left_pairs = BumpVec::with_capacity_in(left_keys.len(), &arena);
    let mut right_pairs = BumpVec::with_capacity_in(right_keys.len(), &arena);
    for (position, key) in keys.iter().enumerate() {
        if let Some(&addr) = left_map.get(key) {
            left_pairs.push((Address::new(position), Address::new(addr)));
        }
        if let Some(&addr) = right_map.get(key) {
            right_pairs.push((Address::new(position), Address::new(addr)));
        }
    }

    let new_len = keys.len();
    SetPlan {
        index: Index::from_keys(keys, None),
        left_command: relocation_command(new_len, left_pairs.to_vec()),
        right_command: relocation_command(new_len, right_pairs.to_vec()),
    }
}

// ── Intersect ──────────────────────────────────────────────────────────

/// Inner-join-style intersection: keys present in both sides, in left
/// relative order, duplicates resolved to first occurrences.
#[must_use]
pub fn intersect(left: &Index, right: &Index) -> SetPlan {
    intersect_with_options(left, right, ExecutionOptions::default())
}

#[must_use]
pub fn intersect_with_options(left: &Index, right: &Index, options: ExecutionOptions) -> SetPlan {
    let rows = left.len().min(right.len());
    let use_arena =
        options.use_arena && estimate_scratch_bytes(rows) <= options.arena_budget_bytes;
    if use_arena {
        intersect_with_arena(left, right)
    } else {
        intersect_with_global_allocator(left, right)
    }
}

fn intersect_with_global_allocator(left: &Index, right: &Index) -> SetPlan {
    let left_keys: Vec<Key> = left.keys().collect();
    let right_keys: Vec<Key> = right.keys().collect();
    let right_map = first_occurrence_map(&right_keys);

    let mut keys = Vec::new();
    let mut left_pairs = Vec::new();
    let mut right_pairs = Vec::new();
    let mut seen = HashMap::<&Key, ()>::new();
    for (left_addr, key) in left_keys.iter().enumerate() {
        if let Some(&right_addr) = right_map.get(key) {
            if seen.insert(key, ()).is_none() {
                let position = Address::new(keys.len());
                left_pairs.push((position, Address::new(left_addr)));
                right_pairs.push((position, Address::new(right_addr)));
                keys.push(key.clone());
            }
        }
    }

    let new_len = keys.len();
    SetPlan {
        index: Index::from_keys(keys, None),
        left_command: relocation_command(new_len, left_pairs),
        right_command: relocation_command(new_len, right_pairs),
    }
}

fn intersect_with_arena(left: &Index, right: &Index) -> SetPlan {
    let arena = Bump::new();
    let left_keys: Vec<Key> = left.keys().collect();
    let right_keys: Vec<Key> = right.keys().collect();
    let right_map = first_occurrence_map(&right_keys);

    let mut keys = Vec::new();
    let mut left_pairs = BumpVec::new_in(&arena);
    let mut right_pairs = BumpVec::new_in(&arena);
    let mut seen = HashMap::<&Key, ()>::new();
    for (left_addr, key) in left_keys.iter().enumerate() {
        if let Some(&right_addr) = right_map.get(key) {
            if seen.insert(key, ()).is_none() {
                let position = Address::new(keys.len());
                left_pairs.push((position, Address::new(left_addr)));
                right_pairs.push((position, Address::new(right_addr)));
                keys.push(key.clone());
            }
        }
    }

    let new_len = keys.len();
    SetPlan {
        index: Index::from_keys(keys, None),
        left_command: relocation_command(new_len, left_pairs.to_vec()),
        right_command: relocation_command(new_len, right_pairs.to_vec()),
    }
}

// ── Append ─────────────────────────────────────────────────────────────

/// Concatenates two key spaces.
///
/// Under `ConflictPolicy::Fail` any key present on both sides is an error.
/// `FirstWins`/`LastWins` produce left-then-new-right key order and a
/// `Combine` command (left vector = slot 0, right vector = slot 1) with the
/// matching merge rule.
pub fn append(
    left: &Index,
    right: &Index,
    policy: ConflictPolicy,
) -> Result<IndexPlan, BuilderError> {
    let left_keys: Vec<Key> = left.keys().collect();
    let right_keys: Vec<Key> = right.keys().collect();
    let left_map = first_occurrence_map(&left_keys);

    let merge = match policy {
        ConflictPolicy::Fail => {
            if let Some(key) = right_keys.iter().find(|key| left_map.contains_key(key)) {
                return Err(BuilderError::DuplicateKeyOnAppend(key.clone()));
            }
            let mut keys = left_keys;
            keys.extend(right_keys);
            return Ok(IndexPlan {
                index: Index::from_keys(keys, None),
                command: VectorCommand::append(VectorCommand::ret(0), VectorCommand::ret(1)),
            });
        }
        ConflictPolicy::FirstWins => MergeRule::PreferLeft,
        ConflictPolicy::LastWins => MergeRule::PreferRight,
    };

    // Overlapping keys collapse onto one output position; the merge rule
    // picks the surviving side.
    let keys = union_keys(&left_keys, &right_keys);
    let right_map = first_occurrence_map(&right_keys);
    let new_len = keys.len();

    let mut left_pairs = Vec::with_capacity(left_keys.len());
    let mut right_pairs = Vec::with_capacity(right_keys.len());
    for (position, key) in keys.iter().enumerate() {
        if let Some(&addr) = left_map.get(key) {
            left_pairs.push((Address::new(position), Address::new(addr)));
        }
        if let Some(&addr) = right_map.get(key) {
            right_pairs.push((Address::new(position), Address::new(addr)));
        }
    }

    Ok(IndexPlan {
        index: Index::from_keys(keys, None),
        command: VectorCommand::combine(
            VectorCommand::relocate(VectorCommand::ret(0), new_len, left_pairs),
            VectorCommand::relocate(VectorCommand::ret(1), new_len, right_pairs),
            merge,
        ),
    })
}

// ── Merge (n-ary union) ────────────────────────────────────────────────

/// N-ary key union with one relocation command per input.
///
/// All-ordered inputs k-way merge through a min-heap, producing an ascending
/// result; otherwise keys keep first-seen order across inputs.
#[must_use]
pub fn merge(inputs: &[&Index]) -> MultiPlan {
    if inputs.iter().all(|index| index.is_ordered()) {
        merge_ordered(inputs)
    } else {
        merge_hashed(inputs)
    }
}

fn merge_ordered(inputs: &[&Index]) -> MultiPlan {
    let keys_per_input: Vec<Vec<Key>> = inputs.iter().map(|index| index.keys().collect()).collect();

    // Min-heap of (key, input, address).
    let mut heap = BinaryHeap::new();
    for (input, keys) in keys_per_input.iter().enumerate() {
        if let Some(key) = keys.first() {
            heap.push(std::cmp::Reverse((key.clone(), input, 0_usize)));
        }
    }

    let total: usize = keys_per_input.iter().map(Vec::len).sum();
    let mut merged: Vec<Key> = Vec::with_capacity(total);
    let mut pairs: Vec<Vec<(Address, Address)>> = vec![Vec::new(); inputs.len()];

    while let Some(std::cmp::Reverse((key, input, addr))) = heap.pop() {
        if merged.last() != Some(&key) {
            merged.push(key);
        }
        pairs[input].push((Address::new(merged.len() - 1), Address::new(addr)));

        let next = addr + 1;
        if let Some(next_key) = keys_per_input[input].get(next) {
            heap.push(std::cmp::Reverse((next_key.clone(), input, next)));
        }
    }

    let new_len = merged.len();
    MultiPlan {
        index: Index::from_keys(merged, Some(true)),
        commands: pairs
            .into_iter()
            .map(|p| relocation_command(new_len, p))
            .collect(),
    }
}

fn merge_hashed(inputs: &[&Index]) -> MultiPlan {
    let keys_per_input: Vec<Vec<Key>> = inputs.iter().map(|index| index.keys().collect()).collect();

    let mut keys: Vec<Key> = Vec::new();
    let mut seen = HashMap::<Key, ()>::new();
    for input_keys in &keys_per_input {
        for key in input_keys {
            if seen.insert(key.clone(), ()).is_none() {
                keys.push(key.clone());
            }
        }
    }

    let new_len = keys.len();
    let commands = keys_per_input
        .iter()
        .map(|input_keys| {
            let map = first_occurrence_map(input_keys);
            let mut pairs = Vec::new();
            for (position, key) in keys.iter().enumerate() {
                if let Some(&addr) = map.get(key) {
                    pairs.push((Address::new(position), Address::new(addr)));
                }
            }
            relocation_command(new_len, pairs)
        })
        .collect();

    MultiPlan {
        index: Index::from_keys(keys, None),
        commands,
    }
}

// ── Reindex ────────────────────────────────────────────────────────────

/// Aligns `source` onto `target`'s keys.
///
/// For each target key, finds the corresponding source address under the
/// given lookup kind, leaving missing markers where the lookup misses. The
/// directional kinds require a sorted source index. This is the mechanism
/// behind join, item selection and realignment.
pub fn reindex(
    source: &Index,
    target: &Index,
    semantics: Lookup,
) -> Result<IndexPlan, BuilderError> {
    let mut pairs = Vec::with_capacity(target.len());
    for (position, key) in target.keys().enumerate() {
        let found = match semantics {
            Lookup::Exact => source.locate(&key),
            _ => source
                .lookup(&key, semantics, |_| true)?
                .map(|(_, address)| address),
        };
        if let Some(address) = found {
            pairs.push((Address::new(position), address));
        }
    }
    Ok(IndexPlan {
        index: target.clone(),
        command: relocation_command(target.len(), pairs),
    })
}

// ── Range restriction ──────────────────────────────────────────────────

/// Restricts an ordered index to the inclusive key window `[lo, hi]`.
///
/// `None` bounds are unbounded. Bounds that cross, or fall entirely outside
/// the key span, produce an empty plan.
pub fn get_range(
    index: &Index,
    lo: Option<&Key>,
    hi: Option<&Key>,
) -> Result<IndexPlan, BuilderError> {
    if !index.is_ordered() {
        return Err(BuilderError::OrderedIndexRequired {
            operation: "get_range",
        });
    }
    let empty = || IndexPlan {
        index: index.slice(0, 0),
        command: VectorCommand::range(VectorCommand::ret(0), 0, 0),
    };
    if index.is_empty() {
        return Ok(empty());
    }

    let start = match lo {
        None => 0,
        Some(key) => match index.lookup(key, Lookup::ExactOrGreater, |_| true)? {
            Some((_, address)) => address.as_usize(),
            None => return Ok(empty()),
        },
    };
    let end = match hi {
        None => index.len() - 1,
        Some(key) => match index.lookup(key, Lookup::ExactOrSmaller, |_| true)? {
            Some((_, address)) => address.as_usize(),
            None => return Ok(empty()),
        },
    };
    if start > end {
        return Ok(empty());
    }

    let len = end - start + 1;
    Ok(IndexPlan {
        index: index.slice(start, len),
        command: VectorCommand::range(VectorCommand::ret(0), start, len),
    })
}

// ── Aggregation (windowing / chunking) ─────────────────────────────────

fn window_bounds(len: usize, size: usize, boundary: Boundary) -> Vec<(usize, usize, SegmentKind)> {
    let mut bounds = Vec::new();
    if boundary.end == BoundaryEnd::AtBeginning && !boundary.skip {
        for s in 1..size {
            if s <= len {
                bounds.push((0, s, SegmentKind::Incomplete));
            }
        }
    }
    if len >= size {
        for start in 0..=len - size {
            bounds.push((start, size, SegmentKind::Complete));
        }
    }
    if boundary.end == BoundaryEnd::AtEnding && !boundary.skip {
        for s in (1..size).rev() {
            if s <= len {
                bounds.push((len - s, s, SegmentKind::Incomplete));
            }
        }
    }
    bounds
}

fn chunk_bounds(len: usize, size: usize, boundary: Boundary) -> Vec<(usize, usize, SegmentKind)> {
    let complete = len / size;
    let leftover = len % size;
    let mut bounds = Vec::new();
    match boundary.end {
        // Chunks align from the beginning; the leftover sits at the end.
        BoundaryEnd::AtEnding => {
            for i in 0..complete {
                bounds.push((i * size, size, SegmentKind::Complete));
            }
            if leftover > 0 && !boundary.skip {
                bounds.push((len - leftover, leftover, SegmentKind::Incomplete));
            }
        }
        // Chunks align from the ending; the leftover sits at the beginning.
        BoundaryEnd::AtBeginning => {
            if leftover > 0 && !boundary.skip {
                bounds.push((0, leftover, SegmentKind::Incomplete));
            }
            for i in 0..complete {
                bounds.push((leftover + i * size, size, SegmentKind::Complete));
            }
        }
    }
    bounds
}

/// Partitions an ordered index into floating windows or fixed-size chunks.
///
/// `key_of_segment` chooses the new key for each segment from the segment's
/// keys. Segment k's command is address-aligned with address k of the new
/// index. Incomplete boundary segments are emitted once at the configured
/// end and flagged `Incomplete`, or suppressed entirely when the boundary's
/// `skip` flag is set.
pub fn aggregate(
    index: &Index,
    aggregation: Aggregation,
    key_of_segment: impl Fn(&[Key]) -> Key,
) -> Result<(Index, Vec<Segment>), BuilderError> {
    if !index.is_ordered() {
        return Err(BuilderError::OrderedIndexRequired {
            operation: "aggregate",
        });
    }
    let (size, boundary, chunked) = match aggregation {
        Aggregation::WindowSize(size, boundary) => (size, boundary, false),
        Aggregation::ChunkSize(size, boundary) => (size, boundary, true),
    };
    if size == 0 {
        return Err(BuilderError::InvalidSegmentSize);
    }
    let len = index.len();
    let segments = if chunked {
        chunk_bounds(len, size, boundary)
    } else {
        window_bounds(len, size, boundary)
    };

    let all_keys: Vec<Key> = index.keys().collect();
    let mut new_keys = Vec::with_capacity(segments.len());
    let mut out = Vec::with_capacity(segments.len());
    for (start, seg_len, kind) in segments {
        new_keys.push(key_of_segment(&all_keys[start..start + seg_len]));
        out.push(Segment {
            kind,
            command: VectorCommand::range(VectorCommand::ret(0), start, seg_len),
        });
    }
    Ok((Index::from_keys(new_keys, None), out))
}

// ── Grouping ───────────────────────────────────────────────────────────

/// Partitions keys by a derived group key, in first-seen group order.
///
/// The source needs no ordering. Each group gets the sub-index of its member
/// keys plus a relocation command gathering the member addresses.
#[must_use]
pub fn group_by(index: &Index, key_of: impl Fn(&Key) -> Key) -> Vec<Group> {
    let mut order: Vec<Key> = Vec::new();
    let mut members = HashMap::<Key, Vec<(usize, Key)>>::new();
    for (addr, key) in index.keys().enumerate() {
        let group_key = key_of(&key);
        members
            .entry(group_key.clone())
            .or_insert_with(|| {
                order.push(group_key);
                Vec::new()
            })
            .push((addr, key));
    }

    order
        .into_iter()
        .filter_map(|group_key| {
            let group_members = members.remove(&group_key)?;
            let pairs: Vec<(Address, Address)> = group_members
                .iter()
                .enumerate()
                .map(|(position, (addr, _))| (Address::new(position), Address::new(*addr)))
                .collect();
            let keys: Vec<Key> = group_members.into_iter().map(|(_, key)| key).collect();
            let new_len = keys.len();
            Some(Group {
                key: group_key,
                index: Index::from_keys(keys, None),
                command: relocation_command(new_len, pairs),
            })
        })
        .collect()
}

// ── Resampling ─────────────────────────────────────────────────────────

/// Buckets an ordered index into chunks delimited by `targets`.
///
/// `Forward` makes each target the inclusive lower bound of its chunk,
/// `Backward` the inclusive upper bound. A target absent from the source
/// still defines a chunk edge (its chunk may be empty); source keys outside
/// the target span fold into the first or last chunk. The new index is keyed
/// by the targets; command k selects chunk k's contiguous address range.
pub fn resample(
    index: &Index,
    targets: &[Key],
    direction: Direction,
) -> Result<MultiPlan, BuilderError> {
    if !index.is_ordered() {
        return Err(BuilderError::OrderedIndexRequired {
            operation: "resample",
        });
    }
    if !targets.windows(2).all(|w| w[0] < w[1]) {
        return Err(BuilderError::UnsortedTargets);
    }
    if targets.is_empty() {
        return Ok(MultiPlan {
            index: Index::from_keys(Vec::new(), Some(true)),
            commands: Vec::new(),
        });
    }

    let len = index.len();
    let mut edges = Vec::with_capacity(targets.len() + 1);
    match direction {
        Direction::Forward => {
            edges.push(0);
            for target in &targets[1..] {
                let edge = match index.lookup(target, Lookup::ExactOrGreater, |_| true)? {
                    Some((_, address)) => address.as_usize(),
                    None => len,
                };
                edges.push(edge);
            }
            edges.push(len);
        }
        Direction::Backward => {
            edges.push(0);
            for target in &targets[..targets.len() - 1] {
                let edge = match index.lookup(target, Lookup::ExactOrSmaller, |_| true)? {
                    Some((_, address)) => address.as_usize() + 1,
                    None => 0,
                };
                edges.push(edge);
            }
            edges.push(len);
        }
    }

    let commands = edges
        .windows(2)
        .map(|w| VectorCommand::range(VectorCommand::ret(0), w[0], w[1].saturating_sub(w[0])))
        .collect();
    Ok(MultiPlan {
        index: Index::from_keys(targets.to_vec(), Some(true)),
        commands,
    })
}

// ── Hierarchical key selection ─────────────────────────────────────────

/// Sub-index of the keys matching a partial key template.
///
/// With free levels remaining, pinned levels are stripped from the result
/// keys (a single remaining level unwraps to a scalar); a fully-pinned
/// template keeps the keys whole.
#[must_use]
pub fn lookup_level(index: &Index, template: &KeyTemplate) -> IndexPlan {
    let mut keys = Vec::new();
    let mut pairs = Vec::new();
    for (addr, key) in index.keys().enumerate() {
        if template.matches(&key) {
            pairs.push((Address::new(keys.len()), Address::new(addr)));
            keys.push(template.strip_pinned(&key));
        }
    }
    let new_len = keys.len();
    IndexPlan {
        index: Index::from_keys(keys, None),
        command: relocation_command(new_len, pairs),
    }
}

// ── Projection ─────────────────────────────────────────────────────────

/// Structurally-equivalent index for a value-type-changing map: identity on
/// keys and addresses.
#[must_use]
pub fn project(index: &Index) -> IndexPlan {
    IndexPlan {
        index: index.clone(),
        command: VectorCommand::ret(0),
    }
}
