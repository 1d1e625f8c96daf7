#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_types::Address;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VectorError {
    #[error("command references source slot {slot} but only {available} sources were supplied")]
    UnknownSource { slot: usize, available: usize },
    #[error("address {address} is out of bounds for a vector of length {len}")]
    AddressOutOfBounds { address: usize, len: usize },
    #[error("combine requires address-aligned inputs: left has {left_len} elements, right has {right_len}")]
    LengthMismatch { left_len: usize, right_len: usize },
    #[error("combine conflict at address {address}: both sides present under fail-on-both rule")]
    CombineConflict { address: usize },
    #[error("range [{start}, {start_plus_len}) exceeds source length {len}")]
    RangeOutOfBounds {
        start: usize,
        start_plus_len: usize,
        len: usize,
    },
}

/// Elementwise policy for merging two address-aligned vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Keep the left element when both sides are present.
    PreferLeft,
    /// Keep the right element when both sides are present.
    PreferRight,
    /// Both sides present is a conflict.
    FailOnBoth,
}

/// Deferred, immutable description of how to build a new backing vector
/// from existing ones.
///
/// Commands reference their inputs by source slot number only; they own no
/// data. A command is created by an index combinator, paired with the new
/// index, and consumed by [`materialize`] within the same high-level
/// operation. The closed variant set keeps evaluation in one place: adding
/// a command kind means extending the single evaluator match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorCommand {
    /// Use input vector `source` unchanged.
    Return { source: usize },
    /// Scatter `(new, old)` address pairs into a fresh vector of `new_len`.
    /// Addresses absent from the relocation list are missing in the output.
    Relocate {
        source: Box<VectorCommand>,
        new_len: usize,
        relocations: Vec<(Address, Address)>,
    },
    /// Contiguous sub-range of the source.
    Range {
        source: Box<VectorCommand>,
        start: usize,
        len: usize,
    },
    /// Concatenation of two sources.
    Append {
        left: Box<VectorCommand>,
        right: Box<VectorCommand>,
    },
    /// Elementwise 3-way merge of two address-aligned sources.
    Combine {
        left: Box<VectorCommand>,
        right: Box<VectorCommand>,
        merge: MergeRule,
    },
}

impl VectorCommand {
    #[must_use]
    pub fn ret(source: usize) -> Self {
        Self::Return { source }
    }

    #[must_use]
    pub fn relocate(source: VectorCommand, new_len: usize, relocations: Vec<(Address, Address)>) -> Self {
        Self::Relocate {
            source: Box::new(source),
            new_len,
            relocations,
        }
    }

    #[must_use]
    pub fn range(source: VectorCommand, start: usize, len: usize) -> Self {
        Self::Range {
            source: Box::new(source),
            start,
            len,
        }
    }

    #[must_use]
    pub fn append(left: VectorCommand, right: VectorCommand) -> Self {
        Self::Append {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn combine(left: VectorCommand, right: VectorCommand, merge: MergeRule) -> Self {
        Self::Combine {
            left: Box::new(left),
            right: Box::new(right),
            merge,
        }
    }

    /// Length of the materialized output, given the lengths of the source
    /// slots, without touching any data. Structural errors surface the same
    /// way they would during materialization.
    pub fn output_len(&self, source_lens: &[usize]) -> Result<usize, VectorError> {
        match self {
            Self::Return { source } => {
                source_lens
                    .get(*source)
                    .copied()
                    .ok_or(VectorError::UnknownSource {
                        slot: *source,
                        available: source_lens.len(),
                    })
            }
            Self::Relocate { new_len, .. } => Ok(*new_len),
            Self::Range { source, start, len } => {
                let source_len = source.output_len(source_lens)?;
                if start + len > source_len {
                    return Err(VectorError::RangeOutOfBounds {
                        start: *start,
                        start_plus_len: start + len,
                        len: source_len,
                    });
                }
                Ok(*len)
            }
            Self::Append { left, right } => {
                Ok(left.output_len(source_lens)? + right.output_len(source_lens)?)
            }
            Self::Combine { left, right, .. } => {
                let left_len = left.output_len(source_lens)?;
                let right_len = right.output_len(source_lens)?;
                if left_len != right_len {
                    return Err(VectorError::LengthMismatch {
                        left_len,
                        right_len,
                    });
                }
                Ok(left_len)
            }
        }
    }
}

/// Executes a command against concrete backing vectors.
///
/// Missing elements are `None`; given the same inputs and command the output
/// is deterministic, and its addresses align 1:1 with the index the command
/// was paired with.
pub fn materialize<T: Clone>(
    command: &VectorCommand,
    sources: &[&[Option<T>]],
) -> Result<Vec<Option<T>>, VectorError> {
    match command {
        VectorCommand::Return { source } => sources
            .get(*source)
            .map(|values| values.to_vec())
            .ok_or(VectorError::UnknownSource {
                slot: *source,
                available: sources.len(),
            }),
        VectorCommand::Relocate {
            source,
            new_len,
            relocations,
        } => {
            let base = materialize(source, sources)?;
            let mut out = vec![None; *new_len];
            for &(new, old) in relocations {
                let slot = out
                    .get_mut(new.as_usize())
                    .ok_or(VectorError::AddressOutOfBounds {
                        address: new.as_usize(),
                        len: *new_len,
                    })?;
                *slot = base
                    .get(old.as_usize())
                    .ok_or(VectorError::AddressOutOfBounds {
                        address: old.as_usize(),
                        len: base.len(),
                    })?
                    .clone();
            }
            Ok(out)
        }
        VectorCommand::Range { source, start, len } => {
            let base = materialize(source, sources)?;
            if start + len > base.len() {
                return Err(VectorError::RangeOutOfBounds {
                    start: *start,
                    start_plus_len: start + len,
                    len: base.len(),
                });
            }
            Ok(base[*start..start + len].to_vec())
        }
        VectorCommand::Append { left, right } => {
            let mut out = materialize(left, sources)?;
            out.extend(materialize(right, sources)?);
            Ok(out)
        }
        VectorCommand::Combine { left, right, merge } => {
            let left_values = materialize(left, sources)?;
            let right_values = materialize(right, sources)?;
            if left_values.len() != right_values.len() {
                return Err(VectorError::LengthMismatch {
                    left_len: left_values.len(),
                    right_len: right_values.len(),
                });
            }
            left_values
                .into_iter()
                .zip(right_values)
                .enumerate()
                .map(|(address, pair)| match pair {
                    (Some(l), None) => Ok(Some(l)),
                    (None, Some(r)) => Ok(Some(r)),
                    (None, None) => Ok(None),
                    (Some(l), Some(r)) => match merge {
                        MergeRule::PreferLeft => Ok(Some(l)),
                        MergeRule::PreferRight => Ok(Some(r)),
                        MergeRule::FailOnBoth => Err(VectorError::CombineConflict { address }),
                    },
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{materialize, MergeRule, VectorCommand, VectorError};
    use vx_types::Address;

    fn present(values: &[i64]) -> Vec<Option<i64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn return_passes_source_through() {
        let source = present(&[1, 2, 3]);
        let out = materialize(&VectorCommand::ret(0), &[&source]).expect("slot exists");
        assert_eq!(out, source);
    }

    #[test]
    fn return_unknown_slot_is_an_error() {
        let source = present(&[1]);
        let err = materialize(&VectorCommand::ret(2), &[&source]).unwrap_err();
        assert_eq!(
            err,
            VectorError::UnknownSource {
                slot: 2,
                available: 1
            }
        );
    }

    #[test]
    fn relocate_scatters_and_leaves_holes() {
        let source = present(&[10, 20, 30]);
        let command = VectorCommand::relocate(
            VectorCommand::ret(0),
            4,
            vec![
                (Address::new(0), Address::new(2)),
                (Address::new(3), Address::new(0)),
            ],
        );
        let out = materialize(&command, &[&source]).expect("in bounds");
        assert_eq!(out, vec![Some(30), None, None, Some(10)]);
    }

    #[test]
    fn relocate_out_of_bounds_address_is_an_error() {
        let source = present(&[10]);
        let command = VectorCommand::relocate(
            VectorCommand::ret(0),
            2,
            vec![(Address::new(0), Address::new(5))],
        );
        let err = materialize(&command, &[&source]).unwrap_err();
        assert!(matches!(err, VectorError::AddressOutOfBounds { .. }));
    }

    #[test]
    fn range_selects_contiguous_block() {
        let source = present(&[1, 2, 3, 4, 5]);
        let command = VectorCommand::range(VectorCommand::ret(0), 1, 3);
        let out = materialize(&command, &[&source]).expect("in bounds");
        assert_eq!(out, present(&[2, 3, 4]));

        let empty = VectorCommand::range(VectorCommand::ret(0), 5, 0);
        assert_eq!(materialize(&empty, &[&source]).expect("empty ok"), vec![]);

        let over = VectorCommand::range(VectorCommand::ret(0), 3, 4);
        assert!(matches!(
            materialize(&over, &[&source]).unwrap_err(),
            VectorError::RangeOutOfBounds { .. }
        ));
    }

    #[test]
    fn append_concatenates_in_order() {
        let left = present(&[1, 2]);
        let right = present(&[3]);
        let command = VectorCommand::append(VectorCommand::ret(0), VectorCommand::ret(1));
        let out = materialize(&command, &[&left, &right]).expect("two slots");
        assert_eq!(out, present(&[1, 2, 3]));
    }

    #[test]
    fn combine_merges_elementwise() {
        let left = vec![Some(1), None, Some(3), None];
        let right = vec![None, Some(20), Some(30), None];
        let command = VectorCommand::combine(
            VectorCommand::ret(0),
            VectorCommand::ret(1),
            MergeRule::PreferLeft,
        );
        let out = materialize(&command, &[&left, &right]).expect("aligned");
        assert_eq!(out, vec![Some(1), Some(20), Some(3), None]);

        let command = VectorCommand::combine(
            VectorCommand::ret(0),
            VectorCommand::ret(1),
            MergeRule::PreferRight,
        );
        let out = materialize(&command, &[&left, &right]).expect("aligned");
        assert_eq!(out, vec![Some(1), Some(20), Some(30), None]);
    }

    #[test]
    fn combine_fail_on_both_rejects_overlap() {
        let left = vec![Some(1), Some(2)];
        let right = vec![None, Some(20)];
        let command = VectorCommand::combine(
            VectorCommand::ret(0),
            VectorCommand::ret(1),
            MergeRule::FailOnBoth,
        );
        let err = materialize(&command, &[&left, &right]).unwrap_err();
        assert_eq!(err, VectorError::CombineConflict { address: 1 });
    }

    #[test]
    fn combine_length_mismatch_is_an_error() {
        let left = present(&[1, 2]);
        let right = present(&[1]);
        let command = VectorCommand::combine(
            VectorCommand::ret(0),
            VectorCommand::ret(1),
            MergeRule::PreferLeft,
        );
        let err = materialize(&command, &[&left, &right]).unwrap_err();
        assert!(matches!(err, VectorError::LengthMismatch { .. }));
    }

    #[test]
    fn nested_commands_compose() {
        // Append a relocated left part to a range of the right part.
        let left = present(&[10, 20, 30]);
        let right = present(&[1, 2, 3, 4]);
        let command = VectorCommand::append(
            VectorCommand::relocate(
                VectorCommand::ret(0),
                2,
                vec![
                    (Address::new(0), Address::new(1)),
                    (Address::new(1), Address::new(2)),
                ],
            ),
            VectorCommand::range(VectorCommand::ret(1), 2, 2),
        );
        let out = materialize(&command, &[&left, &right]).expect("composes");
        assert_eq!(out, vec![Some(20), Some(30), Some(3), Some(4)]);
    }

    #[test]
    fn output_len_matches_materialized_length() {
        let left = present(&[10, 20, 30]);
        let right = present(&[1, 2, 3]);
        let commands = vec![
            VectorCommand::ret(0),
            VectorCommand::relocate(VectorCommand::ret(0), 7, vec![]),
            VectorCommand::range(VectorCommand::ret(0), 1, 2),
            VectorCommand::append(VectorCommand::ret(0), VectorCommand::ret(1)),
            VectorCommand::combine(
                VectorCommand::ret(0),
                VectorCommand::ret(1),
                MergeRule::PreferLeft,
            ),
        ];
        for command in commands {
            let expected = materialize(&command, &[&left, &right]).expect("valid").len();
            assert_eq!(
                command.output_len(&[left.len(), right.len()]).expect("valid"),
                expected,
                "command {command:?}"
            );
        }
    }

    #[test]
    fn materialization_is_deterministic() {
        let source = present(&[5, 6, 7]);
        let command = VectorCommand::relocate(
            VectorCommand::ret(0),
            3,
            vec![
                (Address::new(2), Address::new(0)),
                (Address::new(0), Address::new(2)),
            ],
        );
        let first = materialize(&command, &[&source]).expect("valid");
        let second = materialize(&command, &[&source]).expect("valid");
        assert_eq!(first, second);
    }
}
