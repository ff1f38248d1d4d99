//! Position-bias mitigation: pure permutations applied after scoring.
//!
//! Sequence models attend more to the start and end of their context, so the
//! orderings below move strong items to the edges (or deliberately to the
//! middle) without touching scores or ranks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionBias {
    /// Keep relevance order unchanged.
    #[default]
    Relevance,
    /// Top `start_count` items at the head, the rest reversed and appended,
    /// so the second-best block lands at the very end and the weakest items
    /// sink to the middle.
    Sandwich,
    /// Inverse of sandwich: weakest at the edges, strongest near the middle.
    ReverseSandwich,
    /// Alternate head/tail pointers toward the middle.
    Interleave,
}

/// Apply the ordering to a relevance-descending list.
pub fn apply_position_bias<T>(items: Vec<T>, bias: PositionBias, start_count: usize) -> Vec<T> {
    match bias {
        PositionBias::Relevance => items,
        PositionBias::Sandwich => sandwich(items, start_count),
        PositionBias::ReverseSandwich => {
            let mut reversed = items;
            reversed.reverse();
            sandwich(reversed, start_count)
        }
        PositionBias::Interleave => interleave(items),
    }
}

fn sandwich<T>(items: Vec<T>, start_count: usize) -> Vec<T> {
    if items.len() <= start_count {
        return items;
    }
    let mut out = Vec::with_capacity(items.len());
    let mut rest = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        if i < start_count {
            out.push(item);
        } else {
            rest.push(item);
        }
    }
    rest.reverse();
    out.extend(rest);
    out
}

fn interleave<T>(items: Vec<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len());
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut head = 0usize;
    let mut tail = slots.len();
    let mut from_head = true;
    while head < tail {
        let taken = if from_head {
            head += 1;
            slots[head - 1].take()
        } else {
            tail -= 1;
            slots[tail].take()
        };
        if let Some(item) = taken {
            out.push(item);
        }
        from_head = !from_head;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandwich_permutation() {
        let items = vec!["r1", "r2", "r3", "r4", "r5", "r6", "r7"];
        let out = apply_position_bias(items, PositionBias::Sandwich, 3);
        assert_eq!(out, vec!["r1", "r2", "r3", "r7", "r6", "r5", "r4"]);
    }

    #[test]
    fn test_sandwich_short_input_unchanged() {
        let items = vec!["r1", "r2"];
        let out = apply_position_bias(items, PositionBias::Sandwich, 3);
        assert_eq!(out, vec!["r1", "r2"]);
    }

    #[test]
    fn test_reverse_sandwich_puts_strongest_near_middle() {
        let items = vec!["r1", "r2", "r3", "r4", "r5", "r6", "r7"];
        let out = apply_position_bias(items, PositionBias::ReverseSandwich, 3);
        assert_eq!(out.len(), 7);
        let pos = out.iter().position(|&x| x == "r1").expect("r1 present");
        // Strongest item must land away from both edges.
        assert!(pos >= 2 && pos <= 4, "r1 at position {}", pos);
    }

    #[test]
    fn test_interleave_alternates_edges() {
        let items = vec!["r1", "r2", "r3", "r4", "r5"];
        let out = apply_position_bias(items, PositionBias::Interleave, 3);
        assert_eq!(out, vec!["r1", "r5", "r2", "r4", "r3"]);
    }

    #[test]
    fn test_relevance_is_identity() {
        let items = vec![1, 2, 3];
        assert_eq!(apply_position_bias(items.clone(), PositionBias::Relevance, 3), items);
    }

    #[test]
    fn test_all_orderings_are_permutations() {
        let items: Vec<i32> = (0..9).collect();
        for bias in [
            PositionBias::Relevance,
            PositionBias::Sandwich,
            PositionBias::ReverseSandwich,
            PositionBias::Interleave,
        ] {
            let mut out = apply_position_bias(items.clone(), bias, 3);
            out.sort();
            assert_eq!(out, items, "{:?} must permute without loss", bias);
        }
    }
}
