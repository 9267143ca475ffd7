//! Generic bipartite matching between a desired and an observed set.
//!
//! Every reconciler phrases "desired vs observed" as a join: pairs are
//! reconciled in place, left-only items are created, right-only items are
//! deleted. Two flavors are provided: [`hash_join`] for exact key equality
//! and [`join`] for scored best-effort pairing.
//!
//! Both are pure functions of their inputs — given the same item order and
//! the same key/score functions they return bit-identical results, which is
//! what lets the reconcilers stay idempotent.

use std::collections::HashMap;
use std::hash::Hash;

/// The outcome of a join: matched pairs plus the unmatched remainder of
/// each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined<L, R> {
    /// Matched (left, right) pairs, in pairing order.
    pub pairs: Vec<(L, R)>,
    /// Left items with no match, in input order.
    pub left_only: Vec<L>,
    /// Right items with no match, in input order.
    pub right_only: Vec<R>,
}

/// Equi-join `lefts` and `rights` on key equality in O(|L| + |R|).
///
/// Each left item matches at most one right item. When several items on the
/// same side share a key, only the first participates in pairing; the later
/// duplicates fall through to the "only" outputs.
pub fn hash_join<L, R, K, FL, FR>(
    lefts: Vec<L>,
    rights: Vec<R>,
    left_key: FL,
    right_key: FR,
) -> Joined<L, R>
where
    K: Eq + Hash,
    FL: Fn(&L) -> K,
    FR: Fn(&R) -> K,
{
    let mut by_key: HashMap<K, usize> = HashMap::with_capacity(rights.len());
    let mut slots: Vec<Option<R>> = Vec::with_capacity(rights.len());
    let mut duplicate = vec![false; rights.len()];

    for (ii, right) in rights.into_iter().enumerate() {
        let key = right_key(&right);
        if by_key.contains_key(&key) {
            duplicate[ii] = true;
        } else {
            by_key.insert(key, ii);
        }
        slots.push(Some(right));
    }

    let mut pairs = Vec::new();
    let mut left_only = Vec::new();
    for left in lefts {
        let matched = by_key
            .get(&left_key(&left))
            .and_then(|&ii| slots[ii].take());
        match matched {
            Some(right) => pairs.push((left, right)),
            None => left_only.push(left),
        }
    }

    // Unpaired slots and duplicates drain to right_only in input order.
    let right_only = slots.into_iter().flatten().collect();
    Joined {
        pairs,
        left_only,
        right_only,
    }
}

/// Join `lefts` and `rights` by greedily pairing the lowest-scoring
/// compatible pair.
///
/// `score` returns 0 for an exact match, a positive value for a worse but
/// acceptable match, and a negative value for "incompatible, never pair".
/// Pairing repeatedly takes the minimum non-negative score; ties break by
/// insertion order (left index first, then right index), so the result is
/// deterministic for a deterministic score function.
pub fn join<L, R, F>(lefts: Vec<L>, rights: Vec<R>, score: F) -> Joined<L, R>
where
    F: Fn(&L, &R) -> i32,
{
    let mut candidates = Vec::new();
    for (li, left) in lefts.iter().enumerate() {
        for (ri, right) in rights.iter().enumerate() {
            let s = score(left, right);
            if s >= 0 {
                candidates.push((s, li, ri));
            }
        }
    }
    candidates.sort_unstable();

    let mut left_slots: Vec<Option<L>> = lefts.into_iter().map(Some).collect();
    let mut right_slots: Vec<Option<R>> = rights.into_iter().map(Some).collect();

    let mut pairs = Vec::new();
    for (_, li, ri) in candidates {
        if left_slots[li].is_some() && right_slots[ri].is_some() {
            let left = left_slots[li].take().expect("checked above");
            let right = right_slots[ri].take().expect("checked above");
            pairs.push((left, right));
        }
    }

    Joined {
        pairs,
        left_only: left_slots.into_iter().flatten().collect(),
        right_only: right_slots.into_iter().flatten().collect(),
    }
}
