//! Deterministic winner selection over the leaves of a revision tree
//!
//! Ordering, strongest first:
//! 1. non-deleted leaves beat deleted leaves
//! 2. higher generation beats lower
//! 3. lexicographically greater revision id beats lesser
//!
//! The rule depends only on the leaf set, so every replica holding the same
//! leaves picks the same winner.

use super::rev_id;
use crate::persistence::types::RevisionRecord;
use std::cmp::Ordering;

/// Compare two leaves; `Ordering::Greater` means `a` wins over `b`
pub fn compare(a_rev: &str, a_deleted: bool, b_rev: &str, b_deleted: bool) -> Ordering {
    let a_generation = rev_id::generation(a_rev).unwrap_or(0);
    let b_generation = rev_id::generation(b_rev).unwrap_or(0);

    b_deleted
        .cmp(&a_deleted)
        .then(a_generation.cmp(&b_generation))
        .then_with(|| a_rev.cmp(b_rev))
}

/// Pick the winning record among `leaves`
pub fn pick_winner<'a, I>(leaves: I) -> Option<&'a RevisionRecord>
where
    I: IntoIterator<Item = &'a RevisionRecord>,
{
    leaves.into_iter().max_by(|a, b| {
        compare(&a.rev_id, a.deleted, &b.rev_id, b.deleted)
    })
}

/// Sort leaves so that the winner comes first
pub fn sort_leaves(leaves: &mut [&RevisionRecord]) {
    leaves.sort_by(|a, b| compare(&b.rev_id, b.deleted, &a.rev_id, a.deleted));
}
