//! Merging a local collection with its remote counterpart.
//!
//! Records are matched by `Keyed::identity_key`. The remote copy of a record
//! always wins; what happens to records only present locally depends on the
//! collection's `MergeMode`.

use crate::models::{merge_comments, IdeaRecord, Keyed};
use std::collections::{HashMap, HashSet};

/// How local-only records are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// The remote list is authoritative and may delete records. Used for
    /// tasks. An empty remote list is treated as "no remote data".
    DeletionAware,
    /// Local-only records are kept. Used for ideas, which are created
    /// locally before they ever reach the remote.
    PreserveLocal,
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult<T> {
    pub merged: Vec<T>,
    /// Whether `merged` differs from the local collection in content.
    /// Order alone does not count as a change.
    pub changed: bool,
}

/// Merge with "remote replaces local" for matched records.
pub fn merge_collections<T>(local: &[T], remote: &[T], mode: MergeMode) -> MergeResult<T>
where
    T: Keyed + Clone + PartialEq,
{
    merge_collections_with(local, remote, mode, |_, remote| remote.clone())
}

/// Merge, building matched records with `combine(local, remote)`.
pub fn merge_collections_with<T, F>(
    local: &[T],
    remote: &[T],
    mode: MergeMode,
    combine: F,
) -> MergeResult<T>
where
    T: Keyed + Clone + PartialEq,
    F: Fn(&T, &T) -> T,
{
    if remote.is_empty() && mode == MergeMode::DeletionAware {
        return MergeResult {
            merged: local.to_vec(),
            changed: false,
        };
    }

    let local_by_key: HashMap<String, &T> = local
        .iter()
        .map(|record| (record.identity_key(), record))
        .collect();

    let mut merged: Vec<T> = remote
        .iter()
        .map(|record| match local_by_key.get(&record.identity_key()) {
            Some(existing) => combine(existing, record),
            None => record.clone(),
        })
        .collect();

    if mode == MergeMode::PreserveLocal {
        let remote_keys: HashSet<String> = remote.iter().map(Keyed::identity_key).collect();
        merged.extend(
            local
                .iter()
                .filter(|record| !remote_keys.contains(&record.identity_key()))
                .cloned(),
        );
    }

    let changed = merged.len() != local.len()
        || merged
            .iter()
            .any(|record| local_by_key.get(&record.identity_key()) != Some(&record));

    MergeResult { merged, changed }
}

/// Idea merge: remote wins field by field, comments are the union of both
/// sides, and ideas not yet on the remote are kept.
pub fn merge_ideas(local: &[IdeaRecord], remote: &[IdeaRecord]) -> MergeResult<IdeaRecord> {
    merge_collections_with(local, remote, MergeMode::PreserveLocal, |local, remote| {
        let mut merged = remote.clone();
        merged.comments = merge_comments(&remote.comments, &local.comments);
        merged
    })
}
