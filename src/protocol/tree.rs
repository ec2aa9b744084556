//! Per-document revision history, stored as a flat forest of linear branches.
//!
//! A history like
//!
//! ```text
//! '3-a' -> '4-b'
//!
//! '1-c' -> '2-e' -> '3-f'
//!       -> '2-d'
//! ```
//!
//! is represented as
//!
//! ```text
//! RevTree([
//!     Branch(2, ["d", "c"], ..),
//!     Branch(3, ["f", "e", "c"], ..),
//!     Branch(4, ["b", "a"], ..),
//! ])
//! ```
//!
//! Branches are kept sorted ascending by `(leaf_rev_num, leaf_hash)`, so the
//! winner is always near the end and every query is a linear scan over a
//! typically single-element list.

use super::rev::Rev;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Handle to a leaf's stored body and attachment store. `None` marks a
/// tombstone (deleted leaf).
pub type DocPtr = String;

/// One linear branch of a document's revision history.
///
/// `path` holds revision hashes newest first; the hash at offset `i` belongs
/// to revision number `leaf_rev_num - i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BranchRepr", into = "BranchRepr")]
pub struct Branch {
    pub leaf_rev_num: u64,
    pub path: Vec<String>,
    pub leaf_doc_ptr: Option<DocPtr>,
}

type BranchRepr = (u64, Vec<String>, Option<DocPtr>);

impl From<BranchRepr> for Branch {
    fn from((leaf_rev_num, path, leaf_doc_ptr): BranchRepr) -> Self {
        Self {
            leaf_rev_num,
            path,
            leaf_doc_ptr,
        }
    }
}

impl From<Branch> for BranchRepr {
    fn from(branch: Branch) -> Self {
        (branch.leaf_rev_num, branch.path, branch.leaf_doc_ptr)
    }
}

impl Branch {
    pub fn new(leaf_rev_num: u64, path: Vec<String>, leaf_doc_ptr: Option<DocPtr>) -> Self {
        Self {
            leaf_rev_num,
            path,
            leaf_doc_ptr,
        }
    }

    /// Offset of `rev_num` into `path`, if it falls within the retained
    /// history of this branch.
    pub fn offset(&self, rev_num: u64) -> Option<usize> {
        if rev_num == 0 || rev_num > self.leaf_rev_num {
            return None;
        }

        let i = (self.leaf_rev_num - rev_num) as usize;
        (i < self.path.len()).then_some(i)
    }

    /// Does this branch contain the given revision?
    pub fn contains(&self, rev_num: u64, rev_hash: &str) -> bool {
        self.offset(rev_num)
            .is_some_and(|i| self.path[i] == rev_hash)
    }

    /// The leaf revision of this branch.
    pub fn leaf_rev(&self) -> Rev {
        Rev::new(self.leaf_rev_num, self.path[0].clone())
    }

    /// Whether the leaf is a deletion.
    pub fn is_deleted(&self) -> bool {
        self.leaf_doc_ptr.is_none()
    }

    fn sort_key(&self) -> (u64, &str) {
        (self.leaf_rev_num, &self.path[0])
    }
}

/// How an incoming revision path relates to the current tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The revision is already in the tree; nothing to do.
    AlreadyPresent,
    /// The incoming path extends the branch at `index`, which must be
    /// removed when inserting `full_path`.
    Replace { full_path: Vec<String>, index: usize },
    /// The incoming path shares an ancestor with an existing branch but
    /// forks off it, creating a conflict.
    Fork { full_path: Vec<String> },
    /// The incoming path shares no history with any existing branch.
    New { full_path: Vec<String> },
}

impl MergeOutcome {
    /// The path to insert, combined with the index of the branch it
    /// replaces (if any). `None` for `AlreadyPresent`.
    pub fn into_insert(self) -> Option<(Vec<String>, Option<usize>)> {
        match self {
            Self::AlreadyPresent => None,
            Self::Replace { full_path, index } => Some((full_path, Some(index))),
            Self::Fork { full_path } | Self::New { full_path } => Some((full_path, None)),
        }
    }
}

/// A document's full revision history: an ordered set of branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevTree(Vec<Branch>);

impl RevTree {
    pub fn new(mut branches: Vec<Branch>) -> Self {
        branches.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self(branches)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn branch(&self, index: usize) -> &Branch {
        &self.0[index]
    }

    /// Decides how the incoming revision (`doc_rev_num`, `doc_path` newest
    /// first) relates to the tree. Does not modify the tree; apply the
    /// outcome with [`RevTree::update`].
    pub fn merge(&self, doc_rev_num: u64, doc_path: &[String]) -> MergeOutcome {
        for (i, branch) in self.0.iter().enumerate().rev() {
            // 1. already in the tree? E.g.:
            //
            // branch.leaf_rev_num = 5
            // branch.path = ["e", "d", "c"]
            //
            // doc_rev_num = 3
            // doc_path = ["c", "b", "a"]
            if branch.contains(doc_rev_num, &doc_path[0]) {
                return MergeOutcome::AlreadyPresent;
            }

            // 2. extends an existing branch? E.g.:
            //
            // branch.leaf_rev_num = 3
            // branch.path = ["c", "b", "a"]
            //
            // doc_rev_num = 5
            // doc_path = ["e", "d", "c", "b"]
            if doc_rev_num >= branch.leaf_rev_num {
                let k = (doc_rev_num - branch.leaf_rev_num) as usize;
                if k < doc_path.len() && doc_path[k] == branch.path[0] {
                    let mut full_path = doc_path[..k].to_vec();
                    full_path.extend_from_slice(&branch.path);
                    return MergeOutcome::Replace {
                        full_path,
                        index: i,
                    };
                }
            }
        }

        self.merge_as_new_branch(doc_rev_num, doc_path)
    }

    /// 3. & 4. of the merge algorithm: look for a shared ancestor revision,
    /// otherwise the path becomes an unrelated new branch.
    fn merge_as_new_branch(&self, doc_rev_num: u64, doc_path: &[String]) -> MergeOutcome {
        let doc_start = doc_rev_num + 1 - doc_path.len() as u64;

        for branch in self.branches() {
            let branch_start = branch.leaf_rev_num + 1 - branch.path.len() as u64;
            let common_rev_num = branch_start.max(doc_start);

            let (Some(branch_i), Some(doc_i)) = (
                branch.offset(common_rev_num),
                offset_of(doc_rev_num, doc_path, common_rev_num),
            ) else {
                continue;
            };

            if branch.path[branch_i] == doc_path[doc_i] {
                // combine both halves into a full path
                let mut full_path = doc_path[..doc_i].to_vec();
                full_path.extend_from_slice(&branch.path[branch_i..]);
                return MergeOutcome::Fork { full_path };
            }
        }

        MergeOutcome::New {
            full_path: doc_path.to_vec(),
        }
    }

    /// Inserts a branch decided by [`RevTree::merge`], removing the replaced
    /// branch first and stemming the path to `revs_limit` entries.
    pub fn update(
        &mut self,
        leaf_rev_num: u64,
        mut full_path: Vec<String>,
        leaf_doc_ptr: Option<DocPtr>,
        replaced_index: Option<usize>,
        revs_limit: usize,
    ) {
        if let Some(index) = replaced_index {
            self.0.remove(index);
        }

        assert!(revs_limit > 0, "invalid revs limit");
        full_path.truncate(revs_limit);

        let branch = Branch::new(leaf_rev_num, full_path, leaf_doc_ptr);
        let key = branch.sort_key();
        let i = self.0.partition_point(|other| other.sort_key() <= key);
        self.0.insert(i, branch);
    }

    /// The branches that contain the given revision.
    pub fn find<'a>(&'a self, rev: &'a Rev) -> impl Iterator<Item = &'a Branch> + 'a {
        self.branches()
            .filter(move |branch| branch.contains(rev.num, &rev.hash))
    }

    /// Whether `rev` is missing from the tree and, if so, which leaf
    /// revisions could theoretically be extended to include it.
    pub fn diff(&self, rev: &Rev) -> (bool, BTreeSet<Rev>) {
        let mut possible_ancestors = BTreeSet::new();

        for branch in self.branches() {
            if branch.contains(rev.num, &rev.hash) {
                return (false, BTreeSet::new());
            }
            if rev.num > branch.leaf_rev_num {
                possible_ancestors.insert(branch.leaf_rev());
            }
        }

        (true, possible_ancestors)
    }

    /// All branches, those with the highest revision number and hash first.
    pub fn branches(&self) -> impl DoubleEndedIterator<Item = &Branch> {
        self.0.iter().rev()
    }

    /// The winning branch: the one with the highest leaf rev that isn't
    /// deleted, or, if all leaves are deleted, the highest leaf rev overall.
    pub fn winner(&self) -> Option<&Branch> {
        let mut best_deleted_branch = None;

        for branch in self.branches() {
            if branch.leaf_doc_ptr.is_some() {
                return Some(branch);
            }
            best_deleted_branch = best_deleted_branch.or(Some(branch));
        }

        best_deleted_branch
    }
}

fn offset_of(rev_num: u64, path: &[String], wanted_rev_num: u64) -> Option<usize> {
    if wanted_rev_num == 0 || wanted_rev_num > rev_num {
        return None;
    }

    let i = (rev_num - wanted_rev_num) as usize;
    (i < path.len()).then_some(i)
}
