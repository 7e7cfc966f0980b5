//! Structural diff between two MST roots

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;

use super::cursor::{Cursor, Position};
use super::node::NodeEntry;
use super::tree::{Mst, WriteOp};
use super::{BoxFut, util};
use crate::error::Result;
use crate::storage::BlockStore;

/// A changed key reported by [`Mst::diff`], with both sides of the change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffUpdate {
    /// Record path
    pub key: SmolStr,
    /// CID in the old tree
    pub prev: Cid,
    /// CID in the new tree
    pub new: Cid,
}

/// Deterministic diff between two trees
///
/// The three op sets are disjoint and each is in ascending key order. Block
/// accounting rides along: node blocks only reachable from the new root, and
/// node CIDs that dropped out of reach.
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    /// Keys present only in the new tree
    pub creates: Vec<(SmolStr, Cid)>,

    /// Keys present in both trees with different values
    pub updates: Vec<DiffUpdate>,

    /// Keys present only in the old tree
    pub deletes: Vec<(SmolStr, Cid)>,

    /// Record CIDs newly referenced (creates plus update targets)
    pub new_leaf_cids: Vec<Cid>,

    /// Record CIDs no longer referenced (deletes plus update sources)
    pub removed_leaf_cids: Vec<Cid>,

    /// Serialized node blocks reachable from the new root but not the old
    pub new_node_blocks: BTreeMap<Cid, Bytes>,

    /// Node CIDs reachable from the old root but not the new
    pub removed_node_cids: Vec<Cid>,
}

impl TreeDiff {
    /// True when the two trees hold the same mapping
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of record operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Node CIDs reachable only from the new root
    pub fn new_cids(&self) -> HashSet<Cid> {
        self.new_node_blocks.keys().copied().collect()
    }

    /// Convert to write operations that replay old → new via [`Mst::apply`]
    pub fn to_ops(&self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(WriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }
        for update in &self.updates {
            ops.push(WriteOp::Update {
                key: update.key.clone(),
                cid: update.new,
                prev: Some(update.prev),
            });
        }
        for (key, cid) in &self.deletes {
            ops.push(WriteOp::Delete {
                key: key.clone(),
                prev: Some(*cid),
            });
        }

        ops
    }

    fn create(&mut self, key: SmolStr, cid: Cid) {
        self.creates.push((key, cid));
        self.new_leaf_cids.push(cid);
    }

    fn delete(&mut self, key: SmolStr, cid: Cid) {
        self.deletes.push((key, cid));
        self.removed_leaf_cids.push(cid);
    }

    fn update(&mut self, key: SmolStr, prev: Cid, new: Cid) {
        self.updates.push(DiffUpdate { key, prev, new });
        self.new_leaf_cids.push(new);
        self.removed_leaf_cids.push(prev);
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Compute the diff that transforms `self` into `other`
    ///
    /// Co-walks both trees in key order, skipping any subtree pair whose
    /// root CIDs match, so unchanged regions cost nothing.
    pub async fn diff(&self, other: &Mst<S>) -> Result<TreeDiff> {
        let mut diff = TreeDiff::default();
        diff_trees(self, other, &mut diff).await?;

        // Nodes visited from both sides with identical CIDs are unchanged;
        // drop them from both tallies.
        let added: HashSet<Cid> = diff.new_node_blocks.keys().copied().collect();
        let removed: HashSet<Cid> = diff.removed_node_cids.iter().copied().collect();
        let unchanged: HashSet<Cid> = added.intersection(&removed).copied().collect();

        diff.new_node_blocks.retain(|cid, _| !unchanged.contains(cid));
        let mut seen = HashSet::new();
        diff.removed_node_cids
            .retain(|cid| !unchanged.contains(cid) && seen.insert(*cid));

        Ok(diff)
    }

    /// Diff against the empty tree: every key deleted, every node removed
    pub async fn diff_to_empty(&self) -> Result<TreeDiff> {
        let mut diff = TreeDiff::default();
        remove_whole_tree(self, &mut diff).await?;
        Ok(diff)
    }
}

async fn diff_trees<S: BlockStore + Sync + 'static>(
    old: &Mst<S>,
    new: &Mst<S>,
    diff: &mut TreeDiff,
) -> Result<()> {
    if old.root().await? == new.root().await? {
        return Ok(());
    }

    let mut old_cur = Cursor::new(old.clone());
    let mut new_cur = Cursor::new(new.clone());

    loop {
        match (old_cur.position().clone(), new_cur.position().clone()) {
            (Position::End, Position::End) => break,

            // Only the new side remains: everything is a create
            (Position::End, Position::Leaf { key, cid }) => {
                diff.create(key, cid);
                new_cur.advance().await?;
            }
            (Position::End, Position::Tree { mst }) => {
                add_whole_tree(&mst, diff).await?;
                new_cur.skip_subtree().await?;
            }

            // Only the old side remains: everything is a delete
            (Position::Leaf { key, cid }, Position::End) => {
                diff.delete(key, cid);
                old_cur.advance().await?;
            }
            (Position::Tree { mst }, Position::End) => {
                remove_whole_tree(&mst, diff).await?;
                old_cur.skip_subtree().await?;
            }

            // Two leaves compare directly by key, whatever their heights
            (
                Position::Leaf {
                    key: old_key,
                    cid: old_cid,
                },
                Position::Leaf {
                    key: new_key,
                    cid: new_cid,
                },
            ) => match old_key.cmp(&new_key) {
                std::cmp::Ordering::Equal => {
                    if old_cid != new_cid {
                        diff.update(old_key, old_cid, new_cid);
                    }
                    old_cur.advance().await?;
                    new_cur.advance().await?;
                }
                std::cmp::Ordering::Less => {
                    diff.delete(old_key, old_cid);
                    old_cur.advance().await?;
                }
                std::cmp::Ordering::Greater => {
                    diff.create(new_key, new_cid);
                    new_cur.advance().await?;
                }
            },

            (old_pos, new_pos) => {
                let old_height = old_cur.height().await?;
                let new_height = new_cur.height().await?;

                match (old_pos, new_pos) {
                    (Position::Tree { mst: old_tree }, Position::Tree { mst: new_tree })
                        if old_height == new_height =>
                    {
                        let old_cid = old_tree.root().await?;
                        let new_cid = new_tree.root().await?;

                        if old_cid == new_cid {
                            // Identical subtrees: hop over both
                            old_cur.skip_subtree().await?;
                            new_cur.skip_subtree().await?;
                        } else {
                            track_node(&new_tree, diff).await?;
                            diff.removed_node_cids.push(old_cid);
                            old_cur.advance().await?;
                            new_cur.advance().await?;
                        }
                    }

                    // The deeper walker stands still while the shallower one
                    // descends until both reach comparable entries.
                    (old_pos, new_pos) if old_height > new_height => {
                        if let Position::Tree { mst } = &old_pos {
                            diff.removed_node_cids.push(mst.root().await?);
                            old_cur.advance().await?;
                        } else {
                            if let Position::Tree { mst } = &new_pos {
                                track_node(mst, diff).await?;
                            }
                            new_cur.advance().await?;
                        }
                    }

                    (old_pos, new_pos) if old_height < new_height => {
                        if let Position::Tree { mst } = &new_pos {
                            track_node(mst, diff).await?;
                            new_cur.advance().await?;
                        } else {
                            if let Position::Tree { mst } = &old_pos {
                                diff.removed_node_cids.push(mst.root().await?);
                            }
                            old_cur.advance().await?;
                        }
                    }

                    // Same height, one side a leaf: descend into the tree side
                    (Position::Leaf { .. }, Position::Tree { mst }) => {
                        track_node(&mst, diff).await?;
                        new_cur.advance().await?;
                    }
                    (Position::Tree { mst }, Position::Leaf { .. }) => {
                        diff.removed_node_cids.push(mst.root().await?);
                        old_cur.advance().await?;
                    }

                    _ => {}
                }
            }
        }
    }

    Ok(())
}

/// Serialize one node into the diff's new-block set
async fn track_node<S: BlockStore + Sync + 'static>(
    tree: &Mst<S>,
    diff: &mut TreeDiff,
) -> Result<()> {
    let entries = tree.entries().await?;
    let data = util::serialize_node_data(entries).await?;
    let (cid, bytes) = util::cid_for(&data)?;
    diff.new_node_blocks.insert(cid, bytes);
    Ok(())
}

fn add_whole_tree<'a, S: BlockStore + Sync + 'static>(
    tree: &'a Mst<S>,
    diff: &'a mut TreeDiff,
) -> BoxFut<'a, Result<()>> {
    Box::pin(async move {
        track_node(tree, diff).await?;

        for entry in tree.entries().await? {
            match entry {
                NodeEntry::Leaf { key, value } => diff.create(key.clone(), *value),
                NodeEntry::Tree(subtree) => add_whole_tree(subtree, diff).await?,
            }
        }

        Ok(())
    })
}

fn remove_whole_tree<'a, S: BlockStore + Sync + 'static>(
    tree: &'a Mst<S>,
    diff: &'a mut TreeDiff,
) -> BoxFut<'a, Result<()>> {
    Box::pin(async move {
        diff.removed_node_cids.push(tree.root().await?);

        for entry in tree.entries().await? {
            match entry {
                NodeEntry::Leaf { key, value } => diff.delete(key.clone(), *value),
                NodeEntry::Tree(subtree) => remove_whole_tree(subtree, diff).await?,
            }
        }

        Ok(())
    })
}
