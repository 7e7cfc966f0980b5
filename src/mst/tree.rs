//! Immutable Merkle Search Tree operations

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;
use tokio::sync::OnceCell;

use super::cursor::{Cursor, Position};
use super::node::{NodeData, NodeEntry};
use super::{BoxFut, util};
use crate::error::{RepoError, Result};
use crate::storage::BlockStore;

/// A single MST mutation, applied through [`Mst::apply`]
///
/// `prev` carries the expected current CID for updates and deletes; when
/// present it is checked against the tree before the mutation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a new key (fails if it exists)
    Create {
        /// Record path
        key: SmolStr,
        /// Record CID
        cid: Cid,
    },

    /// Replace the value of an existing key (fails if missing)
    Update {
        /// Record path
        key: SmolStr,
        /// New record CID
        cid: Cid,
        /// Expected current CID, checked when present
        prev: Option<Cid>,
    },

    /// Remove an existing key (fails if missing)
    Delete {
        /// Record path
        key: SmolStr,
        /// Expected current CID, checked when present
        prev: Option<Cid>,
    },
}

/// Immutable Merkle Search Tree
///
/// Every mutation returns a new `Mst` sharing unchanged subtrees with the
/// original, so old roots stay readable for as long as anyone holds them.
///
/// # In-memory shape
///
/// A node is a flat interleaved `Vec<NodeEntry>` of subtrees and leaves.
/// Entries and the node CID are both computed at most once per node and
/// cached ([`OnceCell`]); a node built by a mutation starts with entries set
/// and computes its CID on demand, a node loaded by CID starts the other way
/// around.
///
/// # Height
///
/// `height(key) = leading_zero_bits(sha256(key)) / 4`. All keys in one node
/// share a height; subtrees hold strictly lower heights. The root's height is
/// the highest key height present.
#[derive(Debug, Clone)]
pub struct Mst<S> {
    storage: Arc<S>,

    /// Entry list; unset until loaded from storage
    entries: Arc<OnceCell<Vec<NodeEntry<S>>>>,

    /// Node CID; unset until computed from entries
    pointer: Arc<OnceCell<Cid>>,

    /// Height hint; `None` means derive from contents
    height: Option<usize>,
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create an empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            entries: Arc::new(OnceCell::new_with(Some(Vec::new()))),
            pointer: Arc::new(OnceCell::new()),
            height: Some(0),
        }
    }

    /// Reference a persisted tree by root CID without reading it
    ///
    /// Entries load from storage on first access.
    pub fn load(storage: Arc<S>, cid: Cid, height: Option<usize>) -> Self {
        Self {
            storage,
            entries: Arc::new(OnceCell::new()),
            pointer: Arc::new(OnceCell::new_with(Some(cid))),
            height,
        }
    }

    /// Build a node from known entries; CID computed lazily
    pub(crate) fn with_entries(
        storage: Arc<S>,
        entries: Vec<NodeEntry<S>>,
        height: Option<usize>,
    ) -> Self {
        Self {
            storage,
            entries: Arc::new(OnceCell::new_with(Some(entries))),
            pointer: Arc::new(OnceCell::new()),
            height,
        }
    }

    /// Sibling node constructor preserving storage and height
    fn sibling(&self, entries: Vec<NodeEntry<S>>) -> Self {
        Self::with_entries(self.storage.clone(), entries, self.height)
    }

    /// Shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Entry list, loading from storage on first access
    pub(crate) async fn entries(&self) -> Result<&[NodeEntry<S>]> {
        let entries = self
            .entries
            .get_or_try_init(|| async {
                let cid = self.pointer.get().ok_or_else(|| {
                    RepoError::invalid_node("node has neither entries nor a pointer")
                })?;

                let bytes = self
                    .storage
                    .get(cid)
                    .await?
                    .ok_or_else(|| RepoError::block_not_found(cid))?;

                let data: NodeData = serde_ipld_dagcbor::from_slice(&bytes)
                    .map_err(RepoError::serialization)?;

                util::deserialize_node_data(self.storage.clone(), &data, self.height)
            })
            .await?;

        Ok(entries.as_slice())
    }

    async fn entries_vec(&self) -> Result<Vec<NodeEntry<S>>> {
        Ok(self.entries().await?.to_vec())
    }

    /// Root CID of this node, computing (but not persisting) it if needed
    pub async fn root(&self) -> Result<Cid> {
        self.pointer
            .get_or_try_init(|| async {
                let entries = self.entries().await?;
                let data = util::serialize_node_data(entries).await?;
                let (cid, _) = util::cid_for(&data)?;
                Ok::<_, RepoError>(cid)
            })
            .await
            .copied()
    }

    /// Height of this node (highest key height it holds)
    pub(crate) fn height(&self) -> BoxFut<'_, Result<usize>> {
        Box::pin(async move {
            if let Some(h) = self.height {
                return Ok(h);
            }

            let entries = self.entries().await?;
            for entry in entries {
                if let NodeEntry::Leaf { key, .. } = entry {
                    return Ok(util::key_height(key));
                }
            }
            for entry in entries {
                if let NodeEntry::Tree(subtree) = entry {
                    return Ok(subtree.height().await? + 1);
                }
            }

            Ok(0)
        })
    }

    /// Index of the first leaf with key >= `key`, or `entries.len()`
    fn find_ge_leaf(entries: &[NodeEntry<S>], key: &str) -> usize {
        entries
            .iter()
            .position(|e| matches!(e, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
            .unwrap_or(entries.len())
    }

    /// Look up a key, returning its record CID
    pub fn get<'a>(&'a self, key: &'a str) -> BoxFut<'a, Result<Option<Cid>>> {
        Box::pin(async move {
            util::validate_key(key)?;
            self.get_inner(key).await
        })
    }

    fn get_inner<'a>(&'a self, key: &'a str) -> BoxFut<'a, Result<Option<Cid>>> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let index = Self::find_ge_leaf(entries, key);

            if let Some(NodeEntry::Leaf { key: k, value }) = entries.get(index) {
                if k.as_str() == key {
                    return Ok(Some(*value));
                }
            }

            if index > 0 {
                if let Some(NodeEntry::Tree(subtree)) = entries.get(index - 1) {
                    return subtree.get_inner(key).await;
                }
            }

            Ok(None)
        })
    }

    /// Insert a new key (returns a new tree)
    ///
    /// Fails with `KeyExists` if the key is already present.
    pub async fn add(&self, key: &str, cid: Cid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        if self.get_inner(key).await?.is_some() {
            return Err(RepoError::key_exists(key));
        }
        self.put(key, cid).await
    }

    /// Replace an existing key's value (returns a new tree)
    ///
    /// Fails with `KeyNotFound` if the key is absent. Only the entry's value
    /// changes, so every untouched block is preserved.
    pub async fn update(&self, key: &str, cid: Cid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        if self.get_inner(key).await?.is_none() {
            return Err(RepoError::key_not_found(key));
        }
        self.put(key, cid).await
    }

    /// Insert or replace a key
    fn put<'a>(&'a self, key: &'a str, cid: Cid) -> BoxFut<'a, Result<Mst<S>>> {
        Box::pin(async move {
            let key_height = util::key_height(key);
            let node_height = self.height().await?;
            let entries = self.entries_vec().await?;

            if key_height == node_height {
                let index = Self::find_ge_leaf(&entries, key);

                // Replace in place when the key already sits here
                if let Some(NodeEntry::Leaf { key: k, .. }) = entries.get(index) {
                    if k.as_str() == key {
                        let mut new_entries = entries;
                        new_entries[index] = NodeEntry::Leaf {
                            key: SmolStr::new(key),
                            value: cid,
                        };
                        return Ok(self.sibling(new_entries));
                    }
                }

                let leaf = NodeEntry::Leaf {
                    key: SmolStr::new(key),
                    value: cid,
                };

                if index > 0 && entries[index - 1].is_tree() {
                    // Key lands inside the span of the preceding subtree;
                    // split it around the key
                    let NodeEntry::Tree(subtree) = &entries[index - 1] else {
                        unreachable!()
                    };
                    let (left, right) = subtree.split_around(key).await?;

                    let mut new_entries = entries[..index - 1].to_vec();
                    if let Some(l) = left {
                        new_entries.push(NodeEntry::Tree(l));
                    }
                    new_entries.push(leaf);
                    if let Some(r) = right {
                        new_entries.push(NodeEntry::Tree(r));
                    }
                    new_entries.extend_from_slice(&entries[index..]);
                    Ok(self.sibling(new_entries))
                } else {
                    let mut new_entries = entries;
                    new_entries.insert(index, leaf);
                    Ok(self.sibling(new_entries))
                }
            } else if key_height < node_height {
                // Key belongs below; descend into the covering subtree
                let index = Self::find_ge_leaf(&entries, key);

                if index > 0 {
                    if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                        let new_subtree = subtree.put(key, cid).await?;
                        let mut new_entries = entries;
                        new_entries[index - 1] = NodeEntry::Tree(new_subtree);
                        return Ok(self.sibling(new_entries));
                    }
                }

                let child = Mst::with_entries(
                    self.storage.clone(),
                    Vec::new(),
                    Some(node_height.saturating_sub(1)),
                );
                let new_subtree = child.put(key, cid).await?;
                let mut new_entries = entries;
                new_entries.insert(index, NodeEntry::Tree(new_subtree));
                Ok(self.sibling(new_entries))
            } else {
                // Key belongs above the current root; grow new ancestors
                let extra = key_height - node_height;
                let (mut left, mut right) = self.split_around(key).await?;

                for _ in 1..extra {
                    left = match left {
                        Some(l) => Some(l.into_parent().await?),
                        None => None,
                    };
                    right = match right {
                        Some(r) => Some(r.into_parent().await?),
                        None => None,
                    };
                }

                let mut new_entries = Vec::new();
                if let Some(l) = left {
                    new_entries.push(NodeEntry::Tree(l));
                }
                new_entries.push(NodeEntry::Leaf {
                    key: SmolStr::new(key),
                    value: cid,
                });
                if let Some(r) = right {
                    new_entries.push(NodeEntry::Tree(r));
                }

                Ok(Mst::with_entries(
                    self.storage.clone(),
                    new_entries,
                    Some(key_height),
                ))
            }
        })
    }

    /// Remove a key (returns a new tree)
    ///
    /// Fails with `KeyNotFound` if the key is absent. Subtrees meeting at the
    /// deletion point merge; a root left holding a single subtree collapses.
    pub async fn delete(&self, key: &str) -> Result<Mst<S>> {
        util::validate_key(key)?;
        let altered = self.delete_recurse(key).await?;
        altered.trim_top().await
    }

    fn delete_recurse<'a>(&'a self, key: &'a str) -> BoxFut<'a, Result<Mst<S>>> {
        Box::pin(async move {
            let entries = self.entries_vec().await?;
            let index = Self::find_ge_leaf(&entries, key);

            if let Some(NodeEntry::Leaf { key: k, .. }) = entries.get(index) {
                if k.as_str() == key {
                    let prev = (index > 0).then(|| &entries[index - 1]);
                    let next = entries.get(index + 1);

                    if let (Some(NodeEntry::Tree(left)), Some(NodeEntry::Tree(right))) =
                        (prev, next)
                    {
                        // Neighbouring subtrees lose their separator; merge them
                        let merged = left.append_merge(right).await?;
                        let mut new_entries = entries[..index - 1].to_vec();
                        new_entries.push(NodeEntry::Tree(merged));
                        new_entries.extend_from_slice(&entries[index + 2..]);
                        return Ok(self.sibling(new_entries));
                    }

                    let mut new_entries = entries;
                    new_entries.remove(index);
                    return Ok(self.sibling(new_entries));
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    let new_subtree = subtree.delete_recurse(key).await?;
                    let mut new_entries = entries;
                    if new_subtree.entries().await?.is_empty() {
                        new_entries.remove(index - 1);
                    } else {
                        new_entries[index - 1] = NodeEntry::Tree(new_subtree);
                    }
                    return Ok(self.sibling(new_entries));
                }
            }

            Err(RepoError::key_not_found(key))
        })
    }

    /// Collapse a root that holds nothing but a single subtree
    ///
    /// A fully emptied root also resets to height 0, so the empty tree is
    /// canonical and later inserts rebuild from scratch.
    fn trim_top(self) -> BoxFut<'static, Result<Mst<S>>> {
        Box::pin(async move {
            let entries = self.entries().await?;
            if entries.is_empty() {
                let storage = self.storage.clone();
                return Ok(Mst::new(storage));
            }
            if entries.len() == 1 {
                if let NodeEntry::Tree(subtree) = &entries[0] {
                    return subtree.clone().trim_top().await;
                }
            }
            Ok(self)
        })
    }

    /// Split this tree into entries strictly below and at-or-above `key`
    pub(crate) fn split_around<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFut<'a, Result<(Option<Mst<S>>, Option<Mst<S>>)>> {
        Box::pin(async move {
            let entries = self.entries_vec().await?;
            let index = Self::find_ge_leaf(&entries, key);

            let mut left_entries = entries[..index].to_vec();
            let mut right_entries = entries[index..].to_vec();

            // The boundary subtree may straddle the key; split it recursively
            if let Some(NodeEntry::Tree(boundary)) = left_entries.last().cloned() {
                left_entries.pop();
                let (sub_left, sub_right) = boundary.split_around(key).await?;
                if let Some(l) = sub_left {
                    left_entries.push(NodeEntry::Tree(l));
                }
                if let Some(r) = sub_right {
                    right_entries.insert(0, NodeEntry::Tree(r));
                }
            }

            let left = (!left_entries.is_empty()).then(|| self.sibling(left_entries));
            let right = (!right_entries.is_empty()).then(|| self.sibling(right_entries));

            Ok((left, right))
        })
    }

    /// Concatenate a same-height tree whose keys are all greater than ours
    pub(crate) fn append_merge<'a>(&'a self, other: &'a Mst<S>) -> BoxFut<'a, Result<Mst<S>>> {
        Box::pin(async move {
            if self.height().await? != other.height().await? {
                return Err(RepoError::invalid_node(
                    "cannot merge nodes of different heights",
                ));
            }

            let mut entries = self.entries_vec().await?;
            let other_entries = other.entries_vec().await?;

            if let (Some(NodeEntry::Tree(left)), Some(NodeEntry::Tree(right))) =
                (entries.last(), other_entries.first())
            {
                // Adjacent subtrees at the seam merge recursively
                let merged = left.append_merge(right).await?;
                entries.pop();
                entries.push(NodeEntry::Tree(merged));
                entries.extend_from_slice(&other_entries[1..]);
            } else {
                entries.extend(other_entries);
            }

            Ok(self.sibling(entries))
        })
    }

    /// Wrap this tree in a parent node one height up
    async fn into_parent(self) -> Result<Mst<S>> {
        let height = self.height().await?;
        let storage = self.storage.clone();
        Ok(Mst::with_entries(
            storage,
            vec![NodeEntry::Tree(self)],
            Some(height + 1),
        ))
    }

    /// Apply a batch of write operations in order (returns a new tree)
    ///
    /// Creates fail on existing keys, updates and deletes fail on missing
    /// keys, and `prev` expectations are checked when supplied.
    pub async fn apply(&self, ops: &[WriteOp]) -> Result<Mst<S>> {
        let mut tree = self.clone();

        for op in ops {
            tree = match op {
                WriteOp::Create { key, cid } => tree.add(key, *cid).await?,

                WriteOp::Update { key, cid, prev } => {
                    if let Some(expected) = prev {
                        let current = tree
                            .get(key)
                            .await?
                            .ok_or_else(|| RepoError::key_not_found(key))?;
                        if current != *expected {
                            return Err(RepoError::invalid_node(format!(
                                "update prev mismatch for {key}: expected {expected}, found {current}"
                            )));
                        }
                    }
                    tree.update(key, *cid).await?
                }

                WriteOp::Delete { key, prev } => {
                    if let Some(expected) = prev {
                        let current = tree
                            .get(key)
                            .await?
                            .ok_or_else(|| RepoError::key_not_found(key))?;
                        if current != *expected {
                            return Err(RepoError::invalid_node(format!(
                                "delete prev mismatch for {key}: expected {expected}, found {current}"
                            )));
                        }
                    }
                    tree.delete(key).await?
                }
            };
        }

        Ok(tree)
    }

    /// All leaves in ascending key order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        let mut cursor = Cursor::new(self.clone());
        cursor.advance().await?;
        loop {
            match cursor.position().clone() {
                Position::Leaf { key, cid } => out.push((key, cid)),
                Position::Tree { .. } => {}
                Position::End => break,
            }
            cursor.advance().await?;
        }
        Ok(out)
    }

    /// Key-ordered listing restricted to a prefix, with cursor and cap
    ///
    /// `start` is exclusive; at most `limit` entries return, in ascending
    /// key order.
    pub async fn list(
        &self,
        prefix: Option<&str>,
        start: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        let limit = limit.unwrap_or(usize::MAX);
        let mut cursor = Cursor::new(self.clone());
        cursor.advance().await?;

        loop {
            match cursor.position().clone() {
                Position::Leaf { key, cid } => {
                    let k = key.as_str();
                    if let Some(p) = prefix {
                        if k > p && !k.starts_with(p) {
                            break; // past the prefix range
                        }
                    }
                    let after_start = start.is_none_or(|s| k > s);
                    if after_start && prefix.is_none_or(|p| k.starts_with(p)) {
                        out.push((key.clone(), cid));
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
                Position::Tree { .. } => {}
                Position::End => break,
            }
            cursor.advance().await?;
        }

        Ok(out)
    }

    /// Pre-order enumeration of every node CID reachable from this root
    pub fn walk(&self) -> BoxFut<'_, Result<Vec<Cid>>> {
        Box::pin(async move {
            let mut cids = vec![self.root().await?];
            for entry in self.entries().await? {
                if let NodeEntry::Tree(subtree) = entry {
                    cids.extend(subtree.walk().await?);
                }
            }
            Ok(cids)
        })
    }

    /// Every CID reachable from this root: node CIDs and record CIDs
    pub async fn all_cids(&self) -> Result<HashSet<Cid>> {
        let mut cids: HashSet<Cid> = self.walk().await?.into_iter().collect();
        for (_, value) in self.leaves().await? {
            cids.insert(value);
        }
        Ok(cids)
    }

    /// Serialize every node not yet in storage
    ///
    /// Returns the root CID and the blocks that still need persisting.
    /// Subtrees already present in storage are skipped whole.
    pub fn unstored_blocks(&self) -> BoxFut<'_, Result<(Cid, BTreeMap<Cid, Bytes>)>> {
        Box::pin(async move {
            let mut blocks = BTreeMap::new();
            let root = self.root().await?;

            if self.storage.has(&root).await? {
                return Ok((root, blocks));
            }

            let entries = self.entries().await?;
            let data = util::serialize_node_data(entries).await?;
            let (_, bytes) = util::cid_for(&data)?;
            blocks.insert(root, bytes);

            for entry in entries {
                if let NodeEntry::Tree(subtree) = entry {
                    let (_, sub_blocks) = subtree.unstored_blocks().await?;
                    blocks.extend(sub_blocks);
                }
            }

            Ok((root, blocks))
        })
    }

    /// Persist all unstored node blocks, returning the root CID
    pub async fn persist(&self) -> Result<Cid> {
        let (root, blocks) = self.unstored_blocks().await?;
        if !blocks.is_empty() {
            self.storage.put_many(blocks).await?;
        }
        Ok(root)
    }

    /// CIDs along the path from the root to `key`
    ///
    /// Ends with the record CID when the key exists; otherwise the node path
    /// alone proves absence.
    pub fn cids_for_path<'a>(&'a self, key: &'a str) -> BoxFut<'a, Result<Vec<Cid>>> {
        Box::pin(async move {
            util::validate_key(key)?;

            let mut cids = vec![self.root().await?];
            let entries = self.entries().await?;
            let index = Self::find_ge_leaf(entries, key);

            if let Some(NodeEntry::Leaf { key: k, value }) = entries.get(index) {
                if k.as_str() == key {
                    cids.push(*value);
                    return Ok(cids);
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    cids.extend(subtree.cids_for_path(key).await?);
                }
            }

            Ok(cids)
        })
    }

    /// Serialize every node on the path to `key` into `out`
    ///
    /// Used to assemble proof-covering blocks for commit events.
    pub fn blocks_for_path<'a>(
        &'a self,
        key: &'a str,
        out: &'a mut BTreeMap<Cid, Bytes>,
    ) -> BoxFut<'a, Result<()>> {
        Box::pin(async move {
            let entries = self.entries().await?;
            let data = util::serialize_node_data(entries).await?;
            let (cid, bytes) = util::cid_for(&data)?;
            out.insert(cid, bytes);

            let index = Self::find_ge_leaf(entries, key);
            if let Some(NodeEntry::Leaf { key: k, .. }) = entries.get(index) {
                if k.as_str() == key {
                    return Ok(());
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    subtree.blocks_for_path(key, out).await?;
                }
            }

            Ok(())
        })
    }

    /// Stream every MST node block and record block to a CAR writer
    pub async fn write_blocks_to_car<W: tokio::io::AsyncWrite + Send + Unpin>(
        &self,
        writer: &mut iroh_car::CarWriter<W>,
    ) -> Result<()> {
        let mut leaf_cids = Vec::new();
        self.write_nodes_to_car(writer, &mut leaf_cids).await?;

        let (found, missing) = self.storage.get_many(&leaf_cids).await?;
        if let Some(cid) = missing.first() {
            return Err(RepoError::block_not_found(cid));
        }
        for (cid, data) in found {
            writer.write(cid, &data).await.map_err(RepoError::car)?;
        }

        Ok(())
    }

    fn write_nodes_to_car<'a, W: tokio::io::AsyncWrite + Send + Unpin>(
        &'a self,
        writer: &'a mut iroh_car::CarWriter<W>,
        leaf_cids: &'a mut Vec<Cid>,
    ) -> BoxFut<'a, Result<()>> {
        Box::pin(async move {
            let root = self.root().await?;
            let bytes = self
                .storage
                .get(&root)
                .await?
                .ok_or_else(|| RepoError::block_not_found(root))?;
            writer.write(root, &bytes).await.map_err(RepoError::car)?;

            for entry in self.entries().await? {
                match entry {
                    NodeEntry::Leaf { value, .. } => leaf_cids.push(*value),
                    NodeEntry::Tree(subtree) => {
                        subtree.write_nodes_to_car(writer, leaf_cids).await?;
                    }
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::{DAG_CBOR, SHA2_256};
    use sha2::{Digest, Sha256};

    fn test_cid(n: u8) -> Cid {
        let digest = Sha256::digest([n]);
        let mh = multihash::Multihash::wrap(SHA2_256, &digest).unwrap();
        Cid::new_v1(DAG_CBOR, mh)
    }

    fn empty_tree() -> Mst<MemoryStorage> {
        Mst::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn empty_tree_has_no_entries() {
        let mst = empty_tree();
        assert!(mst.entries().await.unwrap().is_empty());
        assert_eq!(mst.get("coll/key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_root_is_well_known() {
        // Two empty trees agree on the root CID of `{l: null, e: []}`
        let a = empty_tree().root().await.unwrap();
        let b = empty_tree().root().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn add_and_get() {
        let mst = empty_tree();
        let mst = mst.add("coll/key", test_cid(1)).await.unwrap();
        assert_eq!(mst.get("coll/key").await.unwrap(), Some(test_cid(1)));
        assert_eq!(mst.get("coll/other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn add_existing_key_fails() {
        let mst = empty_tree();
        let mst = mst.add("coll/key", test_cid(1)).await.unwrap();
        let err = mst.add("coll/key", test_cid(2)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::KeyExists);
        // original untouched
        assert_eq!(mst.get("coll/key").await.unwrap(), Some(test_cid(1)));
    }

    #[tokio::test]
    async fn update_replaces_value() {
        let mst = empty_tree();
        let mst = mst.add("coll/key", test_cid(1)).await.unwrap();
        let updated = mst.update("coll/key", test_cid(2)).await.unwrap();
        assert_eq!(updated.get("coll/key").await.unwrap(), Some(test_cid(2)));
        assert_eq!(mst.get("coll/key").await.unwrap(), Some(test_cid(1)));
    }

    #[tokio::test]
    async fn update_missing_key_fails() {
        let err = empty_tree()
            .update("coll/key", test_cid(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let mst = empty_tree();
        let mst = mst.add("coll/a", test_cid(1)).await.unwrap();
        let mst = mst.add("coll/b", test_cid(2)).await.unwrap();
        let mst = mst.add("coll/c", test_cid(3)).await.unwrap();

        let mst = mst.delete("coll/b").await.unwrap();
        assert_eq!(mst.get("coll/a").await.unwrap(), Some(test_cid(1)));
        assert_eq!(mst.get("coll/b").await.unwrap(), None);
        assert_eq!(mst.get("coll/c").await.unwrap(), Some(test_cid(3)));
    }

    #[tokio::test]
    async fn delete_missing_key_fails() {
        let mst = empty_tree().add("coll/a", test_cid(1)).await.unwrap();
        let err = mst.delete("coll/b").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn invalid_key_rejected() {
        let mst = empty_tree();
        let err = mst.add("bad key!", test_cid(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidKey);
    }

    #[tokio::test]
    async fn add_then_delete_restores_root() {
        let mst = empty_tree();
        let mst = mst.add("coll/a", test_cid(1)).await.unwrap();
        let mst = mst.add("coll/b", test_cid(2)).await.unwrap();
        let before = mst.root().await.unwrap();

        let mst2 = mst.add("coll/zzz", test_cid(9)).await.unwrap();
        let mst2 = mst2.delete("coll/zzz").await.unwrap();
        assert_eq!(mst2.root().await.unwrap(), before);
    }

    #[tokio::test]
    async fn update_twice_equals_single_update() {
        let base = empty_tree().add("coll/a", test_cid(1)).await.unwrap();

        let twice = base.update("coll/a", test_cid(2)).await.unwrap();
        let twice = twice.update("coll/a", test_cid(3)).await.unwrap();
        let once = base.update("coll/a", test_cid(3)).await.unwrap();

        assert_eq!(twice.root().await.unwrap(), once.root().await.unwrap());
    }

    #[tokio::test]
    async fn insertion_order_does_not_matter() {
        let keys = ["coll/a", "coll/b", "coll/c", "coll/d", "coll/e"];
        let shuffled = ["coll/c", "coll/e", "coll/a", "coll/d", "coll/b"];

        let mut a = empty_tree();
        for (i, key) in keys.iter().enumerate() {
            a = a.add(key, test_cid(i as u8 + 1)).await.unwrap();
        }

        let mut b = empty_tree();
        for key in shuffled {
            let i = keys.iter().position(|k| *k == key).unwrap();
            b = b.add(key, test_cid(i as u8 + 1)).await.unwrap();
        }

        assert_eq!(a.root().await.unwrap(), b.root().await.unwrap());
    }

    #[tokio::test]
    async fn order_independence_at_scale() {
        use crate::types::Tid;

        // forward and reverse insertion of a TID-shaped key range
        let keys: Vec<String> = (0..64)
            .map(|i| format!("app.bsky.feed.post/{}", Tid::from_sequence(i as u64 + 1)))
            .collect();

        let mut fwd = empty_tree();
        for (i, key) in keys.iter().enumerate() {
            fwd = fwd.add(key, test_cid(i as u8)).await.unwrap();
        }
        let mut rev = empty_tree();
        for (i, key) in keys.iter().enumerate().rev() {
            rev = rev.add(key, test_cid(i as u8)).await.unwrap();
        }

        assert_eq!(fwd.root().await.unwrap(), rev.root().await.unwrap());
    }

    #[tokio::test]
    async fn leaves_come_back_sorted() {
        let mut mst = empty_tree();
        for key in ["coll/d", "coll/a", "coll/c", "coll/b"] {
            mst = mst.add(key, test_cid(1)).await.unwrap();
        }

        let leaves = mst.leaves().await.unwrap();
        let keys: Vec<&str> = leaves.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["coll/a", "coll/b", "coll/c", "coll/d"]);
    }

    #[tokio::test]
    async fn list_with_prefix_start_limit() {
        let mut mst = empty_tree();
        for key in [
            "app.bsky.feed.like/aaa",
            "app.bsky.feed.post/aaa",
            "app.bsky.feed.post/bbb",
            "app.bsky.feed.post/ccc",
            "app.bsky.graph.follow/aaa",
        ] {
            mst = mst.add(key, test_cid(1)).await.unwrap();
        }

        let posts = mst
            .list(Some("app.bsky.feed.post/"), None, None)
            .await
            .unwrap();
        assert_eq!(posts.len(), 3);

        let after = mst
            .list(Some("app.bsky.feed.post/"), Some("app.bsky.feed.post/aaa"), None)
            .await
            .unwrap();
        let keys: Vec<&str> = after.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["app.bsky.feed.post/bbb", "app.bsky.feed.post/ccc"]);

        let capped = mst
            .list(Some("app.bsky.feed.post/"), None, Some(1))
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].0, "app.bsky.feed.post/aaa");
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let mut mst = Mst::new(storage.clone());
        for key in ["coll/a", "coll/b", "coll/c"] {
            mst = mst.add(key, test_cid(7)).await.unwrap();
        }

        let root = mst.persist().await.unwrap();

        let reloaded = Mst::load(storage, root, None);
        assert_eq!(reloaded.get("coll/a").await.unwrap(), Some(test_cid(7)));
        assert_eq!(reloaded.get("coll/b").await.unwrap(), Some(test_cid(7)));
        assert_eq!(reloaded.get("coll/c").await.unwrap(), Some(test_cid(7)));
        assert_eq!(reloaded.root().await.unwrap(), root);
    }

    #[tokio::test]
    async fn apply_batch_of_ops() {
        let mst = empty_tree();
        let mst = mst.add("coll/a", test_cid(1)).await.unwrap();
        let mst = mst.add("coll/b", test_cid(2)).await.unwrap();

        let ops = vec![
            WriteOp::Create {
                key: SmolStr::new("coll/c"),
                cid: test_cid(3),
            },
            WriteOp::Update {
                key: SmolStr::new("coll/a"),
                cid: test_cid(10),
                prev: Some(test_cid(1)),
            },
            WriteOp::Delete {
                key: SmolStr::new("coll/b"),
                prev: Some(test_cid(2)),
            },
        ];

        let mst = mst.apply(&ops).await.unwrap();
        assert_eq!(mst.get("coll/a").await.unwrap(), Some(test_cid(10)));
        assert_eq!(mst.get("coll/b").await.unwrap(), None);
        assert_eq!(mst.get("coll/c").await.unwrap(), Some(test_cid(3)));
    }

    #[tokio::test]
    async fn apply_rejects_prev_mismatch() {
        let mst = empty_tree().add("coll/a", test_cid(1)).await.unwrap();

        let ops = vec![WriteOp::Update {
            key: SmolStr::new("coll/a"),
            cid: test_cid(2),
            prev: Some(test_cid(99)),
        }];
        assert!(mst.apply(&ops).await.is_err());

        let ops = vec![WriteOp::Delete {
            key: SmolStr::new("coll/a"),
            prev: Some(test_cid(99)),
        }];
        assert!(mst.apply(&ops).await.is_err());
    }

    #[tokio::test]
    async fn cids_for_path_ends_with_record() {
        let mut mst = empty_tree();
        for key in ["coll/a", "coll/b", "coll/c"] {
            mst = mst.add(key, test_cid(2)).await.unwrap();
        }

        let cids = mst.cids_for_path("coll/b").await.unwrap();
        assert_eq!(cids[0], mst.root().await.unwrap());
        assert_eq!(*cids.last().unwrap(), test_cid(2));
    }

    #[tokio::test]
    async fn cids_for_path_proves_absence() {
        let mst = empty_tree();
        let mst = mst.add("coll/a", test_cid(1)).await.unwrap();
        let mst = mst.add("coll/c", test_cid(3)).await.unwrap();

        let cids = mst.cids_for_path("coll/b").await.unwrap();
        assert_eq!(cids[0], mst.root().await.unwrap());
        assert!(!cids.contains(&test_cid(2)));
    }

    #[tokio::test]
    async fn walk_covers_all_nodes() {
        let storage = Arc::new(MemoryStorage::new());
        let mut mst = Mst::new(storage.clone());
        for i in 0..32u8 {
            let key = format!("coll/key{i:02}");
            mst = mst.add(&key, test_cid(i)).await.unwrap();
        }
        mst.persist().await.unwrap();

        // every walked CID is a stored node block
        for cid in mst.walk().await.unwrap() {
            assert!(storage.has(&cid).await.unwrap());
        }

        let all = mst.all_cids().await.unwrap();
        for cid in mst.walk().await.unwrap() {
            assert!(all.contains(&cid));
        }
        assert!(all.contains(&test_cid(5)));
    }

    #[tokio::test]
    async fn no_single_child_roots_persisted() {
        // deleting down to one subtree collapses the root
        let mut mst = empty_tree();
        for i in 0..16u8 {
            let key = format!("coll/k{i:02}");
            mst = mst.add(&key, test_cid(i)).await.unwrap();
        }
        for i in 0..15u8 {
            let key = format!("coll/k{i:02}");
            mst = mst.delete(&key).await.unwrap();
        }

        let entries = mst.entries().await.unwrap();
        assert!(
            !(entries.len() == 1 && entries[0].is_tree()),
            "root holding a lone subtree must collapse"
        );
    }
}
