//! Repository engine
//!
//! Owns the in-memory MST mirror and head commit for one repository,
//! serializes write batches into signed commits, and hands each commit to
//! storage as an atomic unit. A repository has exactly one writer at a time;
//! readers go through storage or snapshot the root CID.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use cid::Cid;
use ipld_core::ipld::Ipld;
use smol_str::{format_smolstr, SmolStr};

use crate::commit::{Commit, SigningKey};
use crate::error::{RepoError, Result};
use crate::event::{CommitPayload, Event, RepoOp};
use crate::mst::{util, Mst};
use crate::storage::{RepoEntry, RepoStatus, RepoStorage};
use crate::types::{Did, Ticker, Tid};

/// Pluggable record validator
///
/// Lexicon schema checking lives outside this crate; the engine calls
/// whatever validator it is given before accepting a record.
pub trait RecordValidator: Send + Sync {
    /// Accept or reject a record bound for `collection/rkey`
    fn validate(&self, collection: &str, rkey: &str, record: &Ipld) -> Result<()>;
}

/// Callback invoked with the persisted event after each successful commit
///
/// Keep it bounded: typically "signal something", never a synchronous
/// broadcast that could stall the writer.
pub type CommitCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// One record operation in a write batch
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWrite {
    /// Create a record; `rkey` defaults to a freshly minted TID
    Create {
        /// Collection NSID
        collection: SmolStr,
        /// Record key, minted when absent
        rkey: Option<SmolStr>,
        /// The record
        record: Ipld,
    },

    /// Replace an existing record
    Update {
        /// Collection NSID
        collection: SmolStr,
        /// Record key
        rkey: SmolStr,
        /// The new record
        record: Ipld,
    },

    /// Delete an existing record
    Delete {
        /// Collection NSID
        collection: SmolStr,
        /// Record key
        rkey: SmolStr,
    },
}

impl RecordWrite {
    /// Create op
    pub fn create(collection: &str, rkey: Option<&str>, record: Ipld) -> Self {
        Self::Create {
            collection: SmolStr::new(collection),
            rkey: rkey.map(SmolStr::new),
            record,
        }
    }

    /// Update op
    pub fn update(collection: &str, rkey: &str, record: Ipld) -> Self {
        Self::Update {
            collection: SmolStr::new(collection),
            rkey: SmolStr::new(rkey),
            record,
        }
    }

    /// Delete op
    pub fn delete(collection: &str, rkey: &str) -> Self {
        Self::Delete {
            collection: SmolStr::new(collection),
            rkey: SmolStr::new(rkey),
        }
    }
}

/// A formatted commit ready to apply to storage
///
/// Produced by [`Repo::format_commit`]; nothing is persisted until
/// [`RepoStorage::apply_commit`] runs.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Repository DID
    pub did: Did,
    /// Commit block CID
    pub cid: Cid,
    /// Commit revision
    pub rev: Tid,
    /// Pre-allocated event sequence number
    pub seq: u64,
    /// Previous commit's revision, if any
    pub since: Option<Tid>,
    /// Previous commit CID, `None` for genesis
    pub prev: Option<Cid>,
    /// New MST root
    pub data: Cid,
    /// Previous MST root
    pub prev_data: Option<Cid>,
    /// Every new block: commit, new MST nodes, new record blocks
    pub blocks: BTreeMap<Cid, Bytes>,
    /// Firehose CAR: `blocks` plus proof-covering nodes
    pub event_car: Bytes,
    /// Record operations, in request order
    pub ops: Vec<RepoOp>,
    /// Blob CIDs referenced by this commit
    pub blobs: Vec<Cid>,
    /// CIDs no longer reachable after this commit (orphan candidates)
    pub removed_cids: Vec<Cid>,
}

impl CommitData {
    /// The event payload this commit persists as
    pub fn to_payload(&self) -> CommitPayload {
        CommitPayload {
            commit: self.cid,
            rev: self.rev.clone(),
            since: self.since.clone(),
            prev: self.prev,
            data: self.data,
            prev_data: self.prev_data,
            ops: self.ops.clone(),
            blocks: self.event_car.clone(),
            blobs: self.blobs.clone(),
        }
    }
}

impl<S: RepoStorage> std::fmt::Debug for Repo<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("cid", &self.cid)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A single repository and its write path
pub struct Repo<S: RepoStorage> {
    storage: Arc<S>,
    mst: Mst<S>,
    commit: Commit,
    cid: Cid,
    status: RepoStatus,
    signing_key: Option<Arc<dyn SigningKey + Send + Sync>>,
    validator: Option<Arc<dyn RecordValidator>>,
    on_commit: Option<CommitCallback>,
    ticker: Mutex<Ticker>,
}

impl<S: RepoStorage + Sync + 'static> Repo<S> {
    /// Create a new repository with a genesis commit (`prev = null`)
    ///
    /// Registers the repo record, applies `initial_writes` (creates only)
    /// into the first MST, signs the genesis commit, and persists it all.
    pub async fn create<K>(
        storage: Arc<S>,
        did: Did,
        signing_key: K,
        rotation_key: Option<Bytes>,
        initial_writes: Option<Vec<RecordWrite>>,
    ) -> Result<Repo<S>>
    where
        K: SigningKey + Send + Sync + 'static,
    {
        for write in initial_writes.iter().flatten() {
            if !matches!(write, RecordWrite::Create { .. }) {
                return Err(RepoError::invalid_commit(
                    "initial writes may only contain creates",
                ));
            }
        }

        let mut repo = Repo {
            storage: storage.clone(),
            mst: Mst::new(storage.clone()),
            // placeholder until the genesis commit is formatted below
            commit: Commit::new_unsigned(did.clone(), Cid::default(), Tid::from_sequence(1), None),
            cid: Cid::default(),
            status: RepoStatus::Active,
            signing_key: Some(Arc::new(signing_key)),
            validator: None,
            on_commit: None,
            ticker: Mutex::new(Ticker::new()),
        };

        let (commit_data, tree, commit) = repo
            .format_commit_inner(initial_writes.unwrap_or_default(), true)
            .await?;

        storage
            .create_repo_entry(RepoEntry {
                did,
                head: commit_data.cid,
                rev: commit_data.rev.clone(),
                handle: None,
                status: RepoStatus::Active,
                signing_key: repo
                    .signing_key
                    .as_ref()
                    .map(|k| Bytes::from(k.public_key())),
                rotation_key,
                created_at: Utc::now(),
            })
            .await?;

        let event = storage.apply_commit(commit_data.clone()).await?;
        tracing::debug!(did = %commit.did, seq = event.seq, "created repo");

        repo.mst = tree;
        repo.cid = commit_data.cid;
        repo.commit = commit;
        Ok(repo)
    }

    /// Load a repository by DID or handle
    ///
    /// Deactivated repos load normally (mutation stays rejected); tombstoned
    /// repos fail with `InactiveRepo` unless `allow_inactive` is set. The MST
    /// is reconstructed lazily from the head commit.
    pub async fn load(storage: Arc<S>, ident: &str, allow_inactive: bool) -> Result<Repo<S>> {
        let entry = storage.load_repo_entry(ident, allow_inactive).await?;

        let commit_bytes = storage
            .get(&entry.head)
            .await?
            .ok_or_else(|| RepoError::block_not_found(entry.head))?;
        let commit = Commit::from_cbor(&commit_bytes)?;

        let mst = Mst::load(storage.clone(), commit.data, None);
        tracing::debug!(did = %commit.did, head = %entry.head, "loaded repo");

        Ok(Repo {
            storage,
            mst,
            commit,
            cid: entry.head,
            status: entry.status,
            signing_key: None,
            validator: None,
            on_commit: None,
            ticker: Mutex::new(Ticker::new()),
        })
    }

    /// Arm this repo with its signing key (required for writes)
    pub fn with_signing_key<K>(mut self, key: K) -> Self
    where
        K: SigningKey + Send + Sync + 'static,
    {
        self.signing_key = Some(Arc::new(key));
        self
    }

    /// Install a record validator
    pub fn with_validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Register a callback invoked after every successful commit
    pub fn on_commit(&mut self, callback: CommitCallback) {
        self.on_commit = Some(callback);
    }

    /// Repository DID
    pub fn did(&self) -> &Did {
        &self.commit.did
    }

    /// Head commit
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// Head commit CID
    pub fn head(&self) -> Cid {
        self.cid
    }

    /// Current lifecycle status
    pub fn status(&self) -> RepoStatus {
        self.status
    }

    /// The current MST
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Shared storage handle
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Fetch one record, decoded
    pub async fn get_record(&self, collection: &str, rkey: &str) -> Result<Option<Ipld>> {
        let Some(cid) = self.get_record_cid(collection, rkey).await? else {
            return Ok(None);
        };
        let bytes = self
            .storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::block_not_found(cid))?;
        let record = serde_ipld_dagcbor::from_slice(&bytes).map_err(RepoError::serialization)?;
        Ok(Some(record))
    }

    /// Fetch one record's CID
    pub async fn get_record_cid(&self, collection: &str, rkey: &str) -> Result<Option<Cid>> {
        let key = format_smolstr!("{collection}/{rkey}");
        self.mst.get(&key).await
    }

    /// Every record, decoded, grouped by collection
    pub async fn get_contents(&self) -> Result<BTreeMap<SmolStr, BTreeMap<SmolStr, Ipld>>> {
        let leaves = self.mst.leaves().await?;
        let cids: Vec<Cid> = leaves.iter().map(|(_, cid)| *cid).collect();
        let (found, missing) = self.storage.get_many(&cids).await?;
        if let Some(cid) = missing.first() {
            return Err(RepoError::block_not_found(cid));
        }

        let mut contents: BTreeMap<SmolStr, BTreeMap<SmolStr, Ipld>> = BTreeMap::new();
        for (key, cid) in leaves {
            let (collection, rkey) = key
                .split_once('/')
                .ok_or_else(|| RepoError::invalid_key(key.as_str()))?;
            let record = serde_ipld_dagcbor::from_slice(&found[&cid])
                .map_err(RepoError::serialization)?;
            contents
                .entry(SmolStr::new(collection))
                .or_default()
                .insert(SmolStr::new(rkey), record);
        }

        Ok(contents)
    }

    /// Format a commit from a write batch without persisting anything
    ///
    /// Allocates the event sequence (so the revision can be derived from it)
    /// but writes no blocks, no event, and no head update. Hand the result to
    /// [`RepoStorage::apply_commit`] / [`Repo::apply_commit`] to persist.
    pub async fn format_commit(&self, writes: Vec<RecordWrite>) -> Result<CommitData> {
        let (commit_data, _, _) = self.format_commit_inner(writes, false).await?;
        Ok(commit_data)
    }

    async fn format_commit_inner(
        &self,
        writes: Vec<RecordWrite>,
        genesis: bool,
    ) -> Result<(CommitData, Mst<S>, Commit)> {
        if !genesis && self.status != RepoStatus::Active {
            return Err(RepoError::inactive_repo(self.did(), self.status));
        }

        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| {
                RepoError::new(crate::ErrorKind::Crypto, None)
                    .with_context("repo loaded without a signing key")
                    .with_help("call with_signing_key() before writing")
            })?
            .clone();

        // Normalize: mint rkeys for creates, reject duplicate targets
        let mut keys: Vec<SmolStr> = Vec::with_capacity(writes.len());
        let mut normalized: Vec<RecordWrite> = Vec::with_capacity(writes.len());
        for write in writes {
            let write = match write {
                RecordWrite::Create {
                    collection,
                    rkey,
                    record,
                } => {
                    let rkey = match rkey {
                        Some(rkey) => rkey,
                        None => SmolStr::new(self.ticker.lock().unwrap().next().as_str()),
                    };
                    RecordWrite::Create {
                        collection,
                        rkey: Some(rkey),
                        record,
                    }
                }
                other => other,
            };

            let key = write_key(&write);
            util::validate_key(&key)?;
            if keys.contains(&key) {
                return Err(RepoError::conflicting_writes(key));
            }
            keys.push(key);
            normalized.push(write);
        }

        // External validation before anything is applied
        if let Some(validator) = &self.validator {
            for write in &normalized {
                match write {
                    RecordWrite::Create {
                        collection,
                        rkey,
                        record,
                    } => validator.validate(collection, rkey.as_ref().unwrap(), record)?,
                    RecordWrite::Update {
                        collection,
                        rkey,
                        record,
                    } => validator.validate(collection, rkey, record)?,
                    RecordWrite::Delete { .. } => {}
                }
            }
        }

        // Apply ops in order against a copy of the tree
        let mut tree = self.mst.clone();
        let mut record_blocks: BTreeMap<Cid, Bytes> = BTreeMap::new();
        let mut ops: Vec<RepoOp> = Vec::with_capacity(normalized.len());

        for (write, key) in normalized.iter().zip(&keys) {
            match write {
                RecordWrite::Create { record, .. } => {
                    let (cid, bytes) = util::cid_for(record)?;
                    record_blocks.insert(cid, bytes);
                    tree = tree.add(key, cid).await?;
                    ops.push(RepoOp {
                        action: SmolStr::new("create"),
                        path: key.clone(),
                        cid: Some(cid),
                        prev: None,
                    });
                }
                RecordWrite::Update { record, .. } => {
                    let prev = tree
                        .get(key)
                        .await?
                        .ok_or_else(|| RepoError::key_not_found(key))?;
                    let (cid, bytes) = util::cid_for(record)?;
                    // shipped even when the bytes already exist somewhere, so
                    // subscribers can hydrate without a round-trip
                    record_blocks.insert(cid, bytes);
                    tree = tree.update(key, cid).await?;
                    ops.push(RepoOp {
                        action: SmolStr::new("update"),
                        path: key.clone(),
                        cid: Some(cid),
                        prev: Some(prev),
                    });
                }
                RecordWrite::Delete { .. } => {
                    let prev = tree
                        .get(key)
                        .await?
                        .ok_or_else(|| RepoError::key_not_found(key))?;
                    tree = tree.delete(key).await?;
                    ops.push(RepoOp {
                        action: SmolStr::new("delete"),
                        path: key.clone(),
                        cid: None,
                        prev: Some(prev),
                    });
                }
            }
        }

        let data = tree.root().await?;
        let diff = self.mst.diff(&tree).await?;

        // blocks: new MST nodes + new records (+ commit, added below)
        let mut blocks = diff.new_node_blocks.clone();
        blocks.extend(record_blocks.clone());

        // the root node itself must always ship, even when the tree did not
        // change (genesis, empty batches): the diff alone cannot see it
        {
            let entries = tree.entries().await?;
            let node = util::serialize_node_data(entries).await?;
            let (root_cid, root_bytes) = util::cid_for(&node)?;
            blocks.insert(root_cid, root_bytes);
        }

        // proof-covering set: paths to every touched key in both trees,
        // in the old tree proving prior state, in the new one the result
        let mut event_blocks = blocks.clone();
        for key in &keys {
            tree.blocks_for_path(key, &mut event_blocks).await?;
            if !genesis {
                self.mst.blocks_for_path(key, &mut event_blocks).await?;
            }
        }
        let removed: std::collections::HashSet<Cid> =
            diff.removed_node_cids.iter().copied().collect();
        event_blocks.retain(|cid, _| !removed.contains(cid));

        // revision derives from the allocated sequence, so rev order and
        // seq order can never disagree
        let seq = self.storage.allocate_seq().await?;
        let rev = Tid::from_sequence(seq);
        let (prev, since, prev_data) = if genesis {
            (None, None, None)
        } else {
            (
                Some(self.cid),
                Some(self.commit.rev.clone()),
                Some(self.commit.data),
            )
        };

        let commit = Commit::new_unsigned(self.did().clone(), data, rev.clone(), prev)
            .sign(signing_key.as_ref())?;
        let commit_cbor = commit.to_cbor()?;
        let commit_cid = util::compute_cid(&commit_cbor)?;
        let commit_bytes = Bytes::from(commit_cbor);

        blocks.insert(commit_cid, commit_bytes.clone());
        event_blocks.insert(commit_cid, commit_bytes);

        let event_car = crate::car::write_car_bytes(commit_cid, &event_blocks).await?;

        let mut removed_cids = diff.removed_leaf_cids.clone();
        removed_cids.extend(diff.removed_node_cids.iter().copied());

        Ok((
            CommitData {
                did: self.did().clone(),
                cid: commit_cid,
                rev,
                seq,
                since,
                prev,
                data,
                prev_data,
                blocks,
                event_car,
                ops,
                blobs: Vec::new(),
                removed_cids,
            },
            tree,
            commit,
        ))
    }

    /// Apply a write batch as one signed commit
    ///
    /// The storage write is atomic; on success the in-memory MST mirror
    /// swaps to the new tree, the commit callback fires, and the signed
    /// commit returns.
    pub async fn apply_writes(&mut self, writes: Vec<RecordWrite>) -> Result<Commit> {
        let (commit_data, tree, commit) = self.format_commit_inner(writes, false).await?;

        let event = self.storage.apply_commit(commit_data.clone()).await?;
        tracing::debug!(
            did = %commit.did,
            seq = event.seq,
            rev = %commit.rev,
            ops = commit_data.ops.len(),
            "applied commit"
        );

        self.mst = tree;
        self.cid = commit_data.cid;
        self.commit = commit.clone();

        if let Some(callback) = &self.on_commit {
            callback(&event);
        }

        Ok(commit)
    }

    /// Apply an already-formatted commit
    ///
    /// For callers that batch via [`Repo::format_commit`] before persisting.
    pub async fn apply_commit(&mut self, commit_data: CommitData) -> Result<Commit> {
        let event = self.storage.apply_commit(commit_data.clone()).await?;

        let commit_bytes = self
            .storage
            .get(&commit_data.cid)
            .await?
            .ok_or_else(|| RepoError::block_not_found(commit_data.cid))?;
        let commit = Commit::from_cbor(&commit_bytes)?;

        self.mst = Mst::load(self.storage.clone(), commit.data, None);
        self.cid = commit_data.cid;
        self.commit = commit.clone();

        if let Some(callback) = &self.on_commit {
            callback(&event);
        }

        Ok(commit)
    }

    /// Export the repository as CAR bytes
    ///
    /// The head commit CID is the sole root. Without `since`, every block
    /// reachable from the head is included. With `since` (a commit revision),
    /// only blocks first written at or after that revision's sequence are
    /// included. This is the set introduced since then, not a provably minimal
    /// delta. The commit block itself is always present.
    pub async fn export_car_bytes(&self, since: Option<&Tid>) -> Result<Bytes> {
        let mut blocks: BTreeMap<Cid, Bytes> = BTreeMap::new();

        match since {
            None => {
                let commit_bytes = self
                    .storage
                    .get(&self.cid)
                    .await?
                    .ok_or_else(|| RepoError::block_not_found(self.cid))?;
                blocks.insert(self.cid, commit_bytes);

                for cid in self.mst.all_cids().await? {
                    let bytes = self
                        .storage
                        .get(&cid)
                        .await?
                        .ok_or_else(|| RepoError::block_not_found(cid))?;
                    blocks.insert(cid, bytes);
                }
            }
            Some(rev) => {
                let since_seq = rev.timestamp();
                for (cid, bytes, _) in self
                    .storage
                    .read_blocks_by_seq(since_seq, Some(self.did()))
                    .await?
                {
                    blocks.insert(cid, bytes);
                }

                let commit_bytes = self
                    .storage
                    .get(&self.cid)
                    .await?
                    .ok_or_else(|| RepoError::block_not_found(self.cid))?;
                blocks.insert(self.cid, commit_bytes);
            }
        }

        crate::car::write_car_bytes(self.cid, &blocks).await
    }

    /// Export the full repository to a CAR file
    pub async fn export_car(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::car::export_repo_car(path, self.cid, &self.mst).await
    }

    /// Deactivate this repo (read-only for sync, writes rejected)
    pub async fn deactivate(&mut self) -> Result<Event> {
        let event = self.storage.deactivate_repo(self.did()).await?;
        self.status = RepoStatus::Deactivated;
        Ok(event)
    }

    /// Reactivate this repo
    pub async fn activate(&mut self) -> Result<Event> {
        let event = self.storage.activate_repo(self.did()).await?;
        self.status = RepoStatus::Active;
        Ok(event)
    }

    /// Tombstone this repo permanently
    pub async fn tombstone(&mut self) -> Result<Event> {
        let event = self.storage.tombstone_repo(self.did()).await?;
        self.status = RepoStatus::Tombstoned;
        Ok(event)
    }

    /// Record a handle change, emitting an identity event
    pub async fn set_handle(&mut self, handle: &str) -> Result<Event> {
        self.storage.update_handle(self.did(), handle).await
    }
}

fn write_key(write: &RecordWrite) -> SmolStr {
    match write {
        RecordWrite::Create {
            collection, rkey, ..
        } => format_smolstr!("{collection}/{}", rkey.as_deref().unwrap_or_default()),
        RecordWrite::Update {
            collection, rkey, ..
        }
        | RecordWrite::Delete { collection, rkey } => format_smolstr!("{collection}/{rkey}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockStore, MemoryStorage};
    use ipld_core::ipld;

    fn test_did() -> Did {
        "did:plc:testrepo".parse().unwrap()
    }

    fn test_key() -> k256::ecdsa::SigningKey {
        k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)
    }

    async fn test_repo(storage: Arc<MemoryStorage>) -> Repo<MemoryStorage> {
        Repo::create(storage, test_did(), test_key(), None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_produces_genesis_commit() {
        let storage = Arc::new(MemoryStorage::new());
        let repo = test_repo(storage.clone()).await;

        assert_eq!(repo.commit().prev, None);
        assert_eq!(repo.commit().version, 3);
        assert!(repo.get_contents().await.unwrap().is_empty());

        // head commit block is persisted and loadable
        let head_bytes = storage.get(&repo.head()).await.unwrap().unwrap();
        let commit = Commit::from_cbor(&head_bytes).unwrap();
        assert_eq!(&commit.did, repo.did());
    }

    #[tokio::test]
    async fn create_and_read_record() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;

        let record = ipld!({"text": "hi"});
        repo.apply_writes(vec![RecordWrite::create(
            "app.bsky.feed.post",
            Some("3k2aaaaaaaaa2"),
            record.clone(),
        )])
        .await
        .unwrap();

        let got = repo
            .get_record("app.bsky.feed.post", "3k2aaaaaaaaa2")
            .await
            .unwrap();
        assert_eq!(got, Some(record));
    }

    #[tokio::test]
    async fn create_mints_tid_rkey_when_absent() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;

        repo.apply_writes(vec![RecordWrite::create(
            "app.bsky.feed.post",
            None,
            ipld!({"text": "minted"}),
        )])
        .await
        .unwrap();

        let contents = repo.get_contents().await.unwrap();
        let posts = &contents[&SmolStr::new("app.bsky.feed.post")];
        assert_eq!(posts.len(), 1);
        let rkey = posts.keys().next().unwrap();
        assert!(Tid::new(rkey).is_ok(), "minted rkey {rkey} is not a TID");
    }

    #[tokio::test]
    async fn update_and_delete_roundtrip() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;

        repo.apply_writes(vec![RecordWrite::create(
            "app.bsky.feed.post",
            Some("aaa"),
            ipld!({"text": "v1"}),
        )])
        .await
        .unwrap();

        repo.apply_writes(vec![RecordWrite::update(
            "app.bsky.feed.post",
            "aaa",
            ipld!({"text": "v2"}),
        )])
        .await
        .unwrap();
        assert_eq!(
            repo.get_record("app.bsky.feed.post", "aaa").await.unwrap(),
            Some(ipld!({"text": "v2"}))
        );

        repo.apply_writes(vec![RecordWrite::delete("app.bsky.feed.post", "aaa")])
            .await
            .unwrap();
        assert_eq!(
            repo.get_record("app.bsky.feed.post", "aaa").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn conflicting_writes_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage.clone()).await;

        let before_events = storage.event_count();
        let err = repo
            .apply_writes(vec![
                RecordWrite::create("app.bsky.feed.post", Some("dup"), ipld!({"n": 1})),
                RecordWrite::delete("app.bsky.feed.post", "dup"),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::ConflictingWrites);
        // rejected batches leave no event behind
        assert_eq!(storage.event_count(), before_events);
    }

    #[tokio::test]
    async fn validator_rejection_propagates() {
        struct RejectAll;
        impl RecordValidator for RejectAll {
            fn validate(&self, _: &str, _: &str, _: &Ipld) -> Result<()> {
                Err(RepoError::validation("nope"))
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await.with_validator(Arc::new(RejectAll));

        let err = repo
            .apply_writes(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({}),
            )])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn writes_rejected_while_deactivated() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;

        repo.deactivate().await.unwrap();
        let err = repo
            .apply_writes(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({}),
            )])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InactiveRepo);

        repo.activate().await.unwrap();
        repo.apply_writes(vec![RecordWrite::create(
            "app.bsky.feed.post",
            Some("aaa"),
            ipld!({}),
        )])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn deactivated_repo_loads_for_sync() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage.clone()).await;
        repo.deactivate().await.unwrap();

        let loaded = Repo::load(storage.clone(), "did:plc:testrepo", false)
            .await
            .unwrap();
        assert_eq!(loaded.status(), RepoStatus::Deactivated);

        // tombstoned refuses without allow_inactive
        repo.tombstone().await.unwrap();
        let err = Repo::load(storage.clone(), "did:plc:testrepo", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InactiveRepo);
        assert!(Repo::load(storage, "did:plc:testrepo", true).await.is_ok());
    }

    #[tokio::test]
    async fn format_commit_persists_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let repo = test_repo(storage.clone()).await;

        let blocks_before = storage.block_count();
        let events_before = storage.event_count();

        let commit_data = repo
            .format_commit(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({"text": "pending"}),
            )])
            .await
            .unwrap();

        assert!(!commit_data.blocks.is_empty());
        assert_eq!(storage.block_count(), blocks_before);
        assert_eq!(storage.event_count(), events_before);
    }

    #[tokio::test]
    async fn format_then_apply_commit() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage.clone()).await;

        let commit_data = repo
            .format_commit(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({"text": "batched"}),
            )])
            .await
            .unwrap();

        let commit = repo.apply_commit(commit_data.clone()).await.unwrap();
        assert_eq!(repo.head(), commit_data.cid);
        assert_eq!(commit.data, commit_data.data);
        assert_eq!(
            repo.get_record("app.bsky.feed.post", "aaa").await.unwrap(),
            Some(ipld!({"text": "batched"}))
        );
    }

    #[tokio::test]
    async fn rev_follows_allocated_seq() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage.clone()).await;
        let genesis_rev = repo.commit().rev.clone();

        let commit = repo
            .apply_writes(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({}),
            )])
            .await
            .unwrap();

        assert_eq!(commit.rev.timestamp(), storage.last_seq().await.unwrap());
        assert!(commit.rev > genesis_rev);
    }

    #[tokio::test]
    async fn chain_links_through_prev() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;
        let genesis_cid = repo.head();

        let commit = repo
            .apply_writes(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({}),
            )])
            .await
            .unwrap();

        assert_eq!(commit.prev, Some(genesis_cid));
    }

    #[tokio::test]
    async fn commit_callback_fires_with_event() {
        let storage = Arc::new(MemoryStorage::new());
        let mut repo = test_repo(storage).await;

        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_in_cb = seen.clone();
        repo.on_commit(Box::new(move |event| {
            seen_in_cb.store(event.seq, std::sync::atomic::Ordering::SeqCst);
        }));

        repo.apply_writes(vec![RecordWrite::create(
            "app.bsky.feed.post",
            Some("aaa"),
            ipld!({}),
        )])
        .await
        .unwrap();

        assert!(seen.load(std::sync::atomic::Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn load_without_key_cannot_write() {
        let storage = Arc::new(MemoryStorage::new());
        test_repo(storage.clone()).await;

        let mut loaded = Repo::load(storage, "did:plc:testrepo", false).await.unwrap();
        let err = loaded
            .apply_writes(vec![RecordWrite::create(
                "app.bsky.feed.post",
                Some("aaa"),
                ipld!({}),
            )])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Crypto);
    }
}
