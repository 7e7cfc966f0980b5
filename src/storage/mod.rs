//! Block and event storage abstraction
//!
//! Two layers: [`BlockStore`] is plain content-addressed block CRUD, enough
//! for MST traversal; [`RepoStorage`] adds what the repo engine and firehose
//! need: sequence allocation, atomic commit application, the event log, and
//! repository lifecycle records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cid::Cid;
use smol_str::SmolStr;
use tokio::sync::Notify;

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::repo::CommitData;
use crate::types::{Did, Tid};

pub mod memory;

pub use memory::MemoryStorage;

/// Async content-addressed block storage
///
/// CID-keyed storage for MST nodes, commits, and records. `Clone` is required
/// so trees can share storage handles across versions. Implementations might
/// be an in-memory map ([`MemoryStorage`]), a SQL table, or a remote KV
/// store; the MST only ever reads through this interface.
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID, `None` if absent
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Check for a block without reading it
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Store a block, computing its CID from the bytes
    async fn put(&self, data: &[u8]) -> Result<Cid>;

    /// Store many blocks at once
    ///
    /// Implementations should make this a single batch where possible.
    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()>;

    /// Batch read: found blocks plus the CIDs that were missing
    async fn get_many(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Bytes>, Vec<Cid>)>;
}

/// Storage contract for the repo engine and firehose
///
/// On top of block CRUD this provides:
///
/// - a monotone process-wide sequence allocator (gaps only via crashes
///   between allocation and apply)
/// - atomic commit application: blocks, event record, and head move become
///   visible together or not at all
/// - sequence-indexed reads of blocks and events
/// - repository lifecycle records and the events they emit
/// - the process-wide notifier the firehose parks on
#[trait_variant::make(Send)]
pub trait RepoStorage: BlockStore {
    /// Allocate the next sequence number
    ///
    /// Allocation happens before the event becomes visible; a crash in
    /// between leaves a permanent gap, which the firehose tolerates.
    async fn allocate_seq(&self) -> Result<u64>;

    /// Highest sequence number allocated so far
    async fn last_seq(&self) -> Result<u64>;

    /// Store one block owned by `did`, stamping the current sequence iff the
    /// block is new. Returns the CID and whether it was created.
    async fn write_block(&self, did: &Did, data: Bytes) -> Result<(Cid, bool)>;

    /// Apply a commit atomically
    ///
    /// Writes every new block stamped with `commit.seq`, persists the commit
    /// event, and advances the repo head, as one unit. Readers observe all of
    /// it or none of it. Returns the persisted event.
    async fn apply_commit(&self, commit: CommitData) -> Result<Event>;

    /// Blocks first written at `since` or later, ascending by sequence
    async fn read_blocks_by_seq(
        &self,
        since: u64,
        repo: Option<&Did>,
    ) -> Result<Vec<(Cid, Bytes, u64)>>;

    /// Events with seq >= `since`, ascending
    async fn read_events_by_seq(&self, since: u64, repo: Option<&Did>) -> Result<Vec<Event>>;

    /// Append a non-commit event (identity, account, …) under a fresh seq
    async fn sequence_event(&self, did: &Did, payload: EventPayload) -> Result<Event>;

    /// Current head commit CID for a repo
    async fn head(&self, did: &Did) -> Result<Option<Cid>>;

    /// Load a repo record by DID or handle
    ///
    /// Deactivated repos return normally (callers gate mutation); tombstoned
    /// repos fail with `InactiveRepo` unless `allow_inactive` is set.
    async fn load_repo_entry(&self, ident: &str, allow_inactive: bool) -> Result<RepoEntry>;

    /// Register a new repository record
    async fn create_repo_entry(&self, entry: RepoEntry) -> Result<()>;

    /// Mark a repo deactivated and emit the account event
    async fn deactivate_repo(&self, did: &Did) -> Result<Event>;

    /// Mark a repo active again and emit the account event
    async fn activate_repo(&self, did: &Did) -> Result<Event>;

    /// Tombstone a repo and emit the tombstone event
    async fn tombstone_repo(&self, did: &Did) -> Result<Event>;

    /// Record a handle change and emit the identity event
    async fn update_handle(&self, did: &Did, handle: &str) -> Result<Event>;

    /// The process-wide notifier signalled whenever an event is appended
    fn events_notify(&self) -> Arc<Notify>;
}

/// Repository lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    /// Writable and readable
    Active,
    /// Read-only for sync; mutation rejected
    Deactivated,
    /// Permanently gone; load rejected without `allow_inactive`
    Tombstoned,
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepoStatus::Active => "active",
            RepoStatus::Deactivated => "deactivated",
            RepoStatus::Tombstoned => "tombstoned",
        })
    }
}

/// A repository record as kept by storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoEntry {
    /// Repository DID
    pub did: Did,
    /// Head commit CID
    pub head: Cid,
    /// Head commit revision
    pub rev: Tid,
    /// Registered handle, if any
    pub handle: Option<SmolStr>,
    /// Lifecycle status
    pub status: RepoStatus,
    /// Public signing key bytes (compressed), when registered
    pub signing_key: Option<Bytes>,
    /// Public rotation key bytes, when registered
    pub rotation_key: Option<Bytes>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
