//! Personal data server core for an AT-Protocol-style federated network.
//!
//! This crate provides the storage-agnostic heart of a PDS:
//!
//! - **MST (Merkle Search Tree)**: an ordered, content-addressed key/value
//!   index whose shape depends only on its contents, never on insertion order
//! - **Repo**: signed commit chains over batched record writes, with
//!   diff-and-proof CAR bundles for every commit
//! - **Storage**: a pluggable block/event store contract with an in-memory
//!   reference implementation
//! - **Firehose**: a durable, monotonically-sequenced event log with
//!   per-subscriber pumps, a rollback window, and gap reconciliation
//!
//! # Design Philosophy
//!
//! - MST operations are immutable: mutations return a new tree sharing
//!   unchanged subtrees with the old one
//! - One writer per repository; readers never lock immutable blocks
//! - Commits are all-or-nothing: a failed apply leaves no blocks, no event,
//!   and no head update behind
//! - Wire bytes are canonical DAG-CBOR throughout, so equal content means
//!   equal CIDs across implementations
//!
//! # Example
//!
//! ```rust,ignore
//! use twill::{MemoryStorage, Repo, RecordWrite};
//!
//! # async fn example() -> twill::Result<()> {
//! let storage = std::sync::Arc::new(MemoryStorage::new());
//! let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
//! let mut repo =
//!     Repo::create(storage, "did:plc:alice".parse()?, key, None, None).await?;
//!
//! let commit = repo
//!     .apply_writes(vec![RecordWrite::create(
//!         "app.bsky.feed.post",
//!         None,
//!         ipld_core::ipld!({"text": "hello"}),
//!     )])
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) import and export
pub mod car;
/// Signed commit structures and key traits
pub mod commit;
pub mod error;
/// Persisted events and firehose wire frames
pub mod event;
/// The subscribeRepos firehose pump
pub mod firehose;
/// Merkle Search Tree implementation
pub mod mst;
/// Repository engine
pub mod repo;
/// Block and event storage abstraction
pub mod storage;
/// Protocol string types (TIDs, DIDs)
pub mod types;

pub use commit::{Commit, SigningKey, Verifier};
pub use error::{ErrorKind, RepoError, Result};
pub use event::{Event, EventKind};
pub use firehose::{Firehose, FirehoseConfig, FirehoseItem};
pub use mst::{Mst, TreeDiff};
pub use repo::{CommitData, RecordValidator, RecordWrite, Repo};
pub use storage::{BlockStore, MemoryStorage, RepoEntry, RepoStatus, RepoStorage};
pub use types::{Did, Ticker, Tid};

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR: u64 = 0x71;

/// SHA2-256 multihash code
pub const SHA2_256: u64 = 0x12;
