//! Persisted event log entries and firehose wire frames
//!
//! Every repository mutation appends exactly one [`Event`] under a fresh,
//! process-wide sequence number. The firehose re-serializes events into
//! header+body DAG-CBOR frames for subscribers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cid::Cid;
use smol_str::SmolStr;

use crate::error::{RepoError, Result};
use crate::types::{Did, Tid};

/// Kinds of persisted events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A signed commit was applied
    Commit,
    /// Identity data (handle) changed
    Identity,
    /// Account status changed (active / deactivated / …)
    Account,
    /// Repo was tombstoned (legacy event, kept for compatibility)
    Tombstone,
    /// Handle changed (legacy event, superseded by `Identity`)
    Handle,
}

impl EventKind {
    /// Frame type tag used on the wire, e.g. `#commit`
    pub fn frame_type(&self) -> &'static str {
        match self {
            EventKind::Commit => "#commit",
            EventKind::Identity => "#identity",
            EventKind::Account => "#account",
            EventKind::Tombstone => "#tombstone",
            EventKind::Handle => "#handle",
        }
    }
}

/// Account status carried by `#account` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Voluntarily deactivated; repo readable for sync, not writable
    Deactivated,
    /// Suspended by the host
    Suspended,
    /// Taken down by the host
    Takendown,
    /// Permanently deleted
    Deleted,
}

/// A single record operation inside a commit event
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepoOp {
    /// `create`, `update`, or `delete`
    pub action: SmolStr,

    /// Record path, `collection/rkey`
    pub path: SmolStr,

    /// New record CID; `null` for deletes
    pub cid: Option<Cid>,

    /// Previous record CID for updates and deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<Cid>,
}

/// Payload of a persisted commit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPayload {
    /// CID of the signed commit block
    pub commit: Cid,
    /// Commit revision
    pub rev: Tid,
    /// Revision of the previous commit from this repo, if any
    pub since: Option<Tid>,
    /// CID of the previous commit block
    pub prev: Option<Cid>,
    /// New MST root
    pub data: Cid,
    /// Previous MST root
    pub prev_data: Option<Cid>,
    /// Record operations in this commit
    pub ops: Vec<RepoOp>,
    /// CAR of exactly the blocks needed to apply this commit
    pub blocks: Bytes,
    /// Blob CIDs referenced by this commit
    pub blobs: Vec<Cid>,
}

/// Payload variants by event kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Commit applied
    Commit(CommitPayload),
    /// Identity change
    Identity {
        /// Current handle, when known
        handle: Option<SmolStr>,
    },
    /// Account status change
    Account {
        /// Whether the account is currently active
        active: bool,
        /// Present when `active` is false
        status: Option<AccountStatus>,
    },
    /// Tombstone (legacy)
    Tombstone,
    /// Handle change (legacy)
    Handle {
        /// The new handle
        handle: SmolStr,
    },
}

/// A persisted event log entry
///
/// Appended once, never rewritten. The rollback window governs only how far
/// back the firehose will replay, not how long events are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Process-wide monotonically increasing sequence number
    pub seq: u64,
    /// Repository this event belongs to
    pub did: Did,
    /// When the event was first broadcast
    pub time: DateTime<Utc>,
    /// Kind-specific payload
    pub payload: EventPayload,
}

impl Event {
    /// The kind of this event
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Commit(_) => EventKind::Commit,
            EventPayload::Identity { .. } => EventKind::Identity,
            EventPayload::Account { .. } => EventKind::Account,
            EventPayload::Tombstone => EventKind::Tombstone,
            EventPayload::Handle { .. } => EventKind::Handle,
        }
    }

    /// Serialize to a wire frame
    pub fn to_frame(&self) -> Result<Frame> {
        let header = FrameHeader {
            op: 1,
            t: Some(SmolStr::new(self.kind().frame_type())),
        };

        let body = match &self.payload {
            EventPayload::Commit(c) => encode_body(&CommitEvt {
                seq: self.seq,
                rebase: false,
                too_big: false,
                repo: self.did.clone(),
                commit: c.commit,
                rev: c.rev.clone(),
                since: c.since.clone(),
                blocks: c.blocks.clone(),
                ops: c.ops.clone(),
                time: self.time,
                prev: c.prev,
                blobs: c.blobs.clone(),
            })?,
            EventPayload::Identity { handle } => encode_body(&IdentityEvt {
                seq: self.seq,
                did: self.did.clone(),
                time: self.time,
                handle: handle.clone(),
            })?,
            EventPayload::Account { active, status } => encode_body(&AccountEvt {
                seq: self.seq,
                did: self.did.clone(),
                time: self.time,
                active: *active,
                status: *status,
            })?,
            EventPayload::Tombstone => encode_body(&TombstoneEvt {
                seq: self.seq,
                did: self.did.clone(),
                time: self.time,
            })?,
            EventPayload::Handle { handle } => encode_body(&HandleEvt {
                seq: self.seq,
                did: self.did.clone(),
                time: self.time,
                handle: handle.clone(),
            })?,
        };

        Ok(Frame { header, body })
    }
}

fn encode_body<T: serde::Serialize>(body: &T) -> Result<Bytes> {
    let cbor = serde_ipld_dagcbor::to_vec(body).map_err(RepoError::serialization)?;
    Ok(Bytes::from(cbor))
}

// Wire format

/// Frame header: `{op, t}`; `op = 1` for messages, `-1` for errors
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameHeader {
    /// Frame operation code
    pub op: i64,

    /// Message type tag (absent on error frames)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<SmolStr>,
}

/// An encoded frame: header followed by body, each canonical DAG-CBOR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Encoded body bytes
    pub body: Bytes,
}

impl Frame {
    /// Concatenated header + body bytes as sent on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out =
            serde_ipld_dagcbor::to_vec(&self.header).map_err(RepoError::serialization)?;
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

/// `#commit` frame body
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvt {
    /// Stream sequence number
    pub seq: u64,
    /// Deprecated, always false
    pub rebase: bool,
    /// Deprecated, always false
    pub too_big: bool,
    /// Repo DID
    pub repo: Did,
    /// Commit block CID
    pub commit: Cid,
    /// Commit revision
    pub rev: Tid,
    /// Revision of this repo's previous commit
    pub since: Option<Tid>,
    /// CAR bytes of the blocks needed to apply the commit
    #[serde(with = "crate::commit::serde_bytes_helper")]
    pub blocks: Bytes,
    /// Record operations
    pub ops: Vec<RepoOp>,
    /// Broadcast timestamp
    pub time: DateTime<Utc>,
    /// Previous commit CID
    pub prev: Option<Cid>,
    /// Referenced blob CIDs
    pub blobs: Vec<Cid>,
}

/// `#identity` frame body
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdentityEvt {
    /// Stream sequence number
    pub seq: u64,
    /// Repo DID
    pub did: Did,
    /// Broadcast timestamp
    pub time: DateTime<Utc>,
    /// Current handle, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<SmolStr>,
}

/// `#account` frame body
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccountEvt {
    /// Stream sequence number
    pub seq: u64,
    /// Repo DID
    pub did: Did,
    /// Broadcast timestamp
    pub time: DateTime<Utc>,
    /// Whether the account is active
    pub active: bool,
    /// Present when inactive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
}

/// `#tombstone` frame body (legacy compatibility)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TombstoneEvt {
    /// Stream sequence number
    pub seq: u64,
    /// Repo DID
    pub did: Did,
    /// Broadcast timestamp
    pub time: DateTime<Utc>,
}

/// `#handle` frame body (legacy compatibility)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HandleEvt {
    /// Stream sequence number
    pub seq: u64,
    /// Repo DID
    pub did: Did,
    /// Broadcast timestamp
    pub time: DateTime<Utc>,
    /// The new handle
    pub handle: SmolStr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DAG_CBOR, SHA2_256};
    use sha2::{Digest, Sha256};

    fn test_cid(n: u8) -> Cid {
        let digest = Sha256::digest([n]);
        let mh = multihash::Multihash::wrap(SHA2_256, &digest).unwrap();
        Cid::new_v1(DAG_CBOR, mh)
    }

    fn test_did() -> Did {
        "did:plc:testrepo".parse().unwrap()
    }

    #[test]
    fn commit_event_frames_as_commit() {
        let event = Event {
            seq: 7,
            did: test_did(),
            time: Utc::now(),
            payload: EventPayload::Commit(CommitPayload {
                commit: test_cid(1),
                rev: Tid::from_sequence(7),
                since: None,
                prev: None,
                data: test_cid(2),
                prev_data: None,
                ops: vec![RepoOp {
                    action: SmolStr::new("create"),
                    path: SmolStr::new("app.bsky.feed.post/abc"),
                    cid: Some(test_cid(3)),
                    prev: None,
                }],
                blocks: Bytes::from_static(b"car-bytes"),
                blobs: vec![],
            }),
        };

        assert_eq!(event.kind(), EventKind::Commit);
        let frame = event.to_frame().unwrap();
        assert_eq!(frame.header.op, 1);
        assert_eq!(frame.header.t.as_deref(), Some("#commit"));

        let body: CommitEvt = serde_ipld_dagcbor::from_slice(&frame.body).unwrap();
        assert_eq!(body.seq, 7);
        assert_eq!(body.ops.len(), 1);
        assert_eq!(body.blocks.as_ref(), b"car-bytes");
        assert!(!body.rebase);
        assert!(!body.too_big);
    }

    #[test]
    fn account_event_roundtrip() {
        let event = Event {
            seq: 3,
            did: test_did(),
            time: Utc::now(),
            payload: EventPayload::Account {
                active: false,
                status: Some(AccountStatus::Deactivated),
            },
        };

        let frame = event.to_frame().unwrap();
        assert_eq!(frame.header.t.as_deref(), Some("#account"));

        let body: AccountEvt = serde_ipld_dagcbor::from_slice(&frame.body).unwrap();
        assert!(!body.active);
        assert_eq!(body.status, Some(AccountStatus::Deactivated));
    }

    #[test]
    fn tombstone_event_roundtrip() {
        let event = Event {
            seq: 9,
            did: test_did(),
            time: Utc::now(),
            payload: EventPayload::Tombstone,
        };

        let frame = event.to_frame().unwrap();
        assert_eq!(frame.header.t.as_deref(), Some("#tombstone"));
        let body: TombstoneEvt = serde_ipld_dagcbor::from_slice(&frame.body).unwrap();
        assert_eq!(body.seq, 9);
        assert_eq!(body.did, test_did());
    }

    #[test]
    fn frame_bytes_concatenate_header_and_body() {
        let event = Event {
            seq: 1,
            did: test_did(),
            time: Utc::now(),
            payload: EventPayload::Identity {
                handle: Some(SmolStr::new("alice.test")),
            },
        };

        let frame = event.to_frame().unwrap();
        let bytes = frame.to_bytes().unwrap();
        let header_len = serde_ipld_dagcbor::to_vec(&frame.header).unwrap().len();
        assert_eq!(&bytes[header_len..], frame.body.as_ref());
    }
}
