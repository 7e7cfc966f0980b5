//! In-memory storage implementation
//!
//! The reference back-end and the test oracle. A single lock around the
//! whole state gives commit application its all-or-nothing visibility; no
//! await point ever holds the lock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::Utc;
use cid::Cid;
use tokio::sync::Notify;

use crate::error::{ErrorKind, RepoError, Result};
use crate::event::{AccountStatus, Event, EventPayload};
use crate::mst::util;
use crate::repo::CommitData;
use crate::storage::{BlockStore, RepoEntry, RepoStatus, RepoStorage};
use crate::types::Did;

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Bytes,
    /// Event sequence this block was first written under (0 = unsequenced)
    seq: u64,
    did: Option<Did>,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<Cid, StoredBlock>,
    events: BTreeMap<u64, Event>,
    repos: BTreeMap<Did, RepoEntry>,
    last_seq: u64,
}

/// In-memory storage
///
/// Cloning shares the underlying state, so a storage handle can be passed
/// to trees, repos, and the firehose alike.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Number of blocks stored
    pub fn block_count(&self) -> usize {
        self.inner.read().unwrap().blocks.len()
    }

    /// Number of events in the log
    pub fn event_count(&self) -> usize {
        self.inner.read().unwrap().events.len()
    }

    fn append_event(inner: &mut Inner, did: &Did, payload: EventPayload) -> Event {
        inner.last_seq += 1;
        let event = Event {
            seq: inner.last_seq,
            did: did.clone(),
            time: Utc::now(),
            payload,
        };
        inner.events.insert(event.seq, event.clone());
        event
    }

    fn entry_mut<'a>(inner: &'a mut Inner, did: &Did) -> Result<&'a mut RepoEntry> {
        inner
            .repos
            .get_mut(did)
            .ok_or_else(|| RepoError::repo_not_found(did))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStorage {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .blocks
            .get(cid)
            .map(|b| b.data.clone()))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.inner.read().unwrap().blocks.contains_key(cid))
    }

    async fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = util::compute_cid(data)?;
        let mut inner = self.inner.write().unwrap();
        inner.blocks.entry(cid).or_insert_with(|| StoredBlock {
            data: Bytes::copy_from_slice(data),
            seq: 0,
            did: None,
        });
        Ok(cid)
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for (cid, data) in blocks {
            inner.blocks.entry(cid).or_insert_with(|| StoredBlock {
                data,
                seq: 0,
                did: None,
            });
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<(BTreeMap<Cid, Bytes>, Vec<Cid>)> {
        let inner = self.inner.read().unwrap();
        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match inner.blocks.get(cid) {
                Some(block) => {
                    found.insert(*cid, block.data.clone());
                }
                None => missing.push(*cid),
            }
        }
        Ok((found, missing))
    }
}

impl RepoStorage for MemoryStorage {
    async fn allocate_seq(&self) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        inner.last_seq += 1;
        Ok(inner.last_seq)
    }

    async fn last_seq(&self) -> Result<u64> {
        Ok(self.inner.read().unwrap().last_seq)
    }

    async fn write_block(&self, did: &Did, data: Bytes) -> Result<(Cid, bool)> {
        let cid = util::compute_cid(&data)?;
        let mut inner = self.inner.write().unwrap();
        let seq = inner.last_seq;
        let created = !inner.blocks.contains_key(&cid);
        if created {
            inner.blocks.insert(
                cid,
                StoredBlock {
                    data,
                    seq,
                    did: Some(did.clone()),
                },
            );
        }
        Ok((cid, created))
    }

    async fn apply_commit(&self, commit: CommitData) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();

            match inner.repos.get(&commit.did) {
                Some(entry) if entry.status == RepoStatus::Tombstoned => {
                    return Err(RepoError::inactive_repo(&commit.did, entry.status));
                }
                Some(entry) => {
                    // single-writer invariant: the commit must extend the
                    // current head (or be the pre-registered head itself)
                    let extends_head = commit.prev == Some(entry.head);
                    if !extends_head && entry.head != commit.cid {
                        return Err(RepoError::new(ErrorKind::Storage, None).with_context(
                            format!(
                                "commit does not extend head of {}: prev {:?}, head {}",
                                commit.did, commit.prev, entry.head
                            ),
                        ));
                    }
                }
                None => {
                    if commit.prev.is_some() {
                        return Err(RepoError::repo_not_found(&commit.did));
                    }
                }
            }

            for (cid, data) in &commit.blocks {
                if !inner.blocks.contains_key(cid) {
                    inner.blocks.insert(
                        *cid,
                        StoredBlock {
                            data: data.clone(),
                            seq: commit.seq,
                            did: Some(commit.did.clone()),
                        },
                    );
                }
            }

            let event = Event {
                seq: commit.seq,
                did: commit.did.clone(),
                time: Utc::now(),
                payload: EventPayload::Commit(commit.to_payload()),
            };
            inner.events.insert(event.seq, event.clone());
            inner.last_seq = inner.last_seq.max(commit.seq);

            let now = Utc::now();
            let entry = inner
                .repos
                .entry(commit.did.clone())
                .or_insert_with(|| RepoEntry {
                    did: commit.did.clone(),
                    head: commit.cid,
                    rev: commit.rev.clone(),
                    handle: None,
                    status: RepoStatus::Active,
                    signing_key: None,
                    rotation_key: None,
                    created_at: now,
                });
            entry.head = commit.cid;
            entry.rev = commit.rev.clone();

            event
        };

        self.notify.notify_waiters();
        Ok(event)
    }

    async fn read_blocks_by_seq(
        &self,
        since: u64,
        repo: Option<&Did>,
    ) -> Result<Vec<(Cid, Bytes, u64)>> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<(Cid, Bytes, u64)> = inner
            .blocks
            .iter()
            .filter(|(_, b)| b.seq >= since)
            .filter(|(_, b)| repo.is_none_or(|did| b.did.as_ref() == Some(did)))
            .map(|(cid, b)| (*cid, b.data.clone(), b.seq))
            .collect();
        out.sort_by_key(|(cid, _, seq)| (*seq, *cid));
        Ok(out)
    }

    async fn read_events_by_seq(&self, since: u64, repo: Option<&Did>) -> Result<Vec<Event>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .events
            .range(since..)
            .map(|(_, event)| event)
            .filter(|event| repo.is_none_or(|did| &event.did == did))
            .cloned()
            .collect())
    }

    async fn sequence_event(&self, did: &Did, payload: EventPayload) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            Self::append_event(&mut inner, did, payload)
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn head(&self, did: &Did) -> Result<Option<Cid>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .repos
            .get(did)
            .map(|entry| entry.head))
    }

    async fn load_repo_entry(&self, ident: &str, allow_inactive: bool) -> Result<RepoEntry> {
        let inner = self.inner.read().unwrap();
        let entry = inner
            .repos
            .values()
            .find(|e| e.did.as_str() == ident || e.handle.as_deref() == Some(ident))
            .ok_or_else(|| RepoError::repo_not_found(ident))?;

        if entry.status == RepoStatus::Tombstoned && !allow_inactive {
            return Err(RepoError::inactive_repo(&entry.did, entry.status));
        }

        Ok(entry.clone())
    }

    async fn create_repo_entry(&self, entry: RepoEntry) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.repos.contains_key(&entry.did) {
            return Err(RepoError::new(ErrorKind::Storage, None)
                .with_context(format!("repo already exists: {}", entry.did)));
        }
        inner.repos.insert(entry.did.clone(), entry);
        Ok(())
    }

    async fn deactivate_repo(&self, did: &Did) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            Self::entry_mut(&mut inner, did)?.status = RepoStatus::Deactivated;
            Self::append_event(
                &mut inner,
                did,
                EventPayload::Account {
                    active: false,
                    status: Some(AccountStatus::Deactivated),
                },
            )
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn activate_repo(&self, did: &Did) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            Self::entry_mut(&mut inner, did)?.status = RepoStatus::Active;
            Self::append_event(
                &mut inner,
                did,
                EventPayload::Account {
                    active: true,
                    status: None,
                },
            )
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn tombstone_repo(&self, did: &Did) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            Self::entry_mut(&mut inner, did)?.status = RepoStatus::Tombstoned;
            Self::append_event(&mut inner, did, EventPayload::Tombstone)
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    async fn update_handle(&self, did: &Did, handle: &str) -> Result<Event> {
        let event = {
            let mut inner = self.inner.write().unwrap();
            Self::entry_mut(&mut inner, did)?.handle = Some(handle.into());
            Self::append_event(
                &mut inner,
                did,
                EventPayload::Identity {
                    handle: Some(handle.into()),
                },
            )
        };
        self.notify.notify_waiters();
        Ok(event)
    }

    fn events_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_did() -> Did {
        "did:plc:testrepo".parse().unwrap()
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = MemoryStorage::new();
        let cid = store.put(b"some block").await.unwrap();

        assert!(store.has(&cid).await.unwrap());
        assert_eq!(
            store.get(&cid).await.unwrap().as_deref(),
            Some(&b"some block"[..])
        );
        assert_eq!(store.get(&Cid::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_many_reports_missing() {
        let store = MemoryStorage::new();
        let a = store.put(b"a").await.unwrap();
        let b = store.put(b"b").await.unwrap();
        let missing = util::compute_cid(b"never stored").unwrap();

        let (found, absent) = store.get_many(&[a, missing, b]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(absent, vec![missing]);
    }

    #[tokio::test]
    async fn allocate_seq_is_monotone() {
        let store = MemoryStorage::new();
        let mut prev = 0;
        for _ in 0..100 {
            let seq = store.allocate_seq().await.unwrap();
            assert!(seq > prev);
            prev = seq;
        }
        assert_eq!(store.last_seq().await.unwrap(), prev);
    }

    #[tokio::test]
    async fn write_block_stamps_only_new_blocks() {
        let store = MemoryStorage::new();
        let did = test_did();

        let (cid, created) = store
            .write_block(&did, Bytes::from_static(b"block"))
            .await
            .unwrap();
        assert!(created);

        let (cid2, created2) = store
            .write_block(&did, Bytes::from_static(b"block"))
            .await
            .unwrap();
        assert_eq!(cid, cid2);
        assert!(!created2);
    }

    #[tokio::test]
    async fn sequence_event_appends_and_notifies() {
        let store = MemoryStorage::new();
        let did = test_did();

        let notify = store.events_notify();
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let event = store
            .sequence_event(
                &did,
                EventPayload::Identity {
                    handle: Some("alice.test".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(event.seq, 1);
        notified.await; // already signalled

        let events = store.read_events_by_seq(0, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], event);
    }

    #[tokio::test]
    async fn read_events_filters_by_repo_and_seq() {
        let store = MemoryStorage::new();
        let alice = test_did();
        let bob: Did = "did:plc:bobrepo".parse().unwrap();

        for _ in 0..3 {
            store
                .sequence_event(&alice, EventPayload::Tombstone)
                .await
                .unwrap();
            store
                .sequence_event(&bob, EventPayload::Tombstone)
                .await
                .unwrap();
        }

        let all = store.read_events_by_seq(0, None).await.unwrap();
        assert_eq!(all.len(), 6);
        let seqs: Vec<u64> = all.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);

        let bobs = store.read_events_by_seq(0, Some(&bob)).await.unwrap();
        assert_eq!(bobs.len(), 3);

        let late = store.read_events_by_seq(5, None).await.unwrap();
        assert_eq!(late.len(), 2);
    }

    #[tokio::test]
    async fn lifecycle_transitions_emit_events() {
        let store = MemoryStorage::new();
        let did = test_did();
        store
            .create_repo_entry(RepoEntry {
                did: did.clone(),
                head: Cid::default(),
                rev: crate::types::Tid::from_sequence(1),
                handle: Some("alice.test".into()),
                status: RepoStatus::Active,
                signing_key: None,
                rotation_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let event = store.deactivate_repo(&did).await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Account { active: false, .. }
        ));
        let entry = store.load_repo_entry("did:plc:testrepo", false).await.unwrap();
        assert_eq!(entry.status, RepoStatus::Deactivated);

        let event = store.activate_repo(&did).await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Account { active: true, .. }
        ));

        let event = store.tombstone_repo(&did).await.unwrap();
        assert!(matches!(event.payload, EventPayload::Tombstone));

        // tombstoned repos refuse to load without allow_inactive
        let err = store
            .load_repo_entry("did:plc:testrepo", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InactiveRepo);
        assert!(store.load_repo_entry("did:plc:testrepo", true).await.is_ok());
    }

    #[tokio::test]
    async fn load_repo_entry_by_handle() {
        let store = MemoryStorage::new();
        let did = test_did();
        store
            .create_repo_entry(RepoEntry {
                did: did.clone(),
                head: Cid::default(),
                rev: crate::types::Tid::from_sequence(1),
                handle: Some("alice.test".into()),
                status: RepoStatus::Active,
                signing_key: None,
                rotation_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let entry = store.load_repo_entry("alice.test", false).await.unwrap();
        assert_eq!(entry.did, did);

        let err = store.load_repo_entry("nobody.test", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RepoNotFound);
    }

    #[tokio::test]
    async fn update_handle_emits_identity() {
        let store = MemoryStorage::new();
        let did = test_did();
        store
            .create_repo_entry(RepoEntry {
                did: did.clone(),
                head: Cid::default(),
                rev: crate::types::Tid::from_sequence(1),
                handle: None,
                status: RepoStatus::Active,
                signing_key: None,
                rotation_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let event = store.update_handle(&did, "alice2.test").await.unwrap();
        assert!(matches!(event.payload, EventPayload::Identity { .. }));
        let entry = store.load_repo_entry(did.as_str(), false).await.unwrap();
        assert_eq!(entry.handle.as_deref(), Some("alice2.test"));
    }
}
