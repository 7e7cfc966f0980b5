//! MST utility functions: content addressing, key heights, wire conversion

use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

use super::node::{NodeData, NodeEntry, TreeEntry};
use super::Mst;
use crate::error::{MstError, Result};
use crate::storage::BlockStore;
use crate::{DAG_CBOR, SHA2_256};

/// Maximum record path length in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Compute the CID of already-encoded DAG-CBOR bytes
pub fn compute_cid(data: &[u8]) -> Result<Cid> {
    let digest = Sha256::digest(data);
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, &digest)
        .map_err(|e| MstError::InvalidNode(e.to_string()))?;
    Ok(Cid::new_v1(DAG_CBOR, mh))
}

/// Encode a value to DAG-CBOR and compute its CID
pub fn cid_for<T: serde::Serialize>(value: &T) -> Result<(Cid, Bytes)> {
    let cbor = serde_ipld_dagcbor::to_vec(value).map_err(|e| MstError::Serialization(Box::new(e)))?;
    let cid = compute_cid(&cbor)?;
    Ok((cid, Bytes::from(cbor)))
}

/// Height of a key: `floor(leading_zero_bits(sha256(key)) / 4)`
///
/// Partitions keys into levels deterministically; a node holds keys of one
/// height, with lower heights strictly below it.
pub fn key_height(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 4
}

fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validate a record path for use as an MST key
///
/// A key must split on `/` into exactly two non-empty segments, a collection
/// NSID and an rkey, each restricted to `[a-zA-Z0-9._:~-]`, with the whole
/// key at most [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }

    let Some((collection, rkey)) = key.split_once('/') else {
        return Err(MstError::InvalidKeyPath {
            key: key.to_string(),
        }
        .into());
    };
    if collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
        return Err(MstError::InvalidKeyPath {
            key: key.to_string(),
        }
        .into());
    }

    let segment_ok = |segment: &str| {
        segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'))
    };
    if !segment_ok(collection) || !segment_ok(rkey) {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Length of the shared byte prefix of two keys
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Convert the flat in-memory entry list to the wire format
///
/// - a leading `Tree` becomes the `l` pointer
/// - each `Leaf` becomes an entry, prefix-compressed against the previous key
/// - a `Tree` following a `Leaf` becomes that entry's `t` pointer
pub fn serialize_node_data<S: BlockStore + Sync + 'static>(
    entries: &[NodeEntry<S>],
) -> super::BoxFut<'_, Result<NodeData>> {
    Box::pin(async move {
        let mut data = NodeData {
            left: None,
            entries: Vec::new(),
        };

        let mut i = 0;
        if let Some(NodeEntry::Tree(tree)) = entries.first() {
            data.left = Some(tree.root().await?);
            i += 1;
        }

        let mut last_key = SmolStr::default();
        while i < entries.len() {
            let NodeEntry::Leaf { key, value } = &entries[i] else {
                return Err(MstError::InvalidNode("adjacent subtrees in entry list".into()).into());
            };
            i += 1;

            let prefix_len = common_prefix_len(&last_key, key);
            let suffix = &key.as_bytes()[prefix_len..];

            let tree = if let Some(NodeEntry::Tree(tree)) = entries.get(i) {
                i += 1;
                Some(tree.root().await?)
            } else {
                None
            };

            data.entries.push(TreeEntry {
                key_suffix: Bytes::copy_from_slice(suffix),
                prefix_len: prefix_len.try_into().map_err(|_| {
                    MstError::InvalidNode(format!("prefix length {prefix_len} exceeds u8"))
                })?,
                tree,
                value: *value,
            });

            last_key = key.clone();
        }

        Ok(data)
    })
}

/// Convert the wire format back to the flat in-memory entry list
///
/// Full keys are reconstructed from the prefix lengths; subtree pointers
/// become lazily-loaded [`NodeEntry::Tree`] entries.
pub fn deserialize_node_data<S: BlockStore + Sync + 'static>(
    storage: Arc<S>,
    data: &NodeData,
    height: Option<usize>,
) -> Result<Vec<NodeEntry<S>>> {
    let child_height = height.map(|h| h.saturating_sub(1));
    let mut entries = Vec::with_capacity(data.entries.len() * 2 + 1);

    if let Some(left) = data.left {
        entries.push(NodeEntry::Tree(Mst::load(
            storage.clone(),
            left,
            child_height,
        )));
    }

    let mut last_key = String::new();
    for entry in &data.entries {
        let suffix = std::str::from_utf8(&entry.key_suffix)
            .map_err(|e| MstError::InvalidNode(format!("non-UTF-8 key suffix: {e}")))?;
        let prefix_len = entry.prefix_len as usize;
        if prefix_len > last_key.len() {
            return Err(MstError::InvalidNode(format!(
                "prefix length {prefix_len} exceeds previous key length {}",
                last_key.len()
            ))
            .into());
        }

        last_key.truncate(prefix_len);
        last_key.push_str(suffix);

        entries.push(NodeEntry::Leaf {
            key: SmolStr::new(&last_key),
            value: entry.value,
        });

        if let Some(tree) = entry.tree {
            entries.push(NodeEntry::Tree(Mst::load(
                storage.clone(),
                tree,
                child_height,
            )));
        }
    }

    Ok(entries)
}
