//! MST node representations

use std::fmt;

use bytes::Bytes;
use cid::Cid;
use smol_str::SmolStr;

use crate::mst::Mst;

/// Entry in an MST node: either a subtree pointer or a leaf
///
/// In memory a node is a flat interleaved list, e.g.
/// `[Tree, Leaf, Leaf, Tree, Leaf]`, which keeps splice/split/merge
/// operations to plain `Vec` surgery. The wire format is different; see
/// [`NodeData`].
#[derive(Clone)]
pub enum NodeEntry<S> {
    /// Subtree, lazily loaded from storage when first visited
    Tree(Mst<S>),

    /// Leaf holding a full (uncompressed) key and the record CID
    Leaf {
        /// Record path, `collection/rkey`
        key: SmolStr,
        /// CID of the record block
        value: Cid,
    },
}

impl<S> fmt::Debug for NodeEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(_) => f.write_str("Tree(..)"),
            NodeEntry::Leaf { key, value } => write!(f, "Leaf({key} -> {value})"),
        }
    }
}

impl<S> NodeEntry<S> {
    /// True if this entry is a subtree pointer
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// True if this entry is a leaf
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// The key, if this entry is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }
}

// Wire format (canonical DAG-CBOR, prefix-compressed)

/// Serialized MST node: `{ l: CID|null, e: [entries] }`
///
/// Every `Option` field serializes as an explicit `null`; skipping absent
/// fields would change the canonical bytes and therefore the CID.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Leftmost subtree pointer, covering keys below the first entry
    #[serde(rename = "l")]
    pub left: Option<Cid>,

    /// Entries in ascending key order, prefix-compressed
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,
}

/// Serialized node entry
///
/// Field declaration order (k, p, t, v) matches canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    /// Key suffix after the shared prefix, as a CBOR byte string
    #[serde(rename = "k", with = "crate::commit::serde_bytes_helper")]
    pub key_suffix: Bytes,

    /// Number of bytes shared with the previous key in this node
    #[serde(rename = "p")]
    pub prefix_len: u8,

    /// Right subtree pointer, covering keys between this entry and the next
    #[serde(rename = "t")]
    pub tree: Option<Cid>,

    /// CID of the record block
    #[serde(rename = "v")]
    pub value: Cid,
}
