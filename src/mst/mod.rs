//! Merkle Search Tree
//!
//! An ordered, persistent, content-addressed map from record paths to record
//! CIDs. The tree's shape is a pure function of its contents: the same
//! key/value mapping always produces the same root CID, whatever order the
//! keys were inserted in.

pub mod cursor;
pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use cursor::{Cursor, Position};
pub use diff::{DiffUpdate, TreeDiff};
pub use node::NodeEntry;
pub use tree::{Mst, WriteOp};

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias for recursive tree operations
pub(crate) type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
