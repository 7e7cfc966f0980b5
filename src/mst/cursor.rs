//! Ordered MST traversal cursor

use cid::Cid;
use smol_str::SmolStr;

use super::node::NodeEntry;
use super::tree::Mst;
use super::BoxFut;
use crate::error::Result;
use crate::storage::BlockStore;

/// Where a cursor currently points
#[derive(Debug, Clone)]
pub enum Position<S> {
    /// At a leaf
    Leaf {
        /// Leaf key
        key: SmolStr,
        /// Record CID
        cid: Cid,
    },

    /// At a subtree root, not yet descended into it
    Tree {
        /// The subtree
        mst: Mst<S>,
    },

    /// Past the last entry
    End,
}

/// Cursor over an MST in ascending key order
///
/// Supports stepping into subtrees one entry at a time (`advance`) or
/// hopping over a whole subtree (`skip_subtree`), which is what lets
/// diffing short-circuit identical subtrees by CID.
pub struct Cursor<S> {
    /// Stack of (entries, index) for each node we are inside
    path: Vec<(Vec<NodeEntry<S>>, usize)>,
    position: Position<S>,
    /// Height of the node currently being walked, tracked on descent
    heights: Vec<usize>,
}

impl<S: BlockStore + Sync + 'static> Cursor<S> {
    /// Start a cursor at a tree's root
    ///
    /// The initial position is the root itself; call [`Cursor::advance`] to
    /// reach the first entry.
    pub fn new(root: Mst<S>) -> Self {
        Self {
            path: Vec::new(),
            position: Position::Tree { mst: root },
            heights: Vec::new(),
        }
    }

    /// Current position
    pub fn position(&self) -> &Position<S> {
        &self.position
    }

    /// True once the traversal is exhausted
    pub fn is_end(&self) -> bool {
        matches!(self.position, Position::End)
    }

    /// Height of the node the cursor is walking inside
    ///
    /// Before descending into the root this is the root's height plus one,
    /// so comparisons against entries inside another tree line up.
    pub async fn height(&self) -> Result<usize> {
        if let Some(h) = self.heights.last() {
            return Ok(*h);
        }
        match &self.position {
            Position::Tree { mst } => Ok(mst.height().await? + 1),
            _ => Ok(0),
        }
    }

    /// Move to the next entry in key order, descending into subtrees
    pub async fn advance(&mut self) -> Result<()> {
        match self.position.clone() {
            Position::End => Ok(()),
            Position::Leaf { .. } => self.step_over().await,
            Position::Tree { mst } => self.step_into(mst).await,
        }
    }

    /// Skip the entry at the current position without entering it
    pub async fn skip_subtree(&mut self) -> Result<()> {
        self.step_over().await
    }

    fn step_over(&mut self) -> BoxFut<'_, Result<()>> {
        Box::pin(async move {
            let Some((entries, index)) = self.path.last_mut() else {
                self.position = Position::End;
                return Ok(());
            };

            *index += 1;
            if let Some(entry) = entries.get(*index) {
                self.position = position_of(entry);
                Ok(())
            } else {
                self.path.pop();
                self.heights.pop();
                self.step_over().await
            }
        })
    }

    async fn step_into(&mut self, mst: Mst<S>) -> Result<()> {
        let height = mst.height().await?;
        let entries = mst.entries().await?.to_vec();

        if entries.is_empty() {
            self.step_over().await
        } else {
            self.position = position_of(&entries[0]);
            self.heights.push(height);
            self.path.push((entries, 0));
            Ok(())
        }
    }
}

fn position_of<S: BlockStore>(entry: &NodeEntry<S>) -> Position<S> {
    match entry {
        NodeEntry::Leaf { key, value } => Position::Leaf {
            key: key.clone(),
            cid: *value,
        },
        NodeEntry::Tree(tree) => Position::Tree { mst: tree.clone() },
    }
}
