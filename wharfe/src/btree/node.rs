//! B+Tree Node Types
//!
//! A node is three parallel arrays of kv-log offsets plus a leaf flag. The
//! `vals` array carries one more slot than the key arrays: on a leaf the
//! extra slot is always zero, on an internal node every slot is a child
//! block offset. Separator `i` of an internal node repeats the first
//! `(key, docid)` offsets of the subtree under child `i + 1`.
//!
//! Searching, the read-side traversals and the verification walks live
//! here; insert and remove have modules of their own.

use std::cmp::Ordering;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::kv::WharfeKey;
use crate::store::Store;

/// Serialized bytes of a node holding no entries: the variant tag, three
/// array lengths and the trailing value slot.
pub(crate) const BLOCK_OVERHEAD: usize = 36;

/// Serialized bytes per entry: a key, a docid and a value offset.
pub(crate) const ENTRY_COST: usize = 24;

/// The two node kinds share one layout and differ in what `vals` means.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Node {
    Leaf(NodeData),
    Internal(NodeData),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct NodeData {
    /// Offset of this node's block in the index file.
    #[serde(skip)]
    pub(crate) offset: i64,
    /// Not yet written at its offset.
    #[serde(skip)]
    pub(crate) dirty: bool,
    pub(crate) keys: Vec<i64>,
    pub(crate) docids: Vec<i64>,
    pub(crate) vals: Vec<i64>,
}

impl NodeData {
    pub(crate) fn fresh(offset: i64) -> Self {
        Self {
            offset,
            dirty: true,
            keys: Vec::new(),
            docids: Vec::new(),
            vals: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Index of the smallest entry that is not less than `key`, along with
    /// the resolved offsets when the comparator hit an exact key (and, with
    /// `check_docid`, docid) match. Returns `len()` when every entry is
    /// smaller. Callers reuse the resolved offsets rather than re-reading
    /// the log.
    pub(crate) async fn search_ge(
        &self,
        store: &Store,
        key: &dyn WharfeKey,
        check_docid: bool,
    ) -> Result<(usize, i64, i64)> {
        if self.keys.is_empty() {
            return Ok((0, -1, -1));
        }
        let (mut low, mut high) = (0, self.keys.len());
        while high - low > 1 {
            let mid = (high + low) / 2;
            let (ord, _, _) = store
                .compare_key(key, self.keys[mid], self.docids[mid], check_docid)
                .await?;
            if ord == Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }
        let (ord, kpos, dpos) = store
            .compare_key(key, self.keys[low], self.docids[low], check_docid)
            .await?;
        if ord != Ordering::Greater {
            return Ok((low, kpos, dpos));
        }
        if kpos < 0 && high < self.keys.len() {
            let (_, kpos, dpos) = store
                .compare_key(key, self.keys[high], self.docids[high], check_docid)
                .await?;
            return Ok((high, kpos, dpos));
        }
        Ok((high, kpos, dpos))
    }

    /// Exact `(key, docid)` search within a leaf.
    pub(crate) async fn search_equal_leaf(
        &self,
        store: &Store,
        key: &dyn WharfeKey,
    ) -> Result<(usize, bool)> {
        if self.keys.is_empty() {
            return Ok((0, false));
        }
        let (mut low, mut high) = (0, self.keys.len());
        while high - low > 1 {
            let mid = (high + low) / 2;
            let (ord, _, _) = store
                .compare_key(key, self.keys[mid], self.docids[mid], true)
                .await?;
            if ord == Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }
        let (ord, _, _) = store
            .compare_key(key, self.keys[low], self.docids[low], true)
            .await?;
        if ord == Ordering::Equal {
            Ok((low, true))
        } else {
            Ok((high, false))
        }
    }

    /// Exact `(key, docid)` search within an internal node. A hit reports
    /// the child slot to the right of the matching separator.
    pub(crate) async fn search_equal_internal(
        &self,
        store: &Store,
        key: &dyn WharfeKey,
    ) -> Result<(usize, bool)> {
        if self.keys.is_empty() {
            return Ok((0, false));
        }
        let (mut low, mut high) = (0, self.keys.len());
        while high - low > 1 {
            let mid = (high + low) / 2;
            let (ord, _, _) = store
                .compare_key(key, self.keys[mid], self.docids[mid], true)
                .await?;
            if ord == Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }
        let (ord, _, _) = store
            .compare_key(key, self.keys[low], self.docids[low], true)
            .await?;
        match ord {
            Ordering::Less => Ok((low, false)),
            Ordering::Equal => Ok((high, true)),
            Ordering::Greater => Ok((high, false)),
        }
    }
}

impl Node {
    /// A leaf holding nothing, the root of a new tree.
    pub(crate) fn empty_leaf(offset: i64) -> Self {
        let mut data = NodeData::fresh(offset);
        data.vals.push(0);
        Node::Leaf(data)
    }

    pub(crate) fn data(&self) -> &NodeData {
        match self {
            Node::Leaf(data) => data,
            Node::Internal(data) => data,
        }
    }

    pub(crate) fn data_mut(&mut self) -> &mut NodeData {
        match self {
            Node::Leaf(data) => data,
            Node::Internal(data) => data,
        }
    }

    pub(crate) fn offset(&self) -> i64 {
        self.data().offset
    }

    pub(crate) fn len(&self) -> usize {
        self.data().len()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Rebalance partners must be of one kind.
    pub(crate) fn same_kind(&self, other: &Node) -> bool {
        self.is_leaf() == other.is_leaf()
    }

    /// Clone this node onto a fresh block from the free-list. The original
    /// stays untouched for readers of the previous root.
    pub(crate) async fn copy_on_write(&self, store: &Store) -> Node {
        let mut data = self.data().clone();
        data.offset = store.alloc_block().await;
        data.dirty = true;
        match self {
            Node::Leaf(_) => Node::Leaf(data),
            Node::Internal(_) => Node::Internal(data),
        }
    }

    /// Number of entries on all the leaf nodes under this node.
    pub(crate) fn count<'a>(&'a self, store: &'a Store) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => Ok(data.len() as i64),
                Node::Internal(data) => {
                    let mut total = 0;
                    for &child in &data.vals {
                        let node = store.fetch_node(child).await?;
                        total += node.count(store).await?;
                    }
                    Ok(total)
                }
            }
        })
    }

    /// `(key, docid, value)` bytes of the lowest entry in the tree.
    pub(crate) fn front<'a>(
        &'a self,
        store: &'a Store,
    ) -> BoxFuture<'a, Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    if data.keys.is_empty() {
                        return Ok(None);
                    }
                    Ok(Some((
                        store.fetch_value(data.keys[0]).await?,
                        store.fetch_value(data.docids[0]).await?,
                        store.fetch_value(data.vals[0]).await?,
                    )))
                }
                Node::Internal(data) => {
                    let node = store.fetch_node(data.vals[0]).await?;
                    node.front(store).await
                }
            }
        })
    }

    /// Does any entry carry these key bytes, under any docid?
    pub(crate) fn contains<'a>(
        &'a self,
        store: &'a Store,
        key: &'a dyn WharfeKey,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let (_, kpos, _) = data.search_ge(store, key, false).await?;
                    Ok(kpos >= 0)
                }
                Node::Internal(data) => {
                    let (index, kpos, _) = data.search_ge(store, key, false).await?;
                    if kpos >= 0 {
                        return Ok(true);
                    }
                    let node = store.fetch_node(data.vals[index]).await?;
                    node.contains(store, key).await
                }
            }
        })
    }

    /// Does an entry carry exactly these key bytes and this docid?
    pub(crate) fn equals<'a>(
        &'a self,
        store: &'a Store,
        key: &'a dyn WharfeKey,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let (_, kpos, dpos) = data.search_ge(store, key, true).await?;
                    Ok(kpos >= 0 && dpos >= 0)
                }
                Node::Internal(data) => {
                    let (index, kpos, dpos) = data.search_ge(store, key, true).await?;
                    if kpos >= 0 && dpos >= 0 {
                        return Ok(true);
                    }
                    let node = store.fetch_node(data.vals[index]).await?;
                    node.equals(store, key).await
                }
            }
        })
    }

    /// Walk the subtree checking structure: array lengths, the leaf
    /// trailing zero, non-zero child offsets, no live block on the
    /// free-list, no circular child links, and `(key, docid)` sort order.
    /// Violations are fatal.
    pub(crate) fn verify<'a>(
        &'a self,
        store: &'a Store,
        path: &'a mut Vec<i64>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            path.push(self.offset());
            self.verify_shape(store, path).await?;
            match self {
                Node::Leaf(data) => {
                    if *data.vals.last().expect("leaf vals cannot be empty") != 0 {
                        panic!("leaf trailing slot must be zero");
                    }
                }
                Node::Internal(data) => {
                    for &child in &data.vals {
                        if child == 0 {
                            panic!("internal child offset cannot be zero");
                        }
                        if store.in_freelist(child).await {
                            panic!("live child block {child} found on the free-list");
                        }
                        let node = store.fetch_node(child).await?;
                        node.verify(store, path).await?;
                    }
                }
            }
            path.pop();
            Ok(())
        })
    }

    async fn verify_shape(&self, store: &Store, path: &[i64]) -> Result<()> {
        let data = self.data();
        if data.docids.len() != data.keys.len() {
            panic!("docid count does not match key count");
        }
        if data.vals.len() != data.keys.len() + 1 {
            panic!("value count does not match key count");
        }
        if !self.is_leaf() {
            for &child in &data.vals {
                if path.contains(&child) {
                    panic!("circular child link through block {child}");
                }
            }
        }
        for i in 0..data.len().saturating_sub(1) {
            if data.keys[i] < 0 || data.docids[i] < 0 {
                panic!("entry offset below zero");
            }
            let x = store.fetch_key(data.keys[i]).await?;
            let y = store.fetch_key(data.keys[i + 1]).await?;
            match x.as_slice().cmp(y.as_slice()) {
                Ordering::Greater => panic!("keys out of sort order"),
                Ordering::Equal => {
                    let dx = store.fetch_docid(data.docids[i]).await?;
                    let dy = store.fetch_docid(data.docids[i + 1]).await?;
                    if dx.as_slice() > dy.as_slice() {
                        panic!("docids out of sort order");
                    }
                }
                Ordering::Less => {}
            }
        }
        Ok(())
    }

    /// Check that every separator repeats the leftmost key offset of the
    /// subtree to its right. Returns the leftmost key offset of this
    /// subtree, or -1 for an empty tree.
    pub(crate) fn verify_separators<'a>(&'a self, store: &'a Store) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => Ok(data.keys.first().copied().unwrap_or(-1)),
                Node::Internal(data) => {
                    let mut firsts = Vec::with_capacity(data.vals.len());
                    for &child in &data.vals {
                        let node = store.fetch_node(child).await?;
                        firsts.push(node.verify_separators(store).await?);
                    }
                    for i in 0..data.keys.len() {
                        if data.keys[i] != firsts[i + 1] {
                            panic!(
                                "separator {i} of block {} does not match its subtree",
                                data.offset
                            );
                        }
                    }
                    Ok(firsts[0])
                }
            }
        })
    }

    /// Accumulate per-level entry counts; returns (internal, leaf) node
    /// totals for the subtree.
    pub(crate) fn level_count<'a>(
        &'a self,
        store: &'a Store,
        level: usize,
        acc: &'a mut Vec<i64>,
    ) -> BoxFuture<'a, Result<(i64, i64)>> {
        Box::pin(async move {
            if acc.len() == level {
                acc.push(0);
            }
            acc[level] += self.len() as i64;
            match self {
                Node::Leaf(_) => Ok((0, 1)),
                Node::Internal(data) => {
                    let (mut internals, mut leaves) = (1, 0);
                    for &child in &data.vals {
                        let node = store.fetch_node(child).await?;
                        let (i, l) = node.level_count(store, level + 1, acc).await?;
                        internals += i;
                        leaves += l;
                    }
                    Ok((internals, leaves))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::kv::DocKey;
    use crate::config::Config;

    fn test_config(name: &str) -> Config {
        let mut config = Config::new(format!("{name}.idx"), format!("{name}.kv"));
        config.blocksize = 136;
        config.rebalance_thrs = 2;
        config
    }

    fn cleanup(name: &str) {
        std::fs::remove_file(format!("{name}.idx")).expect("cleanup idx");
        std::fs::remove_file(format!("{name}.kv")).expect("cleanup kv");
    }

    async fn interned_leaf(store: &Store, entries: &[(&str, &str)]) -> NodeData {
        let mut data = NodeData::fresh(store.alloc_block().await);
        for (key, docid) in entries {
            let (kpos, dpos) = store
                .intern_key(&DocKey::new(*key, *docid), -1)
                .await
                .expect("interned");
            data.keys.push(kpos);
            data.docids.push(dpos);
            data.vals.push(0);
        }
        data.vals.push(0);
        data
    }

    #[tokio::test]
    async fn it_finds_the_smallest_slot_not_less_than_a_key() {
        let store = Store::try_new(test_config("node_search_ge"))
            .await
            .expect("creates store");
        let data = interned_leaf(&store, &[("b", "1"), ("d", "1"), ("f", "1")]).await;

        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("a", "1"), true)
            .await
            .expect("searched");
        assert_eq!((index, kpos, dpos), (0, -1, -1));

        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("b", "1"), true)
            .await
            .expect("searched");
        assert_eq!(index, 0);
        assert_eq!((kpos, dpos), (data.keys[0], data.docids[0]));

        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("c", "1"), true)
            .await
            .expect("searched");
        assert_eq!((index, kpos, dpos), (1, -1, -1));

        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("f", "1"), true)
            .await
            .expect("searched");
        assert_eq!(index, 2);
        assert_eq!((kpos, dpos), (data.keys[2], data.docids[2]));

        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("g", "1"), true)
            .await
            .expect("searched");
        assert_eq!((index, kpos, dpos), (3, -1, -1));

        cleanup("node_search_ge");
    }

    #[tokio::test]
    async fn it_resolves_a_duplicate_key_under_a_new_docid() {
        let store = Store::try_new(test_config("node_search_dup"))
            .await
            .expect("creates store");
        let data = interned_leaf(&store, &[("b", "1"), ("d", "1")]).await;

        // Key bytes match slot 1, the docid sorts after it: the insertion
        // point is past the slot but the key offset is already resolved.
        let (index, kpos, dpos) = data
            .search_ge(&store, &DocKey::new("d", "2"), true)
            .await
            .expect("searched");
        assert_eq!(index, 2);
        assert_eq!(kpos, data.keys[1]);
        assert_eq!(dpos, -1);

        cleanup("node_search_dup");
    }

    #[tokio::test]
    async fn it_searches_for_exact_entries() {
        let store = Store::try_new(test_config("node_search_eq"))
            .await
            .expect("creates store");
        let data = interned_leaf(&store, &[("b", "1"), ("d", "1"), ("f", "1")]).await;

        let (index, equal) = data
            .search_equal_leaf(&store, &DocKey::new("d", "1"))
            .await
            .expect("searched");
        assert_eq!((index, equal), (1, true));

        let (_, equal) = data
            .search_equal_leaf(&store, &DocKey::new("d", "2"))
            .await
            .expect("searched");
        assert!(!equal);

        // The internal variant lands on the child right of the separator.
        let (index, equal) = data
            .search_equal_internal(&store, &DocKey::new("d", "1"))
            .await
            .expect("searched");
        assert_eq!((index, equal), (2, true));

        let (index, equal) = data
            .search_equal_internal(&store, &DocKey::new("a", "1"))
            .await
            .expect("searched");
        assert_eq!((index, equal), (0, false));

        cleanup("node_search_eq");
    }
}
