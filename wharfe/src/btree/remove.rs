//! Index mutation due to key removal, rebalancing as necessary.
//!
//! A leaf below the rebalance threshold asks its parent for help. The
//! parent tries the left sibling first, then the right; a sibling pair
//! that would pack comfortably into one block merges, otherwise entries
//! rotate across the separator. Merging away the last separator of a
//! parent removes a whole tree level: the surviving child replaces the
//! parent in the grandparent.

use anyhow::Result;
use futures::future::BoxFuture;

use super::kv::WharfeKey;
use super::mutation::Mutation;
use super::node::{Node, NodeData};
use crate::store::Store;

/// What a remove did to the subtree, as seen by the parent.
#[derive(Debug)]
pub(crate) struct Removed {
    /// The node that replaced the one the parent descended into, when a
    /// merge reduced the tree by a level.
    pub(crate) replacement: Option<Node>,
    /// The subtree root fell below the rebalance threshold.
    pub(crate) rebalance: bool,
    /// Replacement separator offsets when slot 0 of a leaf was deleted;
    /// negative otherwise.
    pub(crate) sep_key: i64,
    pub(crate) sep_docid: i64,
}

enum Rebalanced {
    /// Entries rotated across; the child stayed where it was.
    Rotated,
    /// The pair merged; the child now sits one slot to the left.
    Merged,
    /// The merge consumed this node's only separator.
    LevelReduced,
}

impl Node {
    /// Remove the entry matching `key` exactly. An absent key leaves the
    /// subtree untouched and requests no rebalance.
    pub(crate) fn remove<'a>(
        &'a mut self,
        store: &'a Store,
        key: &'a dyn WharfeKey,
        mv: &'a mut Mutation,
    ) -> BoxFuture<'a, Result<Removed>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let (index, equal) = data.search_equal_leaf(store, key).await?;
                    if !equal {
                        return Ok(Removed {
                            replacement: None,
                            rebalance: false,
                            sep_key: -1,
                            sep_docid: -1,
                        });
                    }
                    data.keys.remove(index);
                    data.docids.remove(index);
                    data.vals.remove(index);
                    debug_assert_eq!(data.vals.len(), data.keys.len() + 1);

                    // Deleting slot 0 invalidates the separator naming this
                    // leaf in some ancestor.
                    let (mut sep_key, mut sep_docid) = (-1, -1);
                    if index == 0 && !data.keys.is_empty() {
                        sep_key = data.keys[0];
                        sep_docid = data.docids[0];
                    }
                    let rebalance = data.len() < store.rebalance_thrs();
                    Ok(Removed {
                        replacement: None,
                        rebalance,
                        sep_key,
                        sep_docid,
                    })
                }
                Node::Internal(data) => {
                    let (index, equal) = data.search_equal_internal(store, key).await?;

                    // Copy on write
                    let stale = store.fetch_for_update(data.vals[index]).await?;
                    let mut child = stale.copy_on_write(store).await;
                    mv.stale(stale.offset());

                    // Recursive remove
                    let removed = child.remove(store, key, mv).await?;
                    if let Some(node) = removed.replacement {
                        child = node;
                    }
                    let (sep_key, sep_docid) = (removed.sep_key, removed.sep_docid);
                    if equal {
                        if sep_key < 0 || sep_docid < 0 {
                            panic!("separator update requires a resolved entry");
                        }
                        if index < 1 {
                            panic!("matched separator cannot sit left of slot 0");
                        }
                        data.keys[index - 1] = sep_key;
                        data.docids[index - 1] = sep_docid;
                    }
                    data.vals[index] = child.offset();

                    if !removed.rebalance {
                        mv.commit(child);
                        return Ok(Removed {
                            replacement: None,
                            rebalance: false,
                            sep_key,
                            sep_docid,
                        });
                    }

                    let mut index = index as isize;
                    let mut reduced = false;

                    // Try to rebalance from the left sibling, if there is one.
                    if index > 0 {
                        let left = store.fetch_for_update(data.vals[index as usize - 1]).await?;
                        if child.same_kind(&left) {
                            match rebalance_left(data, store, index as usize, &mut child, &left, mv)
                                .await?
                            {
                                Rebalanced::Rotated => {}
                                Rebalanced::Merged => index -= 1,
                                Rebalanced::LevelReduced => {
                                    reduced = true;
                                    index = -1;
                                }
                            }
                        }
                    }
                    // Then from the right sibling, if there is one.
                    if index >= 0 && (index as usize) < data.len() {
                        let right = store.fetch_for_update(data.vals[index as usize + 1]).await?;
                        if child.same_kind(&right) {
                            match rebalance_right(data, store, index as usize, &mut child, &right, mv)
                                .await?
                            {
                                Rebalanced::Rotated | Rebalanced::Merged => {}
                                Rebalanced::LevelReduced => reduced = true,
                            }
                        }
                    }

                    if reduced {
                        // This node is down to a single child; it drops out
                        // of the tree and the child takes its place.
                        mv.stale(data.offset);
                        let rebalance = child.len() < store.rebalance_thrs();
                        return Ok(Removed {
                            replacement: Some(child),
                            rebalance,
                            sep_key,
                            sep_docid,
                        });
                    }
                    mv.commit(child);
                    let rebalance = data.len() < store.rebalance_thrs();
                    Ok(Removed {
                        replacement: None,
                        rebalance,
                        sep_key,
                        sep_docid,
                    })
                }
            }
        })
    }

    /// Entries to rotate from this sibling into `child`, or zero to
    /// request a merge. Merging is preferred while the pair packs small;
    /// when the sibling is too lean to donate half its surplus the pair
    /// still merges if it fits in one block, and otherwise exactly one
    /// entry rotates. A merge is never requested for a pair that cannot
    /// fit.
    pub(crate) fn balance(&self, store: &Store, child: &Node) -> usize {
        let max = store.max_entries();
        let combined = self.len() + child.len();
        // An internal merge also pulls the parent separator down.
        let merged = if self.is_leaf() { combined } else { combined + 1 };
        if (combined as f64) < max as f64 * 0.6 {
            return 0;
        }
        let count = (self.len() as isize - store.rebalance_thrs() as isize) / 2;
        if count < 1 {
            if merged < max {
                0
            } else {
                1
            }
        } else {
            count as usize
        }
    }

    /// Merge this node's entries in front of `child`. Leaf merges drop
    /// this node's trailing zero slot; internal merges pull the parent
    /// separator down between the halves.
    pub(crate) fn merge_right(&self, child: &mut Node, sep_key: i64, sep_docid: i64, max: usize) {
        match (self, child) {
            (Node::Leaf(left), Node::Leaf(child)) => {
                if left.len() + child.len() >= max {
                    panic!("merging leaves would overflow a block");
                }
                child.keys.splice(0..0, left.keys.iter().copied());
                child.docids.splice(0..0, left.docids.iter().copied());
                child
                    .vals
                    .splice(0..0, left.vals[..left.len()].iter().copied());
                debug_assert_eq!(child.vals.len(), child.keys.len() + 1);
            }
            (Node::Internal(left), Node::Internal(child)) => {
                if left.len() + child.len() + 1 >= max {
                    panic!("merging internal nodes would overflow a block");
                }
                let mut keys = left.keys.clone();
                keys.push(sep_key);
                let mut docids = left.docids.clone();
                docids.push(sep_docid);
                child.keys.splice(0..0, keys);
                child.docids.splice(0..0, docids);
                child.vals.splice(0..0, left.vals.iter().copied());
            }
            _ => panic!("cannot merge a leaf node with an internal node"),
        }
    }

    /// Merge `right`'s entries onto the back of this node, the mirror of
    /// [`Node::merge_right`].
    pub(crate) fn merge_left(&mut self, right: &Node, sep_key: i64, sep_docid: i64, max: usize) {
        match (self, right) {
            (Node::Leaf(child), Node::Leaf(right)) => {
                if child.len() + right.len() >= max {
                    panic!("merging leaves would overflow a block");
                }
                child.vals.pop();
                child.keys.extend_from_slice(&right.keys);
                child.docids.extend_from_slice(&right.docids);
                child.vals.extend_from_slice(&right.vals);
                debug_assert_eq!(child.vals.len(), child.keys.len() + 1);
            }
            (Node::Internal(child), Node::Internal(right)) => {
                if child.len() + right.len() + 1 >= max {
                    panic!("merging internal nodes would overflow a block");
                }
                child.keys.push(sep_key);
                child.docids.push(sep_docid);
                child.keys.extend_from_slice(&right.keys);
                child.docids.extend_from_slice(&right.docids);
                child.vals.extend_from_slice(&right.vals);
            }
            _ => panic!("cannot merge a leaf node with an internal node"),
        }
    }

    /// Rotate the last `count` entries of this node onto the front of
    /// `child`, returning the new median to park in the parent.
    pub(crate) fn rotate_right(
        &mut self,
        child: &mut Node,
        count: usize,
        sep_key: i64,
        sep_docid: i64,
    ) -> (i64, i64) {
        match (self, child) {
            (Node::Leaf(left), Node::Leaf(child)) => {
                let split = left.len() - count;
                let keys = left.keys.split_off(split);
                let docids = left.docids.split_off(split);
                child.keys.splice(0..0, keys);
                child.docids.splice(0..0, docids);
                let vals: Vec<i64> = left.vals.drain(split..split + count).collect();
                child.vals.splice(0..0, vals);
                debug_assert_eq!(left.vals.len(), left.keys.len() + 1);
                debug_assert_eq!(child.vals.len(), child.keys.len() + 1);
                (child.keys[0], child.docids[0])
            }
            (Node::Internal(left), Node::Internal(child)) => {
                // The separator joins the rotation and the new median pops
                // back out of the tail.
                left.keys.push(sep_key);
                left.docids.push(sep_docid);
                let split = left.keys.len() - count;
                let keys = left.keys.split_off(split);
                let docids = left.docids.split_off(split);
                child.keys.splice(0..0, keys);
                child.docids.splice(0..0, docids);
                let split = left.vals.len() - count;
                let vals = left.vals.split_off(split);
                child.vals.splice(0..0, vals);
                let sep_docid = left.docids.pop().expect("median docid after rotation");
                let sep_key = left.keys.pop().expect("median key after rotation");
                (sep_key, sep_docid)
            }
            _ => panic!("cannot rotate between a leaf node and an internal node"),
        }
    }

    /// Rotate the first `count` entries of `right` onto the back of this
    /// node, the mirror of [`Node::rotate_right`].
    pub(crate) fn rotate_left(
        &mut self,
        right: &mut Node,
        count: usize,
        sep_key: i64,
        sep_docid: i64,
    ) -> (i64, i64) {
        match (self, right) {
            (Node::Leaf(child), Node::Leaf(right)) => {
                child.keys.extend(right.keys.drain(..count));
                child.docids.extend(right.docids.drain(..count));
                child.vals.pop();
                child.vals.extend(right.vals.drain(..count));
                child.vals.push(0);
                debug_assert_eq!(right.vals.len(), right.keys.len() + 1);
                debug_assert_eq!(child.vals.len(), child.keys.len() + 1);
                (right.keys[0], right.docids[0])
            }
            (Node::Internal(child), Node::Internal(right)) => {
                child.keys.push(sep_key);
                child.docids.push(sep_docid);
                child.keys.extend(right.keys.drain(..count));
                child.docids.extend(right.docids.drain(..count));
                child.vals.extend(right.vals.drain(..count));
                let sep_docid = child.docids.pop().expect("median docid after rotation");
                let sep_key = child.keys.pop().expect("median key after rotation");
                (sep_key, sep_docid)
            }
            _ => panic!("cannot rotate between a leaf node and an internal node"),
        }
    }
}

async fn rebalance_left(
    data: &mut NodeData,
    store: &Store,
    index: usize,
    child: &mut Node,
    left: &Node,
    mv: &mut Mutation,
) -> Result<Rebalanced> {
    let count = left.balance(store, child);
    let sep_key = data.keys[index - 1];
    let sep_docid = data.docids[index - 1];
    if count == 0 {
        tracing::debug!(child = child.offset(), left = left.offset(), "merging left");
        left.merge_right(child, sep_key, sep_docid, store.max_entries());
        mv.stale(left.offset());
        if data.len() == 1 {
            return Ok(Rebalanced::LevelReduced);
        }
        // The separator and the absorbed left child drop out.
        data.keys.remove(index - 1);
        data.docids.remove(index - 1);
        data.vals.remove(index - 1);
        Ok(Rebalanced::Merged)
    } else {
        tracing::debug!(
            child = child.offset(),
            left = left.offset(),
            count,
            "rotating right"
        );
        let mut moved = left.copy_on_write(store).await;
        mv.stale(left.offset());
        let (sep_key, sep_docid) = moved.rotate_right(child, count, sep_key, sep_docid);
        data.keys[index - 1] = sep_key;
        data.docids[index - 1] = sep_docid;
        data.vals[index - 1] = moved.offset();
        mv.commit(moved);
        Ok(Rebalanced::Rotated)
    }
}

async fn rebalance_right(
    data: &mut NodeData,
    store: &Store,
    index: usize,
    child: &mut Node,
    right: &Node,
    mv: &mut Mutation,
) -> Result<Rebalanced> {
    let count = right.balance(store, child);
    let sep_key = data.keys[index];
    let sep_docid = data.docids[index];
    if count == 0 {
        tracing::debug!(child = child.offset(), right = right.offset(), "merging right");
        child.merge_left(right, sep_key, sep_docid, store.max_entries());
        mv.stale(right.offset());
        if data.len() == 1 {
            return Ok(Rebalanced::LevelReduced);
        }
        data.keys.remove(index);
        data.docids.remove(index);
        data.vals.remove(index + 1);
        Ok(Rebalanced::Merged)
    } else {
        tracing::debug!(
            child = child.offset(),
            right = right.offset(),
            count,
            "rotating left"
        );
        let mut moved = right.copy_on_write(store).await;
        mv.stale(right.offset());
        let (sep_key, sep_docid) = child.rotate_left(&mut moved, count, sep_key, sep_docid);
        data.keys[index] = sep_key;
        data.docids[index] = sep_docid;
        data.vals[index + 1] = moved.offset();
        mv.commit(moved);
        Ok(Rebalanced::Rotated)
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

    async fn leaf_of(store: &Store, keys: &[&str]) -> Node {
        let mut node = Node::empty_leaf(store.alloc_block().await);
        let mut mv = Mutation::new();
        for key in keys {
            node.insert(store, &DocKey::new(*key, "1"), &"x", &mut mv)
                .await
                .expect("inserted");
        }
        node
    }

    async fn leaf_keys(store: &Store, node: &Node) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &kpos in &node.data().keys {
            out.push(store.fetch_value(kpos).await.expect("key bytes"));
        }
        out
    }

    #[tokio::test]
    async fn it_removes_and_reports_a_new_separator() {
        let store = Store::try_new(test_config("remove_leaf"))
            .await
            .expect("creates store");
        let mut node = leaf_of(&store, &["a", "b", "c"]).await;

        let mut mv = Mutation::new();
        let removed = node
            .remove(&store, &DocKey::new("a", "1"), &mut mv)
            .await
            .expect("removed");
        // Slot 0 went, so the parent must learn the new first entry.
        assert_eq!(removed.sep_key, node.data().keys[0]);
        assert!(!removed.rebalance);
        assert_eq!(leaf_keys(&store, &node).await, vec![b"b".to_vec(), b"c".to_vec()]);

        let removed = node
            .remove(&store, &DocKey::new("c", "1"), &mut mv)
            .await
            .expect("removed");
        assert_eq!(removed.sep_key, -1);
        assert!(removed.rebalance);

        // Absent keys change nothing.
        let before = node.data().keys.clone();
        let removed = node
            .remove(&store, &DocKey::new("zz", "1"), &mut mv)
            .await
            .expect("removed");
        assert!(!removed.rebalance);
        assert_eq!(node.data().keys, before);

        cleanup("remove_leaf");
    }

    #[tokio::test]
    async fn it_rotates_leaf_entries_right() {
        let store = Store::try_new(test_config("remove_rot_right"))
            .await
            .expect("creates store");
        let mut left = leaf_of(&store, &["a", "b", "c"]).await;
        let mut child = leaf_of(&store, &["x"]).await;

        let (sep_key, _) = left.rotate_right(&mut child, 1, -1, -1);
        assert_eq!(leaf_keys(&store, &left).await, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(leaf_keys(&store, &child).await, vec![b"c".to_vec(), b"x".to_vec()]);
        // Median is the child's new first entry.
        assert_eq!(sep_key, child.data().keys[0]);
        assert_eq!(*left.data().vals.last().expect("trailing"), 0);
        assert_eq!(*child.data().vals.last().expect("trailing"), 0);

        cleanup("remove_rot_right");
    }

    #[tokio::test]
    async fn it_rotates_leaf_entries_left() {
        let store = Store::try_new(test_config("remove_rot_left"))
            .await
            .expect("creates store");
        let mut child = leaf_of(&store, &["a"]).await;
        let mut right = leaf_of(&store, &["m", "n", "o"]).await;

        let (sep_key, _) = child.rotate_left(&mut right, 1, -1, -1);
        assert_eq!(leaf_keys(&store, &child).await, vec![b"a".to_vec(), b"m".to_vec()]);
        assert_eq!(leaf_keys(&store, &right).await, vec![b"n".to_vec(), b"o".to_vec()]);
        // Median is the right sibling's new first entry.
        assert_eq!(sep_key, right.data().keys[0]);

        cleanup("remove_rot_left");
    }

    #[tokio::test]
    async fn it_merges_leaves_in_both_directions() {
        let store = Store::try_new(test_config("remove_merge"))
            .await
            .expect("creates store");

        let left = leaf_of(&store, &["a"]).await;
        let mut child = leaf_of(&store, &["c", "d"]).await;
        left.merge_right(&mut child, -1, -1, store.max_entries());
        assert_eq!(
            leaf_keys(&store, &child).await,
            vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(child.data().vals.len(), 4);
        assert_eq!(*child.data().vals.last().expect("trailing"), 0);

        let mut child = leaf_of(&store, &["a"]).await;
        let right = leaf_of(&store, &["c", "d"]).await;
        child.merge_left(&right, -1, -1, store.max_entries());
        assert_eq!(
            leaf_keys(&store, &child).await,
            vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(child.data().vals.len(), 4);
        assert_eq!(*child.data().vals.last().expect("trailing"), 0);

        cleanup("remove_merge");
    }

    #[tokio::test]
    #[should_panic(expected = "overflow a block")]
    async fn it_refuses_an_oversized_merge() {
        let store = Store::try_new(test_config("remove_merge_full"))
            .await
            .expect("creates store");
        let left = leaf_of(&store, &["a", "b"]).await;
        let mut child = leaf_of(&store, &["c", "d"]).await;
        // 2 + 2 >= max of 4.
        left.merge_right(&mut child, -1, -1, store.max_entries());
    }

    #[tokio::test]
    async fn it_asks_for_merge_only_when_the_pair_packs_small() {
        let store = Store::try_new(test_config("remove_balance"))
            .await
            .expect("creates store");
        let child = leaf_of(&store, &["a"]).await;
        let small = leaf_of(&store, &["c"]).await;
        let medium = leaf_of(&store, &["c", "d"]).await;
        let large = leaf_of(&store, &["c", "d", "e"]).await;

        // 1 + 1 < 0.6 * 4
        assert_eq!(small.balance(&store, &child), 0);
        // The sibling has no surplus to donate, but the pair still fits
        // in one block.
        assert_eq!(medium.balance(&store, &child), 0);
        // 1 + 3 fills a block, so one entry rotates instead.
        assert_eq!(large.balance(&store, &child), 1);

        cleanup("remove_balance");
    }
}
