//! Index mutation due to `(key, docid, value)` insert.
//!
//! Inserts descend copy-on-write: every internal node on the path clones
//! the child it enters, records the replaced block as stale and the clone
//! as a commit. A leaf either overwrites the value of an exact
//! `(key, docid)` match or splices a fresh entry in; overflow splits bubble
//! a spawned sibling and its separator back up the recursion.

use anyhow::Result;
use futures::future::BoxFuture;

use super::kv::{WharfeKey, WharfeValue};
use super::mutation::Mutation;
use super::node::{Node, NodeData};
use crate::store::Store;

/// A node spawned by a split, as seen by the parent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Split {
    /// Block offset of the new right-hand sibling.
    pub(crate) right: i64,
    /// Separator key offset promoted to the parent.
    pub(crate) sep_key: i64,
    /// Separator docid offset promoted to the parent.
    pub(crate) sep_docid: i64,
}

impl Node {
    /// Insert the triple into this subtree, splitting as necessary.
    /// Returns the spawned sibling when this node had to split.
    pub(crate) fn insert<'a>(
        &'a mut self,
        store: &'a Store,
        key: &'a dyn WharfeKey,
        value: &'a dyn WharfeValue,
        mv: &'a mut Mutation,
    ) -> BoxFuture<'a, Result<Option<Split>>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let (index, kpos, dpos) = data.search_ge(store, key, true).await?;
                    if kpos >= 0 && dpos >= 0 {
                        // Exact match: overwrite the value, keep the entry.
                        data.keys[index] = kpos;
                        data.docids[index] = dpos;
                        data.vals[index] = store.intern_value(value).await?;
                        return Ok(None);
                    }
                    let (kpos, dpos) = store.intern_key(key, kpos).await?;
                    data.keys.insert(index, kpos);
                    data.docids.insert(index, dpos);
                    data.vals.insert(index, store.intern_value(value).await?);

                    if data.len() <= store.max_entries() {
                        return Ok(None);
                    }
                    let (right, sep_key, sep_docid) = split_leaf(data, store).await;
                    let spawn = Node::Leaf(right);
                    let split = Split {
                        right: spawn.offset(),
                        sep_key,
                        sep_docid,
                    };
                    mv.commit(spawn);
                    Ok(Some(split))
                }
                Node::Internal(data) => {
                    let (mut index, kpos, dpos) = data.search_ge(store, key, true).await?;
                    if kpos >= 0 && dpos >= 0 {
                        // The separator repeats the first entry of the child
                        // to its right; an exact hit lives over there.
                        index += 1;
                    }

                    // Copy on write
                    let stale = store.fetch_for_update(data.vals[index]).await?;
                    let mut child = stale.copy_on_write(store).await;
                    mv.stale(stale.offset());

                    // Recursive insert
                    let split = child.insert(store, key, value, mv).await?;
                    data.vals[index] = child.offset();
                    mv.commit(child);
                    let Some(split) = split else {
                        return Ok(None);
                    };

                    data.keys.insert(index, split.sep_key);
                    data.docids.insert(index, split.sep_docid);
                    data.vals.insert(index + 1, split.right);

                    if data.len() <= store.max_entries() {
                        return Ok(None);
                    }
                    let (right, sep_key, sep_docid) = split_internal(data, store).await;
                    let spawn = Node::Internal(right);
                    let split = Split {
                        right: spawn.offset(),
                        sep_key,
                        sep_docid,
                    };
                    mv.commit(spawn);
                    Ok(Some(split))
                }
            }
        })
    }
}

/// Split an overfull leaf in two. The original keeps the first
/// `max/2 + 1` entries, the spawned sibling takes the rest, and the
/// sibling's first entry becomes the separator.
async fn split_leaf(data: &mut NodeData, store: &Store) -> (NodeData, i64, i64) {
    let mid = store.max_entries() / 2;
    tracing::debug!(offset = data.offset, size = data.len(), "splitting leaf");

    let mut right = NodeData::fresh(store.alloc_block().await);
    right.keys = data.keys.split_off(mid + 1);
    right.docids = data.docids.split_off(mid + 1);
    // The split carries the trailing zero slot across with it.
    right.vals = data.vals.split_off(mid + 1);
    data.vals.push(0);

    let sep_key = right.keys[0];
    let sep_docid = right.docids[0];
    (right, sep_key, sep_docid)
}

/// Split an overfull internal node in two, promoting the median entry out
/// of both halves as the separator.
async fn split_internal(data: &mut NodeData, store: &Store) -> (NodeData, i64, i64) {
    let mid = store.max_entries() / 2;
    tracing::debug!(offset = data.offset, size = data.len(), "splitting internal");

    let mut right = NodeData::fresh(store.alloc_block().await);
    right.keys = data.keys.split_off(mid + 1);
    right.docids = data.docids.split_off(mid + 1);
    right.vals = data.vals.split_off(mid + 1);

    let sep_key = data.keys.pop().expect("median key on split");
    let sep_docid = data.docids.pop().expect("median docid on split");
    (right, sep_key, sep_docid)
}

impl Store {
    /// Mint kv-log offsets for a key, reusing a key offset the search
    /// already resolved. The docid record is always appended fresh.
    pub(crate) async fn intern_key(
        &self,
        key: &dyn WharfeKey,
        kpos: i64,
    ) -> Result<(i64, i64)> {
        let kpos = if kpos >= 0 {
            kpos
        } else {
            self.append_key(key.bytes()).await?
        };
        let dpos = self.append_docid(key.docid()).await?;
        Ok((kpos, dpos))
    }

    pub(crate) async fn intern_value(&self, value: &dyn WharfeValue) -> Result<i64> {
        self.append_value(value.bytes()).await
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

    async fn filled_leaf(store: &Store, keys: &[&str]) -> Node {
        let mut root = Node::empty_leaf(store.alloc_block().await);
        let mut mv = Mutation::new();
        for key in keys {
            root.insert(store, &DocKey::new(*key, "1"), &"x", &mut mv)
                .await
                .expect("inserted");
        }
        root
    }

    #[tokio::test]
    async fn it_splits_an_overfull_leaf() {
        let store = Store::try_new(test_config("insert_split_leaf"))
            .await
            .expect("creates store");
        // max_entries is 4; the fifth insert overflows.
        let mut root = filled_leaf(&store, &["a", "b", "c", "d"]).await;
        assert_eq!(root.len(), 4);

        let mut mv = Mutation::new();
        let split = root
            .insert(&store, &DocKey::new("e", "1"), &"x", &mut mv)
            .await
            .expect("inserted")
            .expect("split");

        // The leaf keeps the first three entries, the spawn takes two.
        assert_eq!(root.len(), 3);
        assert_eq!(root.data().vals.len(), 4);
        assert_eq!(*root.data().vals.last().expect("trailing"), 0);
        let spawn = &mv.commits[&split.right];
        assert_eq!(spawn.len(), 2);
        assert_eq!(spawn.data().vals.len(), 3);
        assert_eq!(split.sep_key, spawn.data().keys[0]);
        assert_eq!(
            store.fetch_value(split.sep_key).await.expect("bytes"),
            b"d".to_vec()
        );

        cleanup("insert_split_leaf");
    }

    #[tokio::test]
    async fn it_overwrites_an_exact_match_in_place() {
        let store = Store::try_new(test_config("insert_overwrite"))
            .await
            .expect("creates store");
        let mut root = filled_leaf(&store, &["a", "b"]).await;
        let keys_before = root.data().keys.clone();
        let value_before = root.data().vals[1];

        let mut mv = Mutation::new();
        let split = root
            .insert(&store, &DocKey::new("b", "1"), &"fresh", &mut mv)
            .await
            .expect("inserted");
        assert!(split.is_none());
        assert_eq!(root.len(), 2);
        assert_eq!(root.data().keys, keys_before);
        assert_ne!(root.data().vals[1], value_before);
        assert_eq!(
            store
                .fetch_value(root.data().vals[1])
                .await
                .expect("bytes"),
            b"fresh".to_vec()
        );

        cleanup("insert_overwrite");
    }

    #[tokio::test]
    async fn it_reuses_the_key_offset_for_a_new_docid() {
        let store = Store::try_new(test_config("insert_dup_key"))
            .await
            .expect("creates store");
        let mut root = filled_leaf(&store, &["k"]).await;
        let kpos = root.data().keys[0];

        let mut mv = Mutation::new();
        root.insert(&store, &DocKey::new("k", "2"), &"y", &mut mv)
            .await
            .expect("inserted");
        assert_eq!(root.len(), 2);
        // Same key bytes, same log record.
        assert_eq!(root.data().keys[0], kpos);
        assert_eq!(root.data().keys[1], kpos);
        assert_ne!(root.data().docids[0], root.data().docids[1]);

        cleanup("insert_dup_key");
    }
}
