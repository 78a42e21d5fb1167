//! B+Tree index
//!
//! This is the main data structure exposed by the library.
//!
//! Writers are serialized; readers run against the last published root
//! and never contend with a write in flight. One write operation clones
//! the path it touches onto fresh blocks, and the store publishes the new
//! root on its drain cadence.

use std::sync::Arc;

use anyhow::Result;
use strum::EnumString;
use thiserror::Error;

use super::kv::WharfeKey;
use super::kv::WharfeValue;
use super::mutation::Mutation;
use super::node::Node;
use super::node::NodeData;
use crate::config::Config;
use crate::store::Store;

/// When accessing tree contents serially, ascending or descending order.
#[derive(Clone, Copy, Debug, EnumString, PartialEq)]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    /// Process in ascending order.
    Ascending,
    /// Process in descending order.
    Descending,
}

/// Wharfe specific errors.
#[derive(Error, Debug)]
pub enum WharfeError {
    /// A root split would push the tree past the configured height bound.
    #[error("tree height {0} is already at the configured maximum")]
    MaxLevelExceeded(u32),
}

/// A persistent, copy-on-write B+Tree index.
pub struct Wharfe {
    pub(crate) store: Arc<Store>,
}

impl Wharfe {
    /// Create a new index from the configured file pair.
    pub async fn try_new(config: Config) -> Result<Self> {
        tracing::info!("Creating B+Tree index at: {}", config.idxfile.display());
        Ok(Self {
            store: Arc::new(Store::try_new(config).await?),
        })
    }

    /// Open an existing index at its last published root.
    pub async fn try_open(config: Config) -> Result<Self> {
        tracing::info!("Opening B+Tree index at: {}", config.idxfile.display());
        Ok(Self {
            store: Arc::new(Store::try_open(config).await?),
        })
    }

    /// Insert a `(key, docid, value)` triple. Inserting over an existing
    /// `(key, docid)` pair replaces its value.
    pub async fn insert<K, V>(&self, key: K, value: V) -> Result<()>
    where
        K: WharfeKey,
        V: WharfeValue,
    {
        let store = &*self.store;
        let _gate = store.write_gate().lock().await;
        tracing::debug!(?key, ?value, "insert");

        let mut mv = Mutation::new();
        let (dirty_root, mut height) = store.dirty_root().await;
        let stale = store.fetch_for_update(dirty_root).await?;
        let mut root = stale.copy_on_write(store).await;
        mv.stale(stale.offset());

        let split = root.insert(store, &key, &value, &mut mv).await?;
        let new_root = match split {
            Some(split) => {
                if height >= store.config().maxlevel {
                    return Err(WharfeError::MaxLevelExceeded(height).into());
                }
                height += 1;
                let mut data = NodeData::fresh(store.alloc_block().await);
                data.keys.push(split.sep_key);
                data.docids.push(split.sep_docid);
                data.vals = vec![root.offset(), split.right];
                let offset = data.offset;
                mv.commit(root);
                mv.commit(Node::Internal(data));
                offset
            }
            None => {
                let offset = root.offset();
                mv.commit(root);
                offset
            }
        };
        store.commit(mv, new_root, height).await?;
        if store.config().debug {
            self.verify().await?;
        }
        Ok(())
    }

    /// Remove the entry matching `key` exactly. Removing an absent key is
    /// not an error.
    pub async fn remove<K>(&self, key: &K) -> Result<()>
    where
        K: WharfeKey,
    {
        let store = &*self.store;
        let _gate = store.write_gate().lock().await;
        tracing::debug!(?key, "remove");

        let mut mv = Mutation::new();
        let (dirty_root, mut height) = store.dirty_root().await;
        let stale = store.fetch_for_update(dirty_root).await?;
        let mut root = stale.copy_on_write(store).await;
        mv.stale(stale.offset());

        let removed = root.remove(store, key, &mut mv).await?;
        if let Some(node) = removed.replacement {
            // The old root merged itself away; the tree lost a level.
            root = node;
            height -= 1;
        }
        let new_root = root.offset();
        mv.commit(root);
        store.commit(mv, new_root, height).await?;
        if store.config().debug {
            self.verify().await?;
        }
        Ok(())
    }

    /// Return count of entries.
    pub async fn count(&self) -> Result<i64> {
        let root = self.store.fetch_node(self.store.committed_root().await).await?;
        root.count(&self.store).await
    }

    /// Return the `(key, docid, value)` bytes of the lowest entry, or
    /// `None` for an empty tree.
    pub async fn front(&self) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>)>> {
        let root = self.store.fetch_node(self.store.committed_root().await).await?;
        root.front(&self.store).await
    }

    /// Does the tree hold any entry with this key's bytes?
    pub async fn contains<K>(&self, key: &K) -> Result<bool>
    where
        K: WharfeKey,
    {
        let root = self.store.fetch_node(self.store.committed_root().await).await?;
        root.contains(&self.store, key).await
    }

    /// Does the tree hold an entry matching this key's bytes and docid?
    pub async fn equals<K>(&self, key: &K) -> Result<bool>
    where
        K: WharfeKey,
    {
        let root = self.store.fetch_node(self.store.committed_root().await).await?;
        root.equals(&self.store, key).await
    }

    /// Block until every pending commit is published.
    pub async fn drain(&self) -> Result<()> {
        self.store.drain().await
    }

    /// Drain and close the index.
    pub async fn close(self) -> Result<()> {
        self.store.close().await
    }

    /// Remove both backing files.
    pub async fn destroy(self) -> Result<()> {
        self.store.destroy().await
    }

    /// Walk the dirty tree checking every structural invariant: array
    /// shapes, child links, sort order, separator consistency and the
    /// free-list audit. Violations are fatal.
    pub async fn verify(&self) -> Result<()> {
        let (dirty_root, _) = self.store.dirty_root().await;
        let root = self.store.fetch_node(dirty_root).await?;
        let mut path = Vec::new();
        root.verify(&self.store, &mut path).await?;
        root.verify_separators(&self.store).await?;
        Ok(())
    }

    /// Log basic information about the index.
    pub async fn info(&self) -> Result<()> {
        let (dirty_root, height) = self.store.dirty_root().await;
        let root = self.store.fetch_node(dirty_root).await?;
        let mut levels = Vec::new();
        let (internals, leaves) = root.level_count(&self.store, 0, &mut levels).await?;
        tracing::info!(
            path = %self.store.config().idxfile.display(),
            height,
            internals,
            leaves,
            ?levels,
            "B+Tree index"
        );
        Ok(())
    }
}

impl Drop for Wharfe {
    fn drop(&mut self) {
        if self.store.is_closed() {
            return;
        }
        let store = self.store.clone();
        std::thread::scope(|s| {
            let hdl = s.spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread().build().unwrap();
                if let Err(e) = runtime.block_on(store.drain()) {
                    tracing::warn!("could not drain index to disk: {}", e);
                }
            });
            hdl.join().expect("thread finished");
        });
    }
}
