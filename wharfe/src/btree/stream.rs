//! Streaming access to tree contents
//!
//! The set streams and the duplicate-key lookup hand their results through
//! a bounded channel: a spawned walker task pulls entries out of the tree
//! in order while the caller consumes the receiving end as a
//! [`Stream`](futures::Stream). Dropping the receiver stops the walk.

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::SinkExt;
use futures::Stream;

use anyhow::Result;

use super::kv::DocKey;
use super::kv::WharfeKey;
use super::node::Node;
use super::wharfe::Direction;
use super::wharfe::Wharfe;
use crate::store::Store;

/// Entries buffered between the walker and the consumer.
const STREAM_DEPTH: usize = 64;

impl Wharfe {
    /// Return a stream of key bytes in the given order, from the last
    /// published root.
    pub async fn key_set(&self, direction: Direction) -> impl Stream<Item = Vec<u8>> {
        let (mut tx, rx) = mpsc::channel(STREAM_DEPTH);
        let store = self.store.clone();
        let root = store.committed_root().await;
        tokio::spawn(async move {
            let node = match store.fetch_node(root).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("key stream lost the committed root: {e}");
                    return;
                }
            };
            if let Err(e) = node.send_keys(&store, &mut tx, direction).await {
                tracing::error!("key stream failed: {e}");
            }
        });
        rx
    }

    /// Return a stream of `(key, docid, value)` byte triples in the given
    /// order, from the last published root.
    pub async fn full_set(
        &self,
        direction: Direction,
    ) -> impl Stream<Item = (Vec<u8>, Vec<u8>, Vec<u8>)> {
        let (mut tx, rx) = mpsc::channel(STREAM_DEPTH);
        let store = self.store.clone();
        let root = store.committed_root().await;
        tokio::spawn(async move {
            let node = match store.fetch_node(root).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("entry stream lost the committed root: {e}");
                    return;
                }
            };
            if let Err(e) = node.send_entries(&store, &mut tx, direction).await {
                tracing::error!("entry stream failed: {e}");
            }
        });
        rx
    }

    /// Stream every value recorded under these key bytes, in docid order,
    /// from the last published root.
    pub async fn lookup(&self, key: &[u8]) -> impl Stream<Item = Vec<u8>> {
        let root = self.store.committed_root().await;
        self.lookup_from(key, root)
    }

    /// Like [`Wharfe::lookup`], but against the in-memory dirty root,
    /// commits that have not yet drained included.
    pub async fn lookup_dirty(&self, key: &[u8]) -> impl Stream<Item = Vec<u8>> {
        let (root, _) = self.store.dirty_root().await;
        self.lookup_from(key, root)
    }

    fn lookup_from(&self, key: &[u8], root: i64) -> impl Stream<Item = Vec<u8>> {
        let (mut tx, rx) = mpsc::channel(STREAM_DEPTH);
        let store = self.store.clone();
        // An empty docid sorts first, so the walk starts at the key's
        // first duplicate whatever docid the caller had in hand.
        let cursor = DocKey::new(key.to_vec(), Vec::new());
        tokio::spawn(async move {
            let node = match store.fetch_node(root).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("lookup lost its root: {e}");
                    return;
                }
            };
            if let Err(e) = node.emit_matches(&store, &cursor, &mut tx).await {
                tracing::error!("lookup stream failed: {e}");
            }
        });
        rx
    }
}

impl Node {
    /// Send every key in `direction` order. Returns false once the
    /// receiver hangs up.
    pub(crate) fn send_keys<'a>(
        &'a self,
        store: &'a Store,
        tx: &'a mut mpsc::Sender<Vec<u8>>,
        direction: Direction,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    match direction {
                        Direction::Ascending => {
                            for &kpos in &data.keys {
                                if tx.send(store.fetch_value(kpos).await?).await.is_err() {
                                    return Ok(false);
                                }
                            }
                        }
                        Direction::Descending => {
                            for &kpos in data.keys.iter().rev() {
                                if tx.send(store.fetch_value(kpos).await?).await.is_err() {
                                    return Ok(false);
                                }
                            }
                        }
                    }
                    Ok(true)
                }
                Node::Internal(data) => {
                    match direction {
                        Direction::Ascending => {
                            for &child in &data.vals {
                                let node = store.fetch_node(child).await?;
                                if !node.send_keys(store, tx, direction).await? {
                                    return Ok(false);
                                }
                            }
                        }
                        Direction::Descending => {
                            for &child in data.vals.iter().rev() {
                                let node = store.fetch_node(child).await?;
                                if !node.send_keys(store, tx, direction).await? {
                                    return Ok(false);
                                }
                            }
                        }
                    }
                    Ok(true)
                }
            }
        })
    }

    /// Send every `(key, docid, value)` triple in `direction` order.
    /// Returns false once the receiver hangs up.
    pub(crate) fn send_entries<'a>(
        &'a self,
        store: &'a Store,
        tx: &'a mut mpsc::Sender<(Vec<u8>, Vec<u8>, Vec<u8>)>,
        direction: Direction,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let send_slot = |i: usize| (data.keys[i], data.docids[i], data.vals[i]);
                    let slots: Vec<(i64, i64, i64)> = match direction {
                        Direction::Ascending => (0..data.len()).map(send_slot).collect(),
                        Direction::Descending => (0..data.len()).rev().map(send_slot).collect(),
                    };
                    for (kpos, dpos, vpos) in slots {
                        let entry = (
                            store.fetch_value(kpos).await?,
                            store.fetch_value(dpos).await?,
                            store.fetch_value(vpos).await?,
                        );
                        if tx.send(entry).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Node::Internal(data) => {
                    let children: Vec<i64> = match direction {
                        Direction::Ascending => data.vals.clone(),
                        Direction::Descending => data.vals.iter().rev().copied().collect(),
                    };
                    for child in children {
                        let node = store.fetch_node(child).await?;
                        if !node.send_entries(store, tx, direction).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            }
        })
    }

    /// Send the value of every entry whose key bytes match, scanning
    /// rightward from the search position until the key changes. Returns
    /// false once the scan is done or the receiver hangs up.
    pub(crate) fn emit_matches<'a>(
        &'a self,
        store: &'a Store,
        key: &'a dyn WharfeKey,
        tx: &'a mut mpsc::Sender<Vec<u8>>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match self {
                Node::Leaf(data) => {
                    let (index, _, _) = data.search_ge(store, key, true).await?;
                    for i in index..data.len() {
                        let stored = store.fetch_key(data.keys[i]).await?;
                        if !key.matches(stored.as_slice()) {
                            return Ok(false);
                        }
                        if tx.send(store.fetch_value(data.vals[i]).await?).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Node::Internal(data) => {
                    let (mut index, kpos, dpos) = data.search_ge(store, key, true).await?;
                    if kpos >= 0 && dpos >= 0 {
                        index += 1;
                    }
                    for i in index..=data.len() {
                        let node = store.fetch_node(data.vals[i]).await?;
                        if !node.emit_matches(store, key, tx).await? {
                            return Ok(false);
                        }
                        if i < data.len() {
                            // Stop fanning out once the next separator
                            // moves past the key.
                            let stored = store.fetch_key(data.keys[i]).await?;
                            if !key.matches(stored.as_slice()) {
                                return Ok(false);
                            }
                        }
                    }
                    Ok(true)
                }
            }
        })
    }
}
