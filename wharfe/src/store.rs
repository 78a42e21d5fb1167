//! Store handle
//!
//! A [`Store`] owns everything the tree shares: the two file handles, the
//! block cache, the key/docid byte caches, the root bookkeeping and the
//! drain pipeline. It is created on open and dies on close; there are no
//! process-wide singletons.
//!
//! Two roots are tracked. The *dirty* root is the latest tree produced by
//! a write; the *committed* root is the last one published by a drain.
//! Readers follow the committed root, so a writer can stack up operations
//! without ever mutating a block a reader might hold.

use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::btree::cache::BoundedCache;
use crate::btree::mutation::Mutation;
use crate::btree::node::Node;
use crate::btree::WharfeKey;
use crate::config::Config;
use crate::io::blockfile::BlockFile;
use crate::io::kvlog::KvLog;

#[derive(Debug)]
struct RootState {
    committed: i64,
    dirty: i64,
    height: u32,
    pending_stales: Vec<i64>,
    ops_since_drain: usize,
}

#[derive(Debug)]
pub(crate) struct Store {
    config: Config,
    max_entries: usize,
    blockfile: Mutex<BlockFile>,
    kvlog: Mutex<KvLog>,
    nodes: Mutex<BoundedCache<Arc<Node>>>,
    keybytes: Mutex<BoundedCache<Arc<Vec<u8>>>>,
    docidbytes: Mutex<BoundedCache<Arc<Vec<u8>>>>,
    state: Mutex<RootState>,
    write_gate: Mutex<()>,
    closed: AtomicBool,
}

impl Store {
    /// Create the file pair and plant an empty leaf as the root.
    pub(crate) async fn try_new(config: Config) -> Result<Self> {
        config.validate()?;
        let mut blockfile = BlockFile::try_new(&config).await?;
        let kvlog = KvLog::try_new(&config.kvfile).await?;

        let root = Node::empty_leaf(blockfile.alloc());
        blockfile.write_node(&root).await?;
        blockfile.write_meta(root.offset(), 1).await?;
        blockfile.flush().await?;

        Ok(Self::assemble(config, blockfile, kvlog, root.offset(), 1))
    }

    /// Open an existing file pair at its last published root.
    pub(crate) async fn try_open(config: Config) -> Result<Self> {
        config.validate()?;
        let blockfile = BlockFile::try_open(&config).await?;
        let kvlog = KvLog::try_open(&config.kvfile).await?;
        let (root, height) = blockfile.meta();
        Ok(Self::assemble(config, blockfile, kvlog, root, height))
    }

    fn assemble(
        config: Config,
        blockfile: BlockFile,
        kvlog: KvLog,
        root: i64,
        height: u32,
    ) -> Self {
        let bound = config.max_leaf_cache;
        Self {
            max_entries: config.max_entries(),
            config,
            blockfile: Mutex::new(blockfile),
            kvlog: Mutex::new(kvlog),
            nodes: Mutex::new(BoundedCache::new(bound)),
            keybytes: Mutex::new(BoundedCache::new(bound)),
            docidbytes: Mutex::new(BoundedCache::new(bound)),
            state: Mutex::new(RootState {
                committed: root,
                dirty: root,
                height,
                pending_stales: Vec::new(),
                ops_since_drain: 0,
            }),
            write_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Maximum entries per node. Always even.
    pub(crate) fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub(crate) fn rebalance_thrs(&self) -> usize {
        self.config.rebalance_thrs
    }

    /// Serializes writers; readers never take this.
    pub(crate) fn write_gate(&self) -> &Mutex<()> {
        &self.write_gate
    }

    pub(crate) async fn committed_root(&self) -> i64 {
        self.state.lock().await.committed
    }

    pub(crate) async fn dirty_root(&self) -> (i64, u32) {
        let state = self.state.lock().await;
        (state.dirty, state.height)
    }

    /// Pop a block for a new node.
    pub(crate) async fn alloc_block(&self) -> i64 {
        self.blockfile.lock().await.alloc()
    }

    /// Is this offset pooled for reuse? Audit hook for the invariant walk.
    pub(crate) async fn in_freelist(&self, offset: i64) -> bool {
        self.blockfile.lock().await.contains_free(offset)
    }

    /// Cache-or-load lookup of the node at `offset`.
    pub(crate) async fn fetch_node(&self, offset: i64) -> Result<Arc<Node>> {
        if !self.config.nocache {
            if let Some(node) = self.nodes.lock().await.lookup(offset) {
                return Ok(node);
            }
        }
        let node = Arc::new(self.blockfile.lock().await.read_node(offset).await?);
        if !self.config.nocache {
            self.nodes.lock().await.insert(offset, node.clone());
        }
        Ok(node)
    }

    /// Like [`Store::fetch_node`], on the mutation path: the caller is
    /// about to copy-on-write the node, so a miss is not worth caching.
    pub(crate) async fn fetch_for_update(&self, offset: i64) -> Result<Arc<Node>> {
        if !self.config.nocache {
            if let Some(node) = self.nodes.lock().await.lookup(offset) {
                return Ok(node);
            }
        }
        Ok(Arc::new(self.blockfile.lock().await.read_node(offset).await?))
    }

    /// Key bytes at `offset`, through the key cache.
    pub(crate) async fn fetch_key(&self, offset: i64) -> Result<Arc<Vec<u8>>> {
        if !self.config.nocache {
            if let Some(bytes) = self.keybytes.lock().await.lookup(offset) {
                return Ok(bytes);
            }
        }
        let bytes = Arc::new(self.kvlog.lock().await.read(offset).await?);
        if !self.config.nocache {
            self.keybytes.lock().await.insert(offset, bytes.clone());
        }
        Ok(bytes)
    }

    /// Docid bytes at `offset`, through the docid cache.
    pub(crate) async fn fetch_docid(&self, offset: i64) -> Result<Arc<Vec<u8>>> {
        if !self.config.nocache {
            if let Some(bytes) = self.docidbytes.lock().await.lookup(offset) {
                return Ok(bytes);
            }
        }
        let bytes = Arc::new(self.kvlog.lock().await.read(offset).await?);
        if !self.config.nocache {
            self.docidbytes.lock().await.insert(offset, bytes.clone());
        }
        Ok(bytes)
    }

    /// Uncached record read; values are treated as single-use.
    pub(crate) async fn fetch_value(&self, offset: i64) -> Result<Vec<u8>> {
        self.kvlog.lock().await.read(offset).await
    }

    pub(crate) async fn append_key(&self, bytes: &[u8]) -> Result<i64> {
        let offset = self.kvlog.lock().await.append(bytes).await?;
        if !self.config.nocache {
            self.keybytes
                .lock()
                .await
                .insert(offset, Arc::new(bytes.to_vec()));
        }
        Ok(offset)
    }

    pub(crate) async fn append_docid(&self, bytes: &[u8]) -> Result<i64> {
        let offset = self.kvlog.lock().await.append(bytes).await?;
        if !self.config.nocache {
            self.docidbytes
                .lock()
                .await
                .insert(offset, Arc::new(bytes.to_vec()));
        }
        Ok(offset)
    }

    pub(crate) async fn append_value(&self, bytes: &[u8]) -> Result<i64> {
        self.kvlog.lock().await.append(bytes).await
    }

    /// Compare `key` against the entry at `(kpos, dpos)`. On an exact key
    /// match the resolved key offset comes back non-negative, and with
    /// `check_docid` the docid participates the same way, so equality
    /// against the same record later in the search is free.
    pub(crate) async fn compare_key(
        &self,
        key: &dyn WharfeKey,
        kpos: i64,
        dpos: i64,
        check_docid: bool,
    ) -> Result<(Ordering, i64, i64)> {
        let stored = self.fetch_key(kpos).await?;
        let mut ord = key.bytes().cmp(stored.as_slice());
        let (mut rkpos, mut rdpos) = (-1, -1);
        if ord == Ordering::Equal {
            rkpos = kpos;
            if check_docid {
                let stored = self.fetch_docid(dpos).await?;
                ord = key.docid().cmp(stored.as_slice());
                if ord == Ordering::Equal {
                    rdpos = dpos;
                }
            }
        }
        Ok((ord, rkpos, rdpos))
    }

    /// Take one operation's mutation record: write every commit at its
    /// block, refresh the cache, advance the dirty root and queue the
    /// stales. Drains when the cadence or `sync` says so.
    pub(crate) async fn commit(&self, mv: Mutation, root: i64, height: u32) -> Result<()> {
        let Mutation { stales, commits } = mv;
        tracing::debug!(
            root,
            height,
            commits = commits.len(),
            stales = stales.len(),
            "commit"
        );
        {
            let mut blockfile = self.blockfile.lock().await;
            for node in commits.values() {
                blockfile.write_node(node).await?;
            }
        }
        if !self.config.nocache {
            let mut nodes = self.nodes.lock().await;
            for (offset, mut node) in commits {
                node.data_mut().dirty = false;
                nodes.insert(offset, Arc::new(node));
            }
        }
        let drain = {
            let mut state = self.state.lock().await;
            state.dirty = root;
            state.height = height;
            state.pending_stales.extend(stales);
            state.ops_since_drain += 1;
            self.config.sync || state.ops_since_drain >= self.config.drain_rate
        };
        if drain {
            self.drain().await?;
        }
        Ok(())
    }

    /// Publish the dirty root: fsync as configured, return the queued
    /// stale blocks to the free-list, persist the head and free-list,
    /// then let readers see the new root.
    pub(crate) async fn drain(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let stales = std::mem::take(&mut state.pending_stales);
        tracing::debug!(root = state.dirty, stales = stales.len(), "drain");
        if self.config.sync {
            self.kvlog.lock().await.flush().await?;
        }
        if !self.config.nocache && !stales.is_empty() {
            let mut nodes = self.nodes.lock().await;
            for &offset in &stales {
                nodes.evict(offset);
            }
        }
        {
            let mut blockfile = self.blockfile.lock().await;
            for offset in stales {
                blockfile.free(offset)?;
            }
            blockfile.write_meta(state.dirty, state.height).await?;
            if self.config.sync {
                blockfile.flush().await?;
            }
        }
        state.committed = state.dirty;
        state.ops_since_drain = 0;
        Ok(())
    }

    /// Drain and fsync both files.
    pub(crate) async fn close(&self) -> Result<()> {
        self.drain().await?;
        self.kvlog.lock().await.flush().await?;
        self.blockfile.lock().await.flush().await?;
        self.closed.store(true, atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Delete the file pair.
    pub(crate) async fn destroy(&self) -> Result<()> {
        self.closed.store(true, atomic::Ordering::SeqCst);
        tokio::fs::remove_file(&self.config.idxfile).await?;
        tokio::fs::remove_file(&self.config.kvfile).await?;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(atomic::Ordering::SeqCst)
    }
}
