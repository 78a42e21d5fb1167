//! Index file functions
//!
//! The index file has the following structure
//!
//! ```text
//! Head        (one sector: version, geometry, root offset, height, frontier)
//! Free-list   (flistsize bytes: the persisted pool of reusable blocks)
//!   [Block]   (fixed-size node blocks to the end of the file)
//! ```
//!
//! Block allocation pops the free-list; when the pool is empty a fresh block
//! is carved off the allocation frontier at the end of the file. Offsets
//! only return to the pool once the root that stopped referencing them has
//! been published.

use std::collections::VecDeque;
use std::io::SeekFrom;

use anyhow::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::btree::node::Node;
use crate::config::Config;
use crate::BINCODER;

/// Offsets are signed 64-bit byte positions.
pub(crate) const OFFSET_SIZE: usize = 8;

const FORMAT_VERSION_1: u8 = 1;

const SUPPORTED_VERSIONS: &[u8] = &[FORMAT_VERSION_1];

#[derive(Error, Debug)]
pub enum BlockFileError {
    #[error("index file version not supported: {0}")]
    InvalidFileVersion(u8),

    #[error("index file uses {file}-byte blocks, configuration asked for {config}")]
    BlockSizeMismatch { file: u32, config: u32 },

    #[error("free-list region is full ({0} offsets)")]
    FreelistFull(usize),

    #[error("node at offset {offset} serialized to {need} bytes, blocks are {blocksize}")]
    BlockOverflow {
        offset: i64,
        need: usize,
        blocksize: u32,
    },

    #[error("offset {0} does not address a block")]
    BadOffset(i64),
}

#[derive(Debug, Serialize, Deserialize)]
struct Head {
    version: u8,
    blocksize: u32,
    root: i64,
    height: u32,
    frontier: i64,
}

/// The pool of reusable block offsets. Last freed, first reused.
#[derive(Debug)]
pub(crate) struct Freelist {
    free: VecDeque<i64>,
    capacity: usize,
}

impl Freelist {
    fn new(capacity: usize) -> Self {
        Self {
            free: VecDeque::new(),
            capacity,
        }
    }

    fn pop(&mut self) -> Option<i64> {
        self.free.pop_front()
    }

    fn push(&mut self, offset: i64) -> Result<(), BlockFileError> {
        if self.free.len() >= self.capacity {
            return Err(BlockFileError::FreelistFull(self.free.len()));
        }
        self.free.push_front(offset);
        Ok(())
    }

    fn contains(&self, offset: i64) -> bool {
        self.free.contains(&offset)
    }
}

#[derive(Debug)]
pub(crate) struct BlockFile {
    file: File,
    head: Head,
    freelist: Freelist,
    sectorsize: u32,
    flistsize: u32,
}

impl BlockFile {
    pub(crate) async fn try_new(config: &Config) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.idxfile)
            .await?;

        // The head and free-list regions must be readable in full on open.
        file.set_len((config.sectorsize + config.flistsize) as u64)
            .await?;

        let head = Head {
            version: FORMAT_VERSION_1,
            blocksize: config.blocksize,
            root: 0,
            height: 0,
            frontier: (config.sectorsize + config.flistsize) as i64,
        };

        let mut this = Self {
            file,
            head,
            freelist: Freelist::new(config.flistsize as usize / OFFSET_SIZE - 1),
            sectorsize: config.sectorsize,
            flistsize: config.flistsize,
        };
        this.write_meta(0, 0).await?;
        Ok(this)
    }

    pub(crate) async fn try_open(config: &Config) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(&config.idxfile)
            .await?;

        let mut buf = vec![0; config.sectorsize as usize];
        file.seek(SeekFrom::Start(0)).await?;
        file.read_exact(&mut buf).await?;
        let head: Head = BINCODER.deserialize(&buf)?;

        if !SUPPORTED_VERSIONS.contains(&head.version) {
            return Err(BlockFileError::InvalidFileVersion(head.version).into());
        }
        if head.blocksize != config.blocksize {
            return Err(BlockFileError::BlockSizeMismatch {
                file: head.blocksize,
                config: config.blocksize,
            }
            .into());
        }

        let mut buf = vec![0; config.flistsize as usize];
        file.seek(SeekFrom::Start(config.sectorsize as u64)).await?;
        file.read_exact(&mut buf).await?;
        let free: VecDeque<i64> = BINCODER.deserialize(&buf)?;

        Ok(Self {
            file,
            head,
            freelist: Freelist {
                free,
                capacity: config.flistsize as usize / OFFSET_SIZE - 1,
            },
            sectorsize: config.sectorsize,
            flistsize: config.flistsize,
        })
    }

    /// Published root offset and tree height.
    pub(crate) fn meta(&self) -> (i64, u32) {
        (self.head.root, self.head.height)
    }

    /// Pop a reusable block, or carve one off the end of the file.
    pub(crate) fn alloc(&mut self) -> i64 {
        match self.freelist.pop() {
            Some(offset) => offset,
            None => {
                let offset = self.head.frontier;
                self.head.frontier += self.head.blocksize as i64;
                offset
            }
        }
    }

    /// Return a stale block to the pool.
    pub(crate) fn free(&mut self, offset: i64) -> Result<()> {
        self.freelist.push(offset).map_err(|e| e.into())
    }

    pub(crate) fn contains_free(&self, offset: i64) -> bool {
        self.freelist.contains(offset)
    }

    pub(crate) async fn read_node(&mut self, offset: i64) -> Result<Node> {
        let origin = (self.sectorsize + self.flistsize) as i64;
        if offset < origin || (offset - origin) % self.head.blocksize as i64 != 0 {
            return Err(BlockFileError::BadOffset(offset).into());
        }
        let mut buf = vec![0; self.head.blocksize as usize];
        self.file.seek(SeekFrom::Start(offset as u64)).await?;
        self.file.read_exact(&mut buf).await?;
        let mut node: Node = BINCODER.deserialize(&buf)?;
        node.data_mut().offset = offset;
        Ok(node)
    }

    pub(crate) async fn write_node(&mut self, node: &Node) -> Result<()> {
        let bytes = BINCODER.serialize(node)?;
        if bytes.len() > self.head.blocksize as usize {
            return Err(BlockFileError::BlockOverflow {
                offset: node.offset(),
                need: bytes.len(),
                blocksize: self.head.blocksize,
            }
            .into());
        }
        // Write the whole block so a read_exact at any allocated offset
        // never runs off the end of the file.
        let mut block = vec![0; self.head.blocksize as usize];
        block[..bytes.len()].copy_from_slice(&bytes);
        self.file.seek(SeekFrom::Start(node.offset() as u64)).await?;
        self.file.write_all(&block).await?;
        Ok(())
    }

    /// Publish the head and the free-list.
    pub(crate) async fn write_meta(&mut self, root: i64, height: u32) -> Result<()> {
        self.head.root = root;
        self.head.height = height;

        let s_head = BINCODER.serialize(&self.head)?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&s_head).await?;

        let s_free = BINCODER.serialize(&self.freelist.free)?;
        self.file.seek(SeekFrom::Start(self.sectorsize as u64)).await?;
        self.file.write_all(&s_free).await?;
        Ok(())
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.file.sync_all().await.map_err(|e| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NodeData;

    fn test_config(name: &str) -> Config {
        let mut config = Config::new(format!("{name}.idx"), format!("{name}.kv"));
        config.blocksize = 136;
        config.rebalance_thrs = 2;
        config
    }

    #[tokio::test]
    async fn it_creates_and_reopens_an_index_file() {
        let config = test_config("blockfile_create");
        let mut file = BlockFile::try_new(&config).await.expect("creates index");
        let offset = file.alloc();
        file.write_meta(offset, 1).await.expect("publishes");
        file.flush().await.expect("flushed away");
        drop(file);
        let file = BlockFile::try_open(&config).await.expect("opens index");
        assert_eq!(file.meta(), (offset, 1));
        std::fs::remove_file("blockfile_create.idx").expect("cleanup");
    }

    #[tokio::test]
    async fn it_recycles_freed_blocks_lifo() {
        let config = test_config("blockfile_freelist");
        let mut file = BlockFile::try_new(&config).await.expect("creates index");
        let first = file.alloc();
        let second = file.alloc();
        assert_eq!(second, first + config.blocksize as i64);
        file.free(first).expect("freed");
        file.free(second).expect("freed");
        assert!(file.contains_free(first));
        // Last freed, first reused.
        assert_eq!(file.alloc(), second);
        assert_eq!(file.alloc(), first);
        assert!(!file.contains_free(first));
        std::fs::remove_file("blockfile_freelist.idx").expect("cleanup");
    }

    #[tokio::test]
    async fn it_persists_the_free_list() {
        let config = test_config("blockfile_persist");
        let mut file = BlockFile::try_new(&config).await.expect("creates index");
        let first = file.alloc();
        let _second = file.alloc();
        file.free(first).expect("freed");
        file.write_meta(0, 0).await.expect("publishes");
        drop(file);
        let mut file = BlockFile::try_open(&config).await.expect("opens index");
        assert!(file.contains_free(first));
        assert_eq!(file.alloc(), first);
        std::fs::remove_file("blockfile_persist.idx").expect("cleanup");
    }

    #[tokio::test]
    async fn it_round_trips_a_node_block(){
        let config = test_config("blockfile_node");
        let mut file = BlockFile::try_new(&config).await.expect("creates index");
        let offset = file.alloc();
        let mut data = NodeData::fresh(offset);
        data.keys = vec![10, 20];
        data.docids = vec![14, 24];
        data.vals = vec![30, 40, 0];
        file.write_node(&Node::Leaf(data)).await.expect("writes");
        let node = file.read_node(offset).await.expect("reads");
        assert!(node.is_leaf());
        assert_eq!(node.offset(), offset);
        assert_eq!(node.data().keys, vec![10, 20]);
        assert_eq!(node.data().vals, vec![30, 40, 0]);
        std::fs::remove_file("blockfile_node.idx").expect("cleanup");
    }

    #[tokio::test]
    async fn it_rejects_unaligned_offsets() {
        let config = test_config("blockfile_unaligned");
        let mut file = BlockFile::try_new(&config).await.expect("creates index");
        let offset = file.alloc();
        assert!(file.read_node(offset + 1).await.is_err());
        assert!(file.read_node(-8).await.is_err());
        std::fs::remove_file("blockfile_unaligned.idx").expect("cleanup");
    }
}
