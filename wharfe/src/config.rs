//! Store configuration
//!
//! A [`Config`] names the two backing files and fixes the on-disk geometry
//! of the index file. The geometry values are baked into the file at
//! creation time, so opening an existing store with a different block size
//! is rejected.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::btree::node::{BLOCK_OVERHEAD, ENTRY_COST};
use crate::io::blockfile::OFFSET_SIZE;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The block size cannot hold a useful node.
    #[error("block size {0} is too small to hold a node of four entries")]
    BlockTooSmall(u32),

    /// The rebalance threshold must leave room for rotation.
    #[error("rebalance threshold {thrs} must be between 1 and {max} (half the node capacity)")]
    BadThreshold {
        /// The rejected threshold.
        thrs: usize,
        /// Half the node capacity implied by the block size.
        max: usize,
    },

    /// The free-list region must hold whole offsets.
    #[error("free-list size {0} must be a non-zero multiple of {OFFSET_SIZE}")]
    BadFreelistSize(u32),

    /// The head must fit in the first sector.
    #[error("sector size {0} cannot hold the head block")]
    SectorTooSmall(u32),

    /// The append ratio is a proportion.
    #[error("append ratio {0} must be within (0, 1]")]
    BadAppendRatio(f32),

    /// The tree must be allowed at least one level.
    #[error("max level must be at least 1")]
    BadMaxLevel,

    /// Draining every zero operations makes no sense.
    #[error("drain rate must be at least 1")]
    BadDrainRate,

    /// The block cache must hold at least one node.
    #[error("cache bound must be at least 1")]
    BadCacheBound,
}

/// Configuration for a Wharfe store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path of the index file (tree nodes, free-list, head).
    pub idxfile: PathBuf,
    /// Path of the kv-log (append-only key/docid/value records).
    pub kvfile: PathBuf,
    /// Bytes reserved at the front of the index file for the head.
    pub sectorsize: u32,
    /// Bytes reserved for the persisted free-list, a multiple of the
    /// 8-byte offset size.
    pub flistsize: u32,
    /// Size of a node block in the index file.
    pub blocksize: u32,
    /// Upper bound on tree height; a root split beyond this fails.
    pub maxlevel: u32,
    /// Minimum entry count a node may hold before it requests rebalance
    /// from its parent on delete.
    pub rebalance_thrs: usize,
    /// Proportion of a node filled before append-optimized packing kicks
    /// in. Reserved for the writer pipeline; the tree core ignores it.
    pub append_ratio: f32,
    /// Number of write operations between automatic drains of the head and
    /// free-list.
    pub drain_rate: usize,
    /// Entry bound of the block cache (and of each byte cache).
    pub max_leaf_cache: usize,
    /// Fsync both files on every drain.
    pub sync: bool,
    /// Disable the block cache and the key/docid byte caches.
    pub nocache: bool,
    /// Run the full invariant walk after every write.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idxfile: PathBuf::from("wharfe.idx"),
            kvfile: PathBuf::from("wharfe.kv"),
            sectorsize: 512,
            flistsize: 8 * 2048,
            blocksize: 4096,
            maxlevel: 12,
            rebalance_thrs: 8,
            append_ratio: 0.7,
            drain_rate: 64,
            max_leaf_cache: 1024,
            sync: false,
            nocache: false,
            debug: false,
        }
    }
}

// The head serializes to well under this; see io::blockfile::Head.
const MIN_SECTOR: u32 = 64;

impl Config {
    /// Create a configuration for the given file pair, with defaults for
    /// everything else.
    pub fn new(idxfile: impl Into<PathBuf>, kvfile: impl Into<PathBuf>) -> Self {
        Self {
            idxfile: idxfile.into(),
            kvfile: kvfile.into(),
            ..Default::default()
        }
    }

    /// Maximum number of entries a node block can hold. Always even.
    pub fn max_entries(&self) -> usize {
        ((self.blocksize as usize).saturating_sub(BLOCK_OVERHEAD) / ENTRY_COST) & !1
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let max = self.max_entries();
        if max < 4 {
            return Err(ConfigError::BlockTooSmall(self.blocksize));
        }
        if self.rebalance_thrs < 1 || self.rebalance_thrs > max / 2 {
            return Err(ConfigError::BadThreshold {
                thrs: self.rebalance_thrs,
                max: max / 2,
            });
        }
        if self.flistsize == 0 || self.flistsize as usize % OFFSET_SIZE != 0 {
            return Err(ConfigError::BadFreelistSize(self.flistsize));
        }
        if self.sectorsize < MIN_SECTOR {
            return Err(ConfigError::SectorTooSmall(self.sectorsize));
        }
        if !(self.append_ratio > 0.0 && self.append_ratio <= 1.0) {
            return Err(ConfigError::BadAppendRatio(self.append_ratio));
        }
        if self.maxlevel < 1 {
            return Err(ConfigError::BadMaxLevel);
        }
        if self.drain_rate < 1 {
            return Err(ConfigError::BadDrainRate);
        }
        if self.max_leaf_cache < 1 {
            return Err(ConfigError::BadCacheBound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_derives_an_even_capacity() {
        let mut config = Config::default();
        config.blocksize = 4096;
        assert_eq!(config.max_entries() % 2, 0);
        assert!(config.max_entries() >= 4);
        config.blocksize = 136;
        assert_eq!(config.max_entries(), 4);
    }

    #[test]
    fn it_rejects_tiny_blocks() {
        let mut config = Config::default();
        config.blocksize = 64;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlockTooSmall(_))
        ));
    }

    #[test]
    fn it_rejects_an_oversized_threshold() {
        let mut config = Config::default();
        config.blocksize = 136;
        config.rebalance_thrs = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadThreshold { .. })
        ));
    }
}
