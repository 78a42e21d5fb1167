//! KV-log functions
//!
//! The kv-log is an append-only record file. Each record is,
//!
//! ```text
//! | 4-byte little-endian size | size-byte payload |
//! ```
//!
//! and its byte offset is the record's identity for the rest of its life.
//! Tree nodes reference keys, docids and values by these offsets; the log
//! only ever grows.

use std::io::SeekFrom;
use std::path::Path;

use anyhow::Result;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum KvLogError {
    #[error("kv record of {0} bytes exceeds the record size limit")]
    RecordTooLarge(usize),

    #[error("kv offset {0} is not valid")]
    BadOffset(i64),
}

/// Record payloads carry a 31-bit length field.
const MAX_RECORD: usize = i32::MAX as usize;

#[derive(Debug)]
pub(crate) struct KvLog {
    wfd: File,
    rfd: File,
}

impl KvLog {
    pub(crate) async fn try_new(path: &Path) -> Result<Self> {
        let wfd = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .await?;
        let rfd = OpenOptions::new().read(true).open(path).await?;
        Ok(Self { wfd, rfd })
    }

    pub(crate) async fn try_open(path: &Path) -> Result<Self> {
        let wfd = OpenOptions::new()
            .create(false)
            .write(true)
            .open(path)
            .await?;
        let rfd = OpenOptions::new().read(true).open(path).await?;
        Ok(Self { wfd, rfd })
    }

    /// Append one record and return its offset.
    pub(crate) async fn append(&mut self, payload: &[u8]) -> Result<i64> {
        if payload.len() > MAX_RECORD {
            return Err(KvLogError::RecordTooLarge(payload.len()).into());
        }
        let offset = self.wfd.seek(SeekFrom::End(0)).await? as i64;
        self.wfd.write_u32_le(payload.len() as u32).await?;
        self.wfd.write_all(payload).await?;
        Ok(offset)
    }

    /// Read back the record at `offset`.
    pub(crate) async fn read(&mut self, offset: i64) -> Result<Vec<u8>> {
        if offset < 0 {
            return Err(KvLogError::BadOffset(offset).into());
        }
        self.rfd.seek(SeekFrom::Start(offset as u64)).await?;
        let size = self.rfd.read_u32_le().await?;
        let mut payload = vec![0; size as usize];
        self.rfd.read_exact(&mut payload).await?;
        Ok(payload)
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.wfd.sync_all().await.map_err(|e| e.into())
    }
}
