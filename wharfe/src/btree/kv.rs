//! Key and Value contracts
//!
//! An index entry is a `(key, docid, value)` triple. The key bytes order the
//! tree; the docid bytes break ties between entries sharing a key, so one
//! key may carry many docids. All three are opaque byte strings once they
//! reach the kv-log.

use std::fmt::Debug;

/// Keys which we wish to store in a Wharfe tree.
pub trait WharfeKey: Send + Sync + Debug {
    /// The canonical key bytes.
    fn bytes(&self) -> &[u8];

    /// The secondary discriminant between entries sharing a key.
    fn docid(&self) -> &[u8];

    /// Does this key have the given key bytes?
    fn matches(&self, key_bytes: &[u8]) -> bool {
        self.bytes() == key_bytes
    }
}

/// Values which we wish to store in a Wharfe tree.
pub trait WharfeValue: Send + Sync + Debug {
    /// The value bytes.
    fn bytes(&self) -> &[u8];
}

/// An owned `(key, docid)` pair, the everyday [`WharfeKey`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DocKey {
    key: Vec<u8>,
    docid: Vec<u8>,
}

impl DocKey {
    /// Create a key from key bytes and docid bytes.
    pub fn new(key: impl Into<Vec<u8>>, docid: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            docid: docid.into(),
        }
    }
}

impl WharfeKey for DocKey {
    fn bytes(&self) -> &[u8] {
        &self.key
    }

    fn docid(&self) -> &[u8] {
        &self.docid
    }
}

impl WharfeValue for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl WharfeValue for String {
    fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl WharfeValue for &str {
    fn bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl WharfeValue for &[u8] {
    fn bytes(&self) -> &[u8] {
        self
    }
}
