#![warn(missing_docs)]
//! Wharfe B+Tree index
//!
//! # Why is this called Wharfe?
//!
//! All the good names for B+Trees have gone, so this crate is named after the
//! river in the next valley over.
//!
//! # Implementation Details
//!
//! Provides a persistent, copy-on-write B+Tree index over a pair of files:
//!
//!  - an *index file* of fixed-size blocks holding the tree nodes,
//!  - a *kv-log*, an append-only record file holding key, docid and value
//!    bytes.
//!
//! Tree nodes never store key or value bytes directly. Every slot is a byte
//! offset into the kv-log, so a node is three small arrays of offsets and a
//! comparison may cost a log read. A bounded block cache and a pair of
//! key/docid byte caches keep that cost down, and the comparator hands its
//! resolved offsets back to the caller so a search never reads the same
//! record twice.
//!
//! A node is either:
//!  - Leaf node, whose value slots reference kv-log records
//!  - Internal node, whose value slots reference child blocks
//!
//! Mutation is copy-on-write: every node on the path from the root to the
//! change is cloned onto a fresh block popped from the free-list, and the
//! operation accumulates the replaced block offsets (stales) and the new
//! nodes (commits). Once a write drains, the new root is published and the
//! stale blocks return to the free-list; until then the previous root keeps
//! serving readers unchanged.
//!
//! Entries are `(key, docid, value)` triples ordered by key bytes first and
//! docid bytes second, so one key may hold many docids and a lookup streams
//! every value recorded under the key.
//!
//! At load/store to disk, a node is serialized/deserialized using bincode.

pub mod btree;
pub mod config;
mod io;
mod store;

use bincode::config::AllowTrailing;
use bincode::config::FixintEncoding;
use bincode::config::WithOtherIntEncoding;
use bincode::config::WithOtherTrailing;
use bincode::{DefaultOptions, Options};
use std::sync::LazyLock;

// Nodes deserialize from whole fixed-size blocks, so trailing bytes must be
// tolerated.
static BINCODER: LazyLock<
    WithOtherIntEncoding<WithOtherTrailing<DefaultOptions, AllowTrailing>, FixintEncoding>,
> = LazyLock::new(|| {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .with_fixint_encoding()
});
