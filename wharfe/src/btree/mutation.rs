//! Per-operation mutation record
//!
//! One [`Mutation`] is created per top-level insert or remove. The recursion
//! appends the block offsets it retires (`stales`) in the order it retires
//! them, and parks every copy-on-write clone and freshly spawned node in
//! `commits` once nothing will mutate it further. The store consumes the
//! record: commits are written durably, then the stales return to the
//! free-list, then the new root is published.

use std::collections::HashMap;

use super::node::Node;
use super::sparse::BuildIdentityHasher;

#[derive(Debug, Default)]
pub(crate) struct Mutation {
    pub(crate) stales: Vec<i64>,
    pub(crate) commits: HashMap<i64, Node, BuildIdentityHasher>,
}

impl Mutation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stale(&mut self, offset: i64) {
        self.stales.push(offset);
    }

    pub(crate) fn commit(&mut self, node: Node) {
        self.commits.insert(node.offset(), node);
    }
}
