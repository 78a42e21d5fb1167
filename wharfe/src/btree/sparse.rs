use core::hash::{BuildHasherDefault, Hasher};

// Block and kv-log offsets are already unique file positions, so maps keyed
// by them skip real hashing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, _bytes: &[u8]) {
        unimplemented!("IdentityHasher only supports integer keys")
    }

    fn write_i64(&mut self, i: i64) {
        self.0 = i as u64;
    }

    fn write_u64(&mut self, i: u64) {
        self.0 = i;
    }

    fn write_usize(&mut self, i: usize) {
        self.0 = i as u64;
    }
}

pub(crate) type BuildIdentityHasher = BuildHasherDefault<IdentityHasher>;
