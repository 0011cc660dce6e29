/// Maps a namespace to one of a fixed number of buckets with FNV-1a.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacePlanner {
    buckets: u16,
}

impl NamespacePlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.clamp(1, u16::MAX as usize) as u16 }
    }

    pub fn buckets(&self) -> usize {
        self.buckets as usize
    }

    pub fn plan(&self, namespace: &str) -> usize {
        if self.buckets <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325;
        for b in namespace.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.buckets as u64) as usize
    }
}
