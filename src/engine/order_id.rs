//! Client order id generation.
//!
//! Ids look like `xp-1f2e3d4c-42`: a per-boot random prefix plus a process
//! sequence. The prefix keeps ids from colliding with orders placed by an
//! earlier run of the process, the sequence keeps them unique within this one.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

pub struct OrderIdGenerator {
    prefix: String,
    seq:    AtomicU64,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        let boot = Uuid::new_v4().simple().to_string();
        Self {
            prefix: format!("xp-{}", &boot[..8]),
            seq:    AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

impl Default for OrderIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
