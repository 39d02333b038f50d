use std::sync::Arc;

use cid::Cid;
use dashmap::DashMap;

/// In-memory content-addressed block store.
///
/// Write-through cache shared between the serving and fetching sides of the
/// swarm. No eviction: it grows for the lifetime of the process.
#[derive(Clone, Default)]
pub struct BlockStore {
    blocks: Arc<DashMap<Cid, Vec<u8>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.blocks.get(cid).map(|entry| entry.clone())
    }

    pub fn put(&self, cid: Cid, data: Vec<u8>) {
        self.blocks.insert(cid, data);
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
