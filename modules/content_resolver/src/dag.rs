//! Merkle-DAG block layout
//!
//! Content is split into raw leaf blocks; anything larger than one chunk
//! gets an interior node listing the leaf addresses in order. Block
//! addresses are CIDv1 over the sha2-256 of the block bytes, so a fetched
//! block can always be verified against the address it was requested by.

use cid::{multihash::Multihash, Cid};
use minicbor::{bytes::ByteVec, Decode, Encode};
use sha2::{Digest, Sha256};

use crate::store::BlockStore;

/// Codec for raw leaf blocks
pub const RAW_CODEC: u64 = 0x55;

/// Codec for interior nodes
pub const NODE_CODEC: u64 = 0x71;

/// Multihash code for sha2-256
const SHA2_256: u64 = 0x12;

/// Chunk size when splitting content into leaves
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Interior DAG node: an ordered list of child block addresses
#[derive(Debug, Clone, Encode, Decode)]
pub struct DagNode {
    #[n(0)]
    pub links: Vec<ByteVec>,
}

/// Address a block by its content
pub fn block_cid(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let hash =
        Multihash::wrap(SHA2_256, digest.as_slice()).expect("sha2-256 digest fits a multihash");
    Cid::new_v1(codec, hash)
}

/// Check a fetched block against the address it was requested by
pub fn verify_block(cid: &Cid, data: &[u8]) -> bool {
    block_cid(cid.codec(), data) == *cid
}

/// Split `bytes` into blocks, write them through the store and return the
/// root address they can be reassembled from
pub fn add_bytes(store: &BlockStore, bytes: &[u8]) -> Cid {
    if bytes.len() <= CHUNK_SIZE {
        let cid = block_cid(RAW_CODEC, bytes);
        store.put(cid, bytes.to_vec());
        return cid;
    }

    let mut links = Vec::new();
    for chunk in bytes.chunks(CHUNK_SIZE) {
        let cid = block_cid(RAW_CODEC, chunk);
        store.put(cid, chunk.to_vec());
        links.push(ByteVec::from(cid.to_bytes()));
    }

    let node = DagNode { links };
    let encoded = minicbor::to_vec(&node).expect("DAG node encoding cannot fail");
    let cid = block_cid(NODE_CODEC, &encoded);
    store.put(cid, encoded);
    cid
}
