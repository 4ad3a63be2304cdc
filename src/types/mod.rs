use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use crate::crypto::SignatureBytes;

pub mod tx;

pub type Round = u64;
pub type Height = u64;
pub type ChainId = u32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self { Self([0u8; 32]) }

    pub fn is_zero(&self) -> bool { self.0 == [0u8; 32] }

    pub fn short(&self) -> String { hex::encode(&self.0[..6]) }
}

/// 20-byte account address, derived from the sender's public key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Remainder of the address interpreted as a big-endian integer,
    /// modulo `modulus`. Used to assign an address to a lattice chain.
    pub fn be_mod(&self, modulus: u32) -> u32 {
        let m = modulus as u64;
        let mut rem: u64 = 0;
        for b in self.0 {
            rem = (rem << 8 | b as u64) % m;
        }
        rem as u32
    }
}

/// 32-byte node identity (hash of the node's public key).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub Hash32);

impl NodeId {
    pub fn is_zero(&self) -> bool { self.0.is_zero() }

    /// Coinbase address of this node: the trailing 20 bytes of the identity.
    pub fn address(&self) -> Address {
        let mut out = [0u8; 20];
        out.copy_from_slice(&(self.0).0[12..]);
        Address(out)
    }
}

/// Position of a block inside the lattice: one slot on one chain in one round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub round: Round,
    pub chain_id: ChainId,
    pub height: Height,
}

impl Position {
    /// Whether this position comes after `other` in consensus time.
    /// Chain id does not participate: positions are compared by round,
    /// then height.
    pub fn newer(&self, other: &Position) -> bool {
        self.round > other.round || (self.round == other.round && self.height > other.height)
    }
}

/// Nanosecond-precision UTC timestamp. On the wire this is a single u64 of
/// nanoseconds since the epoch; decoding restores the (sec, nsec) split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self { Self(nanos) }

    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    pub fn nanos(&self) -> u64 { self.0 }

    pub fn secs(&self) -> u64 { self.0 / 1_000_000_000 }

    pub fn subsec_nanos(&self) -> u32 { (self.0 % 1_000_000_000) as u32 }

    /// Millisecond truncation, the resolution the execution layer sees.
    pub fn millis(&self) -> u64 { self.0 / 1_000_000 }
}

/// Commitment pinning a lattice block to a finalized ancestor on the
/// compaction chain: the proposer's view of committed state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub height: Height,
    pub data: Vec<u8>,
}

/// Finalization data assigned by consensus once a block reaches the
/// compaction chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationResult {
    pub parent_hash: Hash32,
    pub randomness: Vec<u8>,
    pub timestamp: Timestamp,
    pub height: Height,
}

/// Return code for `ChainApp::verify_block`. The integer mapping is part of
/// the wire contract with the consensus core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockVerifyStatus {
    Ok = 0,
    RetryLater = 1,
    Invalid = 2,
}

impl BlockVerifyStatus {
    pub fn code(self) -> u8 { self as u8 }
}

/// A single lattice block as broadcast on the network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub proposer_id: NodeId,
    pub parent_hash: Hash32,
    pub hash: Hash32,
    pub position: Position,
    pub timestamp: Timestamp,
    /// Hashes of acked blocks, sorted ascending by raw bytes.
    pub acks: Vec<Hash32>,
    pub payload: Vec<u8>,
    pub payload_hash: Hash32,
    pub witness: Witness,
    pub finalization: FinalizationResult,
    pub signature: SignatureBytes,
    pub crs_signature: SignatureBytes,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.position.height == 0 && self.parent_hash.is_zero()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalization.height != 0
    }

    /// An "empty block" is a consensus placeholder with a zero proposer;
    /// it carries no payload to execute.
    pub fn is_empty(&self) -> bool {
        self.proposer_id.is_zero()
    }

    /// Binary search over the sorted ack set.
    pub fn is_acking(&self, hash: &Hash32) -> bool {
        self.acks.binary_search(hash).is_ok()
    }
}

/// Ordering key for block heaps.
pub trait BlockOrder {
    fn cmp(a: &Block, b: &Block) -> Ordering;
}

/// Orders blocks by lattice position (round, then height).
pub enum ByPosition {}

impl BlockOrder for ByPosition {
    fn cmp(a: &Block, b: &Block) -> Ordering {
        (a.position.round, a.position.height).cmp(&(b.position.round, b.position.height))
    }
}

/// Orders blocks by assigned finalization height.
pub enum ByFinalizationHeight {}

impl BlockOrder for ByFinalizationHeight {
    fn cmp(a: &Block, b: &Block) -> Ordering {
        a.finalization.height.cmp(&b.finalization.height)
    }
}

struct Slot<O: BlockOrder> {
    block: Block,
    _order: PhantomData<O>,
}

impl<O: BlockOrder> PartialEq for Slot<O> {
    fn eq(&self, other: &Self) -> bool { O::cmp(&self.block, &other.block) == Ordering::Equal }
}
impl<O: BlockOrder> Eq for Slot<O> {}
impl<O: BlockOrder> PartialOrd for Slot<O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<O: BlockOrder> Ord for Slot<O> {
    // Reversed: BinaryHeap is a max-heap, we want pop() to yield the lowest key.
    fn cmp(&self, other: &Self) -> Ordering { O::cmp(&self.block, &other.block).reverse() }
}

/// Min-heap of blocks under a pluggable ordering. `pop` yields the block
/// with the lowest key: the oldest position, or the lowest finalization
/// height, depending on `O`.
pub struct BlockHeap<O: BlockOrder> {
    heap: BinaryHeap<Slot<O>>,
}

impl<O: BlockOrder> Default for BlockHeap<O> {
    fn default() -> Self { Self::new() }
}

impl<O: BlockOrder> BlockHeap<O> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.heap.push(Slot { block, _order: PhantomData });
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.heap.pop().map(|s| s.block)
    }

    pub fn peek(&self) -> Option<&Block> {
        self.heap.peek().map(|s| &s.block)
    }

    pub fn len(&self) -> usize { self.heap.len() }

    pub fn is_empty(&self) -> bool { self.heap.is_empty() }
}
