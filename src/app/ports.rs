//! Outbound ports of the bridge: the canonical ledger and the transaction
//! pool live behind these traits.

use primitive_types::U256;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::tx::Transaction;
use crate::types::{Address, Hash32, Round, Witness};

/// Summary of one canonical (compaction-chain) block the execution layer
/// knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub number: u64,
    pub hash: Hash32,
    pub state_root: Hash32,
}

/// Read-only view of account state at a specific root.
pub trait StateView {
    fn balance(&self, addr: &Address) -> U256;
    fn nonce(&self, addr: &Address) -> u64;
}

/// The canonical execution block handed to the ledger when consensus
/// delivers a lattice block.
#[derive(Clone, Debug)]
pub struct ExecBlock {
    /// Finalization height: the block number on the canonical chain.
    pub number: u64,
    /// Finalization timestamp, truncated to milliseconds.
    pub time_ms: u64,
    /// Proposer identity mapped to an account address.
    pub coinbase: Address,
    pub gas_limit: u64,
    pub difficulty: u64,
    pub round: Round,
    /// Consensus randomness assigned at finalization.
    pub randomness: Vec<u8>,
    /// The source lattice block (payload cleared, finalization set),
    /// RLP-encoded for archival.
    pub meta: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Error)]
#[error("execution failed: {0}")]
pub struct ExecutionError(pub String);

/// The canonical EVM-like ledger. Its internal concurrency is opaque; every
/// method must be safe to call from any thread.
pub trait Executor: Send + Sync {
    type View: StateView;

    /// Head of the canonical chain.
    fn current(&self) -> ChainHead;

    fn get_by_number(&self, number: u64) -> Option<ChainHead>;

    fn state_at(&self, root: &Hash32) -> Option<Self::View>;

    /// Execute a delivered block on top of the chain state and return the
    /// resulting state root.
    fn process_block(&self, block: ExecBlock, witness: &Witness) -> Result<Hash32, ExecutionError>;

    /// Advance the chain by one empty block (consensus placeholder with no
    /// transactions) and return the resulting state root.
    fn process_empty(&self, block: ExecBlock) -> Result<Hash32, ExecutionError>;
}

/// Pending-transaction source. The pool owns admission and eviction; the
/// bridge only reads a snapshot.
pub trait TxPool: Send + Sync {
    /// Pending transactions grouped by sender, each queue ascending by
    /// nonce. The map ordering fixes the iteration order for payload
    /// proposal, so it must be a pure function of the pool contents.
    fn pending(&self) -> BTreeMap<Address, Vec<Transaction>>;

    /// Committed-state nonce the pool believes an address is at.
    fn state_nonce(&self, addr: &Address) -> u64;
}
