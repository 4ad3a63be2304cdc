//! Per-chain overlay of confirmed-but-undelivered blocks.
//!
//! Between `block_confirmed` and `block_delivered` a block's transactions
//! are not yet in committed state, but they have already spoken for funds
//! and nonces. This ledger answers, per chain and address, the last nonce
//! used and the cumulative cost (`gas * gas_price + value`) across all such
//! blocks, so that proposal and verification see committed state plus the
//! speculative overlay. Removing a block on delivery subtracts its
//! contribution before the execution layer re-applies it, keeping each
//! transaction counted exactly once.

use parking_lot::Mutex;
use primitive_types::U256;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::codec;
use crate::crypto::sender::SenderCache;
use crate::crypto::CryptoError;
use crate::types::tx::Transaction;
use crate::types::{Address, Block, ChainId, Hash32, Height};

#[derive(Debug, Error)]
pub enum SpeculativeError {
    #[error("payload decode: {0}")]
    PayloadDecode(rlp::DecoderError),
    #[error("sender recovery: {0}")]
    SenderRecovery(#[from] CryptoError),
    #[error("block {0:?} already confirmed on chain {1}")]
    DuplicateBlock(Hash32, ChainId),
}

struct ConfirmedEntry {
    block: Block,
    txs: Vec<Transaction>,
    senders: Vec<Address>,
}

#[derive(Default)]
struct ChainOverlay {
    /// Confirmed blocks in confirmation order.
    entries: Vec<ConfirmedEntry>,
    /// Last nonce observed per address across all entries.
    pending_nonce: HashMap<Address, u64>,
    /// Cumulative cost per address across all entries.
    pending_cost: HashMap<Address, U256>,
    /// Height of the most recently confirmed block; survives delivery so
    /// the next height check still has an anchor.
    last_height: Option<Height>,
}

impl ChainOverlay {
    fn fold_entry(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        for (tx, sender) in entry.txs.iter().zip(&entry.senders) {
            self.pending_nonce.insert(*sender, tx.nonce);
            let slot = self.pending_cost.entry(*sender).or_insert_with(U256::zero);
            *slot = slot.saturating_add(tx.cost());
        }
    }

    fn rebuild(&mut self) {
        self.pending_nonce.clear();
        self.pending_cost.clear();
        for idx in 0..self.entries.len() {
            self.fold_entry(idx);
        }
    }
}

/// Thread-safe speculative state for all chains. Chains are independent: an
/// address can carry separate overlays on several chains at once.
#[derive(Default)]
pub struct SpeculativeLedger {
    chains: Mutex<HashMap<ChainId, ChainOverlay>>,
}

impl SpeculativeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed block: decode its payload, recover the senders
    /// and fold nonces and costs into the chain overlay.
    pub fn append(
        &self,
        chain_id: ChainId,
        block: Block,
        senders: &SenderCache,
    ) -> Result<(), SpeculativeError> {
        let txs = if block.payload.is_empty() {
            Vec::new()
        } else {
            codec::decode_transactions(&block.payload).map_err(SpeculativeError::PayloadDecode)?
        };
        let recovered = senders.recover_all(&txs)?;

        let mut chains = self.chains.lock();
        let overlay = chains.entry(chain_id).or_default();
        if overlay.entries.iter().any(|e| e.block.hash == block.hash) {
            return Err(SpeculativeError::DuplicateBlock(block.hash, chain_id));
        }

        debug!(
            chain = chain_id,
            height = block.position.height,
            txs = txs.len(),
            "confirmed block appended"
        );
        overlay.last_height = Some(block.position.height);
        overlay.entries.push(ConfirmedEntry { block, txs, senders: recovered });
        let idx = overlay.entries.len() - 1;
        overlay.fold_entry(idx);
        Ok(())
    }

    /// Drop a block from the overlay, subtracting its contribution. The
    /// derived maps are rebuilt from the remaining blocks so that nonces
    /// revert exactly.
    pub fn remove(&self, chain_id: ChainId, hash: &Hash32) -> bool {
        let mut chains = self.chains.lock();
        let Some(overlay) = chains.get_mut(&chain_id) else { return false };
        let Some(idx) = overlay.entries.iter().position(|e| e.block.hash == *hash) else {
            return false;
        };
        overlay.entries.remove(idx);
        overlay.rebuild();
        true
    }

    /// Confirmed block and its decoded transactions, by hash.
    pub fn get(&self, chain_id: ChainId, hash: &Hash32) -> Option<(Block, Vec<Transaction>)> {
        let chains = self.chains.lock();
        let overlay = chains.get(&chain_id)?;
        overlay
            .entries
            .iter()
            .find(|e| e.block.hash == *hash)
            .map(|e| (e.block.clone(), e.txs.clone()))
    }

    /// Last nonce used by `addr` in confirmed blocks on this chain, if any.
    pub fn pending_nonce(&self, chain_id: ChainId, addr: &Address) -> Option<u64> {
        self.chains
            .lock()
            .get(&chain_id)
            .and_then(|o| o.pending_nonce.get(addr).copied())
    }

    /// Cumulative cost already spoken for by `addr` on this chain.
    pub fn pending_cost(&self, chain_id: ChainId, addr: &Address) -> U256 {
        self.chains
            .lock()
            .get(&chain_id)
            .and_then(|o| o.pending_cost.get(addr).copied())
            .unwrap_or_else(U256::zero)
    }

    /// Height of the most recently confirmed block on this chain. Stays in
    /// place when that block is delivered.
    pub fn last_confirmed_height(&self, chain_id: ChainId) -> Option<Height> {
        self.chains.lock().get(&chain_id).and_then(|o| o.last_height)
    }

    pub fn confirmed_len(&self, chain_id: ChainId) -> usize {
        self.chains.lock().get(&chain_id).map(|o| o.entries.len()).unwrap_or(0)
    }
}
