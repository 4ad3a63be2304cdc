//! Per-chain application core: the bridge between the consensus core and
//! the deterministic execution layer.
//!
//! Consensus calls in through five entry points:
//!   - `prepare_payload` — build a transaction list for one chain slot
//!     under strict time and gas budgets; never errors, at worst empty.
//!   - `prepare_witness` — commit to the current canonical head.
//!   - `verify_block` — check a peer's payload against committed state plus
//!     the speculative overlay of confirmed-but-undelivered blocks.
//!   - `block_confirmed` — fold a consensus-accepted block into the
//!     speculative overlay.
//!   - `block_delivered` — execute a finalized block on the canonical
//!     chain, in the order consensus dictates.
//!
//! Each chain is guarded by its own read/write lock, created on first use.
//! Proposal and verification take it shared; confirm and deliver take it
//! exclusively. Witness preparation reads the canonical head without any
//! chain lock.

pub mod ports;

pub use ports::{ChainHead, ExecBlock, ExecutionError, Executor, StateView, TxPool};

use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::codec;
use crate::config::BridgeConfig;
use crate::crypto::sender::SenderCache;
use crate::governance::Governance;
use crate::speculative::SpeculativeLedger;
use crate::types::tx::{intrinsic_gas, Transaction};
use crate::types::{
    Address, Block, BlockVerifyStatus, ChainId, FinalizationResult, Hash32, Position, Round,
    Witness,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("previous block not exists")]
    PreviousBlockNotExists,
    #[error("current height {current} < consensus height {requested}")]
    HeightTooLow { current: u64, requested: u64 },
    #[error("no state at root {0}")]
    StateNotFound(String),
    #[error("nonce gap: expect {expected} actual {actual}")]
    NonceGap { expected: u64, actual: u64 },
}

/// Published once per newly canonical height after a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedBlockEvent {
    pub number: u64,
    pub hash: Hash32,
}

#[derive(Clone, Debug, Default)]
pub struct AppMetrics {
    pub payloads_prepared: u64,
    pub payloads_empty: u64,
    pub payload_deadlines_missed: u64,
    pub verify_ok: u64,
    pub verify_retry_later: u64,
    pub verify_invalid: u64,
    pub blocks_confirmed: u64,
    pub blocks_delivered: u64,
}

struct Inner<E, P, G> {
    executor: E,
    pool: P,
    gov: G,
    cfg: BridgeConfig,

    /// Per-chain locks, created on first use and never removed.
    chain_locks: Mutex<HashMap<ChainId, Arc<RwLock<()>>>>,
    /// State root of the most recently delivered block per chain.
    chain_roots: RwLock<HashMap<ChainId, Hash32>>,
    speculative: SpeculativeLedger,
    senders: SenderCache,
    /// Round of the most recently delivered block, any chain.
    delivered_round: AtomicU64,

    finalized_subs: Mutex<Vec<mpsc::Sender<FinalizedBlockEvent>>>,
    metrics: Mutex<AppMetrics>,
}

pub struct ChainApp<E, P, G> {
    inner: Arc<Inner<E, P, G>>,
}

impl<E, P, G> Clone for ChainApp<E, P, G> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Check that nonces per sender form a contiguous ascending run and return
/// each sender's first nonce.
fn validate_nonces(
    txs: &[Transaction],
    senders: &[Address],
) -> Result<HashMap<Address, u64>, AppError> {
    let mut first: HashMap<Address, u64> = HashMap::new();
    let mut last: HashMap<Address, u64> = HashMap::new();
    for (tx, sender) in txs.iter().zip(senders) {
        match last.get_mut(sender) {
            Some(prev) => {
                let expected = prev.wrapping_add(1);
                if expected != tx.nonce {
                    return Err(AppError::NonceGap { expected, actual: tx.nonce });
                }
                *prev = tx.nonce;
            }
            None => {
                last.insert(*sender, tx.nonce);
                first.insert(*sender, tx.nonce);
            }
        }
    }
    Ok(first)
}

impl<E, P, G> Inner<E, P, G>
where
    E: Executor,
    P: TxPool,
    G: Governance,
{
    fn chain_lock(&self, chain_id: ChainId) -> Arc<RwLock<()>> {
        let mut locks = self.chain_locks.lock();
        locks.entry(chain_id).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    fn chain_root(&self, chain_id: ChainId) -> Option<Hash32> {
        self.chain_roots.read().get(&chain_id).copied()
    }

    /// The payload gate during a chain-set reshape: when the number of
    /// chains changes at `round` and no block of `round` has been delivered
    /// yet, committing payload would risk replay on a chain that no longer
    /// exists, so payloads must be empty.
    fn payload_gated(&self, round: Round) -> bool {
        if round == 0 {
            return false;
        }
        if self.gov.num_chains(round) == self.gov.num_chains(round - 1) {
            return false;
        }
        self.delivered_round.load(AtomicOrdering::Acquire) < round
    }

    fn prepare_payload_inner(
        &self,
        position: Position,
        deadline: Instant,
    ) -> Result<Vec<u8>, AppError> {
        let lock = self.chain_lock(position.chain_id);
        let _guard = lock.read();
        // The lock itself may have eaten the budget.
        if Instant::now() >= deadline {
            return Ok(Vec::new());
        }

        if self.payload_gated(position.round) {
            return Ok(Vec::new());
        }

        if position.height != 0 {
            match self.speculative.last_confirmed_height(position.chain_id) {
                Some(h) if h == position.height - 1 => {}
                prev => {
                    debug!(
                        chain = position.chain_id,
                        height = position.height,
                        ?prev,
                        "previous confirmed block not exists"
                    );
                    return Err(AppError::PreviousBlockNotExists);
                }
            }
        }

        let Some(root) = self.chain_root(position.chain_id) else {
            return Ok(Vec::new());
        };
        let Some(state) = self.executor.state_at(&root) else {
            return Err(AppError::StateNotFound(root.short()));
        };

        debug!(chain = position.chain_id, height = position.height, "prepare payload");

        let pending = self.pool.pending();
        let num_chains = self.gov.num_chains(position.round);
        let block_gas_limit = self.gov.block_gas_limit(position.round);
        let mut block_gas_used: u64 = 0;
        let mut all_txs: Vec<Transaction> = Vec::new();

        'addresses: for (address, queue) in pending {
            if Instant::now() >= deadline {
                break;
            }
            // Only transactions slotted to this chain are eligible.
            if address.be_mod(num_chains) != position.chain_id {
                continue;
            }

            let pending_cost = self.speculative.pending_cost(position.chain_id, &address);
            let Some(mut balance) = state.balance(&address).checked_sub(pending_cost) else {
                continue;
            };

            let expect_nonce = match self.speculative.pending_nonce(position.chain_id, &address) {
                Some(n) => n + 1,
                None => state.nonce(&address),
            };

            let Some(first) = queue.first() else { continue };
            // The pool also tracks txs learned while syncing, so the
            // expected nonce may sit below the queue start.
            let Some(start) = expect_nonce.checked_sub(first.nonce) else { continue };

            for tx in queue.iter().skip(start as usize) {
                if tx.gas < intrinsic_gas(tx) {
                    warn!(tx = %codec::tx_hash(tx).short(), "intrinsic gas too low");
                    break;
                }

                balance = match balance.checked_sub(tx.cost()) {
                    Some(b) => b,
                    None => {
                        warn!(tx = %codec::tx_hash(tx).short(), "insufficient funds for gas * price + value");
                        break;
                    }
                };

                block_gas_used = block_gas_used.saturating_add(tx.gas);
                if block_gas_used > block_gas_limit {
                    break 'addresses;
                }

                all_txs.push(tx.clone());
            }
        }

        Ok(codec::encode_transactions(&all_txs))
    }

    fn verify_block_inner(&self, block: &Block) -> BlockVerifyStatus {
        let witness_hash = match codec::decode_witness_data(&block.witness.data) {
            Ok(h) => h,
            Err(e) => {
                error!("witness data decode: {e}");
                return BlockVerifyStatus::Invalid;
            }
        };

        // Witness must point at a block we already consider canonical.
        let head = self.executor.current();
        if head.number < block.witness.height {
            debug!(
                current = head.number,
                witness = block.witness.height,
                "current height below witness height"
            );
            return BlockVerifyStatus::RetryLater;
        }

        let Some(witness_block) = self.executor.get_by_number(block.witness.height) else {
            error!(height = block.witness.height, "no canonical block at witness height");
            return BlockVerifyStatus::Invalid;
        };
        if witness_block.hash != witness_hash {
            error!(
                expect = %witness_block.hash.short(),
                got = %witness_hash.short(),
                "witness block hash mismatch"
            );
            return BlockVerifyStatus::Invalid;
        }
        if self.executor.state_at(&witness_block.state_root).is_none() {
            error!(root = %witness_block.state_root.short(), "no state at witness root");
            return BlockVerifyStatus::Invalid;
        }

        let lock = self.chain_lock(block.position.chain_id);
        let _guard = lock.read();

        if block.position.height != 0 {
            // Only the next block on a chain can be verified.
            match self.speculative.last_confirmed_height(block.position.chain_id) {
                Some(h) if h == block.position.height - 1 => {}
                prev => {
                    debug!(
                        chain = block.position.chain_id,
                        height = block.position.height,
                        ?prev,
                        "previous confirmed block not exists"
                    );
                    return BlockVerifyStatus::RetryLater;
                }
            }
        }

        if self.payload_gated(block.position.round) {
            if !block.payload.is_empty() {
                error!(round = block.position.round, "non-empty payload during chain reshape");
                return BlockVerifyStatus::Invalid;
            }
            return BlockVerifyStatus::Ok;
        }

        let Some(root) = self.chain_root(block.position.chain_id) else {
            return BlockVerifyStatus::RetryLater;
        };
        let Some(state) = self.executor.state_at(&root) else {
            debug!(root = %root.short(), "invalid chain state root");
            return BlockVerifyStatus::Invalid;
        };

        if block.payload.is_empty() {
            return BlockVerifyStatus::Ok;
        }

        let txs = match codec::decode_transactions(&block.payload) {
            Ok(t) => t,
            Err(e) => {
                error!("payload decode: {e}");
                return BlockVerifyStatus::Invalid;
            }
        };

        let senders = match self.senders.recover_all(&txs) {
            Ok(s) => s,
            Err(e) => {
                error!("sender recovery: {e}");
                return BlockVerifyStatus::Invalid;
            }
        };

        let first_nonces = match validate_nonces(&txs, &senders) {
            Ok(m) => m,
            Err(e) => {
                error!("{e}");
                return BlockVerifyStatus::Invalid;
            }
        };

        let chain_id = block.position.chain_id;
        let num_chains = self.gov.num_chains(block.position.round);
        for (address, first_nonce) in &first_nonces {
            if address.be_mod(num_chains) != chain_id {
                error!(chain = chain_id, "address does not belong to this chain");
                return BlockVerifyStatus::Invalid;
            }

            let expect_nonce = match self.speculative.pending_nonce(chain_id, address) {
                Some(n) => n + 1,
                None => state.nonce(address),
            };
            if expect_nonce != *first_nonce {
                error!(expect = expect_nonce, first = *first_nonce, "nonce check error");
                return BlockVerifyStatus::Invalid;
            }
        }

        // Balances in the speculative view; `None` once an address has
        // overspent.
        let mut balances: HashMap<Address, Option<U256>> = first_nonces
            .keys()
            .map(|address| {
                let cost = self.speculative.pending_cost(chain_id, address);
                (*address, state.balance(address).checked_sub(cost))
            })
            .collect();

        let block_gas_limit = self.gov.block_gas_limit(block.position.round);
        let mut block_gas_used: u64 = 0;

        for (tx, sender) in txs.iter().zip(&senders) {
            if tx.gas < intrinsic_gas(tx) {
                error!(tx = %codec::tx_hash(tx).short(), gas = tx.gas, "intrinsic gas too low");
                return BlockVerifyStatus::Invalid;
            }

            let slot = balances.get_mut(sender).expect("sender seen during nonce validation");
            *slot = slot.and_then(|b| b.checked_sub(tx.cost()));
            if slot.is_none() {
                error!(tx = %codec::tx_hash(tx).short(), "insufficient funds for gas * price + value");
                return BlockVerifyStatus::Invalid;
            }

            block_gas_used = block_gas_used.saturating_add(tx.gas);
            if block_gas_used > block_gas_limit {
                error!(gas_used = block_gas_used, "block gas limit exceeded");
                return BlockVerifyStatus::Invalid;
            }
        }

        BlockVerifyStatus::Ok
    }

    fn publish_finalized(&self, event: FinalizedBlockEvent) {
        let mut subs = self.finalized_subs.lock();
        subs.retain(|sub| sub.send(event.clone()).is_ok());
    }
}

impl<E, P, G> ChainApp<E, P, G>
where
    E: Executor + 'static,
    P: TxPool + 'static,
    G: Governance + 'static,
{
    pub fn new(executor: E, pool: P, gov: G, cfg: BridgeConfig) -> Self {
        let senders = SenderCache::new(cfg.sender_cache_size);
        Self {
            inner: Arc::new(Inner {
                executor,
                pool,
                gov,
                cfg,
                chain_locks: Mutex::new(HashMap::new()),
                chain_roots: RwLock::new(HashMap::new()),
                speculative: SpeculativeLedger::new(),
                senders,
                delivered_round: AtomicU64::new(0),
                finalized_subs: Mutex::new(Vec::new()),
                metrics: Mutex::new(AppMetrics::default()),
            }),
        }
    }

    /// Seed the per-chain state root. Called once per chain at startup with
    /// the genesis (or recovered) root; deliveries keep it current after
    /// that.
    pub fn set_chain_root(&self, chain_id: ChainId, root: Hash32) {
        self.inner.chain_roots.write().insert(chain_id, root);
    }

    pub fn subscribe_finalized(&self) -> mpsc::Receiver<FinalizedBlockEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner.finalized_subs.lock().push(tx);
        rx
    }

    pub fn metrics(&self) -> AppMetrics {
        self.inner.metrics.lock().clone()
    }

    /// Build a payload for one chain slot. Two deadlines apply: an inner
    /// one after which the worker stops adding transactions, and an outer
    /// one after which the caller takes whatever is ready. Neither surfaces
    /// an error; a worker failure yields empty bytes.
    pub fn prepare_payload(&self, position: Position) -> Vec<u8> {
        let soft_deadline = Instant::now() + self.inner.cfg.soft_limit();
        let hard_limit = self.inner.cfg.hard_limit();

        let (done_tx, done_rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let result = inner.prepare_payload_inner(position, soft_deadline);
            let _ = done_tx.send(result);
        });

        match done_rx.recv_timeout(hard_limit) {
            Ok(Ok(payload)) => {
                let mut m = self.inner.metrics.lock();
                if payload.is_empty() {
                    m.payloads_empty += 1;
                } else {
                    m.payloads_prepared += 1;
                }
                payload
            }
            Ok(Err(err)) => {
                debug!(chain = position.chain_id, height = position.height, "prepare payload failed: {err}");
                self.inner.metrics.lock().payloads_empty += 1;
                Vec::new()
            }
            Err(_) => {
                debug!(chain = position.chain_id, height = position.height, "prepare payload deadline");
                self.inner.metrics.lock().payload_deadlines_missed += 1;
                Vec::new()
            }
        }
    }

    /// Witness for the current canonical head, which must have reached
    /// `consensus_height`.
    pub fn prepare_witness(&self, consensus_height: u64) -> Result<Witness, AppError> {
        let head = self.inner.executor.current();
        if head.number < consensus_height {
            error!(
                current = head.number,
                requested = consensus_height,
                "current height too low for witness"
            );
            return Err(AppError::HeightTooLow {
                current: head.number,
                requested: consensus_height,
            });
        }
        Ok(Witness { height: head.number, data: codec::encode_witness_data(&head.hash) })
    }

    pub fn verify_block(&self, block: &Block) -> BlockVerifyStatus {
        let status = self.inner.verify_block_inner(block);
        let mut m = self.inner.metrics.lock();
        match status {
            BlockVerifyStatus::Ok => m.verify_ok += 1,
            BlockVerifyStatus::RetryLater => m.verify_retry_later += 1,
            BlockVerifyStatus::Invalid => m.verify_invalid += 1,
        }
        status
    }

    /// Fold a consensus-accepted block into the speculative overlay. The
    /// block has already passed `verify_block`; rejection here is a bug.
    pub fn block_confirmed(&self, block: Block) {
        let lock = self.inner.chain_lock(block.position.chain_id);
        let _guard = lock.write();

        debug!(
            chain = block.position.chain_id,
            height = block.position.height,
            hash = %block.hash.short(),
            "block confirmed"
        );
        let chain_id = block.position.chain_id;
        if let Err(e) = self.inner.speculative.append(chain_id, block, &self.inner.senders) {
            panic!("confirmed block rejected by speculative ledger: {e}");
        }
        self.inner.metrics.lock().blocks_confirmed += 1;
    }

    /// Execute a finalized block on the canonical chain. Deliveries on one
    /// chain arrive in strictly increasing finalization height; failure to
    /// apply a delivered block is unrecoverable.
    pub fn block_delivered(
        &self,
        block_hash: Hash32,
        position: Position,
        result: FinalizationResult,
    ) {
        let chain_id = position.chain_id;
        let lock = self.inner.chain_lock(chain_id);
        let _guard = lock.write();

        debug!(
            chain = chain_id,
            finalized_height = result.height,
            hash = %block_hash.short(),
            "block deliver"
        );

        let Some((block, txs)) = self.inner.speculative.get(chain_id, &block_hash) else {
            panic!("delivered block {} not in confirmed set of chain {chain_id}", block_hash.short());
        };

        // Archive the lattice block alongside the canonical one, payload
        // cleared and finalization filled in.
        let mut meta_block = block.clone();
        meta_block.payload = Vec::new();
        meta_block.finalization = result.clone();
        let meta = rlp::encode(&meta_block).to_vec();

        let exec = ExecBlock {
            number: result.height,
            time_ms: result.timestamp.millis(),
            coinbase: block.proposer_id.address(),
            gas_limit: self.inner.gov.block_gas_limit(position.round),
            difficulty: 1,
            round: position.round,
            randomness: result.randomness.clone(),
            meta,
            transactions: txs,
        };

        let first_new = self.inner.executor.current().number + 1;
        let applied = if block.is_empty() {
            self.inner.executor.process_empty(exec)
        } else {
            self.inner.executor.process_block(exec, &block.witness)
        };
        let root = match applied {
            Ok(root) => root,
            Err(e) => {
                // Consensus says this block must apply; if we cannot, local
                // state is beyond repair.
                panic!("failed to process delivered block {}: {e}", block_hash.short());
            }
        };

        self.inner.chain_roots.write().insert(chain_id, root);
        self.inner.speculative.remove(chain_id, &block_hash);
        self.inner.delivered_round.fetch_max(position.round, AtomicOrdering::AcqRel);
        self.inner.metrics.lock().blocks_delivered += 1;

        // The executor may have applied more than one height in catch-up;
        // announce every newly canonical block.
        let new_head = self.inner.executor.current().number;
        for number in first_new..=new_head {
            if let Some(head) = self.inner.executor.get_by_number(number) {
                debug!(number, "new finalized block");
                self.inner.publish_finalized(FinalizedBlockEvent { number, hash: head.hash });
            }
        }
    }
}
