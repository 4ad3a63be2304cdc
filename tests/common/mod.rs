//! Shared mocks for bridge integration tests: an account-model ledger, a
//! nonce-ordered transaction pool and a static governance oracle.

#![allow(dead_code)]

use parking_lot::Mutex;
use primitive_types::U256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use trellis::app::{ChainHead, ExecBlock, ExecutionError, Executor, StateView, TxPool};
use trellis::codec;
use trellis::crypto::ed25519::Ed25519Keypair;
use trellis::crypto::sender::derive_address;
use trellis::crypto::PublicKeyBytes;
use trellis::governance::{Governance, GovernanceError, RoundConfig};
use trellis::types::tx::Transaction;
use trellis::types::{Address, Block, ChainId, Hash32, NodeId, Position, Round, Witness};

#[derive(Clone, Debug, Default)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
}

#[derive(Clone, Debug, Default)]
pub struct AccountState {
    pub accounts: HashMap<Address, Account>,
}

impl AccountState {
    pub fn with(mut self, addr: Address, balance: u64, nonce: u64) -> Self {
        self.accounts.insert(addr, Account { balance: U256::from(balance), nonce });
        self
    }
}

impl StateView for AccountState {
    fn balance(&self, addr: &Address) -> U256 {
        self.accounts.get(addr).map(|a| a.balance).unwrap_or_default()
    }

    fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or_default()
    }
}

struct LedgerInner {
    states: HashMap<Hash32, AccountState>,
    canon: Vec<ChainHead>,
    process_block_calls: u64,
    process_empty_calls: u64,
}

/// Minimal canonical-chain mock: states are keyed by root, every processed
/// block debits `cost` from each sender and advances its nonce.
#[derive(Clone)]
pub struct MockLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl MockLedger {
    pub fn new(genesis: AccountState) -> Self {
        let state_root = codec::keccak(b"genesis-state");
        let head = ChainHead { number: 0, hash: codec::keccak(b"genesis-block"), state_root };
        let mut states = HashMap::new();
        states.insert(state_root, genesis);
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                states,
                canon: vec![head],
                process_block_calls: 0,
                process_empty_calls: 0,
            })),
        }
    }

    pub fn genesis_root(&self) -> Hash32 {
        self.inner.lock().canon[0].state_root
    }

    pub fn head(&self) -> ChainHead {
        *self.inner.lock().canon.last().expect("genesis always present")
    }

    pub fn balance_at_head(&self, addr: &Address) -> U256 {
        let inner = self.inner.lock();
        let head = inner.canon.last().expect("genesis always present");
        inner.states[&head.state_root].balance(addr)
    }

    pub fn process_block_calls(&self) -> u64 {
        self.inner.lock().process_block_calls
    }

    pub fn process_empty_calls(&self) -> u64 {
        self.inner.lock().process_empty_calls
    }

    fn advance(
        &self,
        inner: &mut LedgerInner,
        block: &ExecBlock,
        apply_txs: bool,
    ) -> Result<Hash32, ExecutionError> {
        let head = *inner.canon.last().expect("genesis always present");
        if block.number != head.number + 1 {
            return Err(ExecutionError(format!(
                "non-sequential block number {} on head {}",
                block.number, head.number
            )));
        }
        let mut state = inner
            .states
            .get(&head.state_root)
            .cloned()
            .ok_or_else(|| ExecutionError("missing head state".into()))?;

        if apply_txs {
            for tx in &block.transactions {
                let sender = derive_address(&tx.pubkey.0);
                let account = state.accounts.entry(sender).or_default();
                account.balance = account
                    .balance
                    .checked_sub(tx.cost())
                    .ok_or_else(|| ExecutionError("overspend".into()))?;
                account.nonce = tx.nonce + 1;
            }
        }

        let mut seed = head.state_root.0.to_vec();
        seed.extend_from_slice(&block.number.to_le_bytes());
        let state_root = codec::keccak(&seed);
        seed.push(0xbb);
        let hash = codec::keccak(&seed);

        inner.states.insert(state_root, state);
        inner.canon.push(ChainHead { number: block.number, hash, state_root });
        Ok(state_root)
    }
}

impl Executor for MockLedger {
    type View = AccountState;

    fn current(&self) -> ChainHead {
        self.head()
    }

    fn get_by_number(&self, number: u64) -> Option<ChainHead> {
        self.inner.lock().canon.get(number as usize).copied()
    }

    fn state_at(&self, root: &Hash32) -> Option<AccountState> {
        self.inner.lock().states.get(root).cloned()
    }

    fn process_block(&self, block: ExecBlock, _witness: &Witness) -> Result<Hash32, ExecutionError> {
        let mut inner = self.inner.lock();
        inner.process_block_calls += 1;
        self.advance(&mut inner, &block, true)
    }

    fn process_empty(&self, block: ExecBlock) -> Result<Hash32, ExecutionError> {
        let mut inner = self.inner.lock();
        inner.process_empty_calls += 1;
        self.advance(&mut inner, &block, false)
    }
}

#[derive(Clone, Default)]
pub struct MockPool {
    queues: Arc<Mutex<BTreeMap<Address, Vec<Transaction>>>>,
}

impl MockPool {
    pub fn push(&self, tx: Transaction) {
        let sender = derive_address(&tx.pubkey.0);
        let mut queues = self.queues.lock();
        let queue = queues.entry(sender).or_default();
        queue.push(tx);
        queue.sort_by_key(|t| t.nonce);
    }
}

impl TxPool for MockPool {
    fn pending(&self) -> BTreeMap<Address, Vec<Transaction>> {
        self.queues.lock().clone()
    }

    fn state_nonce(&self, addr: &Address) -> u64 {
        self.queues
            .lock()
            .get(addr)
            .and_then(|q| q.first())
            .map(|t| t.nonce)
            .unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct StaticGov {
    configs: Arc<HashMap<Round, RoundConfig>>,
    fallback: RoundConfig,
}

impl StaticGov {
    pub fn uniform(num_chains: u32, block_gas_limit: u64) -> Self {
        Self {
            configs: Arc::new(HashMap::new()),
            fallback: RoundConfig { num_chains, block_gas_limit },
        }
    }

    pub fn with_round(mut self, round: Round, cfg: RoundConfig) -> Self {
        Arc::make_mut(&mut self.configs).insert(round, cfg);
        self
    }
}

impl Governance for StaticGov {
    fn configuration(&self, round: Round) -> RoundConfig {
        self.configs.get(&round).cloned().unwrap_or_else(|| self.fallback.clone())
    }

    fn notary_set(
        &self,
        _round: Round,
        _chain_id: ChainId,
    ) -> Result<BTreeSet<PublicKeyBytes>, GovernanceError> {
        Ok(BTreeSet::new())
    }

    fn dkg_set(&self, _round: Round) -> Result<BTreeSet<PublicKeyBytes>, GovernanceError> {
        Ok(BTreeSet::new())
    }
}

pub fn signed_tx(kp: &Ed25519Keypair, nonce: u64, gas: u64, gas_price: u64, value: u64) -> Transaction {
    let mut tx = Transaction {
        nonce,
        gas,
        gas_price: U256::from(gas_price),
        value: U256::from(value),
        to: Some(Address([0xee; 20])),
        ..Default::default()
    };
    tx.sign_with(kp);
    tx
}

/// A lattice block carrying `payload` at `position`, pinned by `witness`,
/// with a non-zero proposer and a content-derived hash.
pub fn payload_block(position: Position, payload: Vec<u8>, witness: Witness) -> Block {
    let mut block = Block {
        proposer_id: NodeId(Hash32([0x11; 32])),
        parent_hash: Hash32([0x22; 32]),
        position,
        payload_hash: codec::payload_hash(&payload),
        payload,
        witness,
        ..Default::default()
    };
    block.hash = codec::block_hash(&block);
    block
}

/// An empty consensus placeholder block (zero proposer, no payload).
pub fn empty_block(position: Position, witness: Witness) -> Block {
    let mut block = Block { position, witness, ..Default::default() };
    block.parent_hash = Hash32([0x22; 32]);
    block.hash = codec::block_hash(&block);
    block
}
