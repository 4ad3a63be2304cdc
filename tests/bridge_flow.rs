//! End-to-end bridge flows over mock ledger, pool and governance.

mod common;

use common::*;

use trellis::app::{AppError, ChainApp};
use trellis::codec;
use trellis::config::BridgeConfig;
use trellis::crypto::ed25519::Ed25519Keypair;
use trellis::crypto::sender::derive_address;
use trellis::crypto::Signer;
use trellis::governance::RoundConfig;
use trellis::types::{Address, BlockVerifyStatus, FinalizationResult, Position, Timestamp};

type App = ChainApp<MockLedger, MockPool, StaticGov>;

fn new_app(ledger: &MockLedger, pool: &MockPool, gov: StaticGov) -> App {
    let app = ChainApp::new(ledger.clone(), pool.clone(), gov, BridgeConfig::default());
    app.set_chain_root(0, ledger.genesis_root());
    app
}

/// Deterministic keypair whose address routes to `chain_id` out of
/// `num_chains`.
fn keypair_on_chain(num_chains: u32, chain_id: u32) -> Ed25519Keypair {
    for seed in 1u8..=255 {
        let kp = Ed25519Keypair::from_seed([seed; 32]);
        let addr = derive_address(&kp.public_key().0);
        if addr.be_mod(num_chains) == chain_id {
            return kp;
        }
    }
    unreachable!("no seed maps to chain {chain_id} of {num_chains}");
}

fn pos(round: u64, chain_id: u32, height: u64) -> Position {
    Position { round, chain_id, height }
}

#[test]
fn happy_path_payload() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 0));
    let pool = MockPool::default();
    let mut expect = Vec::new();
    for nonce in 0..5 {
        let tx = signed_tx(&kp, nonce, 21_000, 10, 1);
        pool.push(tx.clone());
        expect.push(tx);
    }
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let payload = app.prepare_payload(pos(0, 0, 0));
    let txs = codec::decode_transactions(&payload).unwrap();
    assert_eq!(txs, expect);
}

#[test]
fn insufficient_funds_stops_the_address() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    // Each tx costs 21_000 * 10 + 1 = 210_001; three fit, the fourth does not.
    let ledger = MockLedger::new(AccountState::default().with(addr, 700_000, 0));
    let pool = MockPool::default();
    for nonce in 0..5 {
        pool.push(signed_tx(&kp, nonce, 21_000, 10, 1));
    }
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let payload = app.prepare_payload(pos(0, 0, 0));
    let txs = codec::decode_transactions(&payload).unwrap();
    assert_eq!(txs.len(), 3);
    assert_eq!(txs.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[test]
fn payload_is_sharded_by_address_chain() {
    let kp0 = keypair_on_chain(2, 0);
    let kp1 = keypair_on_chain(2, 1);
    let a0 = derive_address(&kp0.public_key().0);
    let a1 = derive_address(&kp1.public_key().0);
    let ledger = MockLedger::new(
        AccountState::default().with(a0, 10_000_000, 0).with(a1, 10_000_000, 0),
    );
    let pool = MockPool::default();
    pool.push(signed_tx(&kp0, 0, 21_000, 1, 0));
    pool.push(signed_tx(&kp1, 0, 21_000, 1, 0));
    let app = new_app(&ledger, &pool, StaticGov::uniform(2, 10_000_000));
    app.set_chain_root(1, ledger.genesis_root());

    let on_chain_0 = codec::decode_transactions(&app.prepare_payload(pos(0, 0, 0))).unwrap();
    let on_chain_1 = codec::decode_transactions(&app.prepare_payload(pos(0, 1, 0))).unwrap();
    assert_eq!(on_chain_0.len(), 1);
    assert_eq!(on_chain_1.len(), 1);
    assert_eq!(derive_address(&on_chain_0[0].pubkey.0), a0);
    assert_eq!(derive_address(&on_chain_1[0].pubkey.0), a1);
}

#[test]
fn verify_accepts_own_payload() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 0));
    let pool = MockPool::default();
    for nonce in 0..3 {
        pool.push(signed_tx(&kp, nonce, 21_000, 1, 0));
    }
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let payload = app.prepare_payload(pos(0, 0, 0));
    assert!(!codec::decode_transactions(&payload).unwrap().is_empty());

    let witness = app.prepare_witness(0).unwrap();
    let block = payload_block(pos(0, 0, 0), payload, witness);
    assert_eq!(app.verify_block(&block), BlockVerifyStatus::Ok);
}

#[test]
fn verify_retry_later_on_height_gap() {
    let ledger = MockLedger::new(AccountState::default());
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let witness = app.prepare_witness(0).unwrap();
    app.block_confirmed(empty_block(pos(0, 0, 4), witness.clone()));

    let block = empty_block(pos(0, 0, 6), witness);
    assert_eq!(app.verify_block(&block), BlockVerifyStatus::RetryLater);
}

#[test]
fn verify_invalid_on_nonce_gap() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 5));
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let txs = vec![
        signed_tx(&kp, 5, 21_000, 1, 0),
        signed_tx(&kp, 6, 21_000, 1, 0),
        signed_tx(&kp, 8, 21_000, 1, 0),
    ];
    let witness = app.prepare_witness(0).unwrap();
    let block = payload_block(pos(0, 0, 0), codec::encode_transactions(&txs), witness);
    assert_eq!(app.verify_block(&block), BlockVerifyStatus::Invalid);
}

#[test]
fn verify_invalid_on_wrong_first_nonce() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 5));
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    // Contiguous run, but starting past the expected nonce 5.
    let txs = vec![signed_tx(&kp, 6, 21_000, 1, 0), signed_tx(&kp, 7, 21_000, 1, 0)];
    let witness = app.prepare_witness(0).unwrap();
    let block = payload_block(pos(0, 0, 0), codec::encode_transactions(&txs), witness);
    assert_eq!(app.verify_block(&block), BlockVerifyStatus::Invalid);
}

#[test]
fn verify_invalid_on_foreign_chain_sender() {
    let kp = keypair_on_chain(2, 1);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 0));
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(2, 10_000_000));
    app.set_chain_root(1, ledger.genesis_root());

    let txs = vec![signed_tx(&kp, 0, 21_000, 1, 0)];
    let payload = codec::encode_transactions(&txs);
    let witness = app.prepare_witness(0).unwrap();

    let wrong_chain = payload_block(pos(0, 0, 0), payload.clone(), witness.clone());
    assert_eq!(app.verify_block(&wrong_chain), BlockVerifyStatus::Invalid);

    let home_chain = payload_block(pos(0, 1, 0), payload, witness);
    assert_eq!(app.verify_block(&home_chain), BlockVerifyStatus::Ok);
}

#[test]
fn round_reshape_gates_payloads() {
    let kp = keypair_on_chain(4, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 0));
    let pool = MockPool::default();
    pool.push(signed_tx(&kp, 0, 21_000, 1, 0));
    // num_chains changes 4 -> 8 at round 1, and nothing of round 1 has been
    // delivered yet.
    let gov = StaticGov::uniform(4, 10_000_000)
        .with_round(1, RoundConfig { num_chains: 8, block_gas_limit: 10_000_000 });
    let app = new_app(&ledger, &pool, gov);

    let payload = app.prepare_payload(pos(1, 0, 0));
    assert!(payload.is_empty());

    let witness = app.prepare_witness(0).unwrap();
    let empty = empty_block(pos(1, 0, 0), witness.clone());
    assert_eq!(app.verify_block(&empty), BlockVerifyStatus::Ok);

    let nonempty = payload_block(pos(1, 0, 0), vec![1, 2, 3], witness);
    assert_eq!(app.verify_block(&nonempty), BlockVerifyStatus::Invalid);
}

#[test]
fn witness_pins_current_head() {
    let ledger = MockLedger::new(AccountState::default());
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let witness = app.prepare_witness(0).unwrap();
    assert_eq!(witness.height, ledger.head().number);
    let pinned = codec::decode_witness_data(&witness.data).unwrap();
    assert_eq!(pinned, ledger.head().hash);

    let too_high = app.prepare_witness(ledger.head().number + 1);
    assert!(matches!(too_high, Err(AppError::HeightTooLow { .. })));
}

#[test]
fn confirm_then_deliver_executes_and_notifies() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let ledger = MockLedger::new(AccountState::default().with(addr, 10_000_000, 0));
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));
    let finalized = app.subscribe_finalized();

    let txs = vec![signed_tx(&kp, 0, 21_000, 1, 5), signed_tx(&kp, 1, 21_000, 1, 5)];
    let witness = app.prepare_witness(0).unwrap();
    let block = payload_block(pos(0, 0, 0), codec::encode_transactions(&txs), witness);
    assert_eq!(app.verify_block(&block), BlockVerifyStatus::Ok);

    app.block_confirmed(block.clone());

    let result = FinalizationResult {
        parent_hash: ledger.head().hash,
        randomness: vec![7; 8],
        timestamp: Timestamp::from_nanos(1_700_000_000_000_000_000),
        height: 1,
    };
    app.block_delivered(block.hash, block.position, result);

    assert_eq!(ledger.head().number, 1);
    assert_eq!(ledger.process_block_calls(), 1);
    let spent = primitive_types::U256::from(2u64 * (21_000 + 5));
    assert_eq!(ledger.balance_at_head(&addr), primitive_types::U256::from(10_000_000u64) - spent);

    let event = finalized.try_recv().unwrap();
    assert_eq!(event.number, 1);
    assert_eq!(event.hash, ledger.head().hash);

    let metrics = app.metrics();
    assert_eq!(metrics.blocks_confirmed, 1);
    assert_eq!(metrics.blocks_delivered, 1);
}

#[test]
fn empty_block_goes_through_process_empty() {
    let ledger = MockLedger::new(AccountState::default());
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let witness = app.prepare_witness(0).unwrap();
    let block = empty_block(pos(0, 0, 0), witness);
    app.block_confirmed(block.clone());

    let result = FinalizationResult {
        parent_hash: ledger.head().hash,
        randomness: Vec::new(),
        timestamp: Timestamp::from_nanos(1_700_000_000_000_000_000),
        height: 1,
    };
    app.block_delivered(block.hash, block.position, result);

    assert_eq!(ledger.head().number, 1);
    assert_eq!(ledger.process_empty_calls(), 1);
    assert_eq!(ledger.process_block_calls(), 0);
}

#[test]
fn payload_respects_confirmed_overlay() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    // Funds for exactly three transactions of cost 21_000 each.
    let ledger = MockLedger::new(AccountState::default().with(addr, 63_000, 0));
    let pool = MockPool::default();
    let mut txs = Vec::new();
    for nonce in 0..4 {
        let tx = signed_tx(&kp, nonce, 21_000, 1, 0);
        pool.push(tx.clone());
        txs.push(tx);
    }
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    // Confirm a block holding nonces 0 and 1; the overlay now expects
    // nonce 2 next and two thirds of the balance are spoken for.
    let witness = app.prepare_witness(0).unwrap();
    let first = payload_block(pos(0, 0, 0), codec::encode_transactions(&txs[..2]), witness);
    app.block_confirmed(first);

    let second = codec::decode_transactions(&app.prepare_payload(pos(0, 0, 1))).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].nonce, 2);
}

#[test]
#[should_panic(expected = "not in confirmed set")]
fn delivering_unknown_block_is_fatal() {
    let ledger = MockLedger::new(AccountState::default());
    let pool = MockPool::default();
    let app = new_app(&ledger, &pool, StaticGov::uniform(1, 10_000_000));

    let result = FinalizationResult {
        timestamp: Timestamp::from_nanos(1),
        height: 1,
        ..Default::default()
    };
    app.block_delivered(trellis::types::Hash32([9; 32]), pos(0, 0, 0), result);
}

#[test]
fn payload_for_untouched_chain_is_empty() {
    let ledger = MockLedger::new(AccountState::default());
    let pool = MockPool::default();
    let app: App =
        ChainApp::new(ledger.clone(), pool.clone(), StaticGov::uniform(1, 10_000_000), BridgeConfig::default());
    // No chain root seeded: the worker has no state to propose from.
    let payload = app.prepare_payload(pos(0, 0, 0));
    assert!(payload.is_empty());
}

#[test]
fn pool_state_nonce_reports_queue_start() {
    let kp = keypair_on_chain(1, 0);
    let addr = derive_address(&kp.public_key().0);
    let pool = MockPool::default();
    pool.push(signed_tx(&kp, 4, 21_000, 1, 0));
    pool.push(signed_tx(&kp, 3, 21_000, 1, 0));
    use trellis::app::TxPool;
    assert_eq!(pool.state_nonce(&addr), 3);
    assert_eq!(pool.state_nonce(&Address([9; 20])), 0);
}
