//! Sender recovery for payload transactions.
//!
//! A transaction carries the sender's public key; "recovering" the sender
//! means verifying the signature and deriving the 20-byte address from the
//! key. Verified results are memoised by transaction hash so that a block
//! seen at verify time is free again at confirm time.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use super::ed25519::Ed25519Verifier;
use super::{CryptoError, Verifier};
use crate::types::tx::Transaction;
use crate::types::{Address, Hash32};

pub fn derive_address(pubkey: &[u8]) -> Address {
    let h = blake3::hash(pubkey);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h.as_bytes()[..20]);
    Address(out)
}

pub struct SenderCache {
    cache: Mutex<LruCache<Hash32, Address>>,
}

impl SenderCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { cache: Mutex::new(LruCache::new(cap)) }
    }

    /// Verify the transaction signature and return the sender address.
    pub fn recover(&self, tx: &Transaction) -> Result<Address, CryptoError> {
        let txh = crate::codec::tx_hash(tx);
        if let Some(addr) = self.cache.lock().get(&txh) {
            return Ok(*addr);
        }

        Ed25519Verifier::verify(&tx.pubkey, &tx.sign_bytes(), &tx.signature)?;
        let addr = derive_address(&tx.pubkey.0);

        self.cache.lock().put(txh, addr);
        Ok(addr)
    }

    /// Recover every sender in payload order; fails on the first bad
    /// signature.
    pub fn recover_all(&self, txs: &[Transaction]) -> Result<Vec<Address>, CryptoError> {
        txs.iter().map(|tx| self.recover(tx)).collect()
    }
}
