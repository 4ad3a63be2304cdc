//! Signed account-model transactions as carried in block payloads.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKeyBytes, SignatureBytes, Signer};
use crate::types::Address;

/// Gas floor for any transaction.
pub const TX_GAS: u64 = 21_000;
/// Gas floor for a contract-creating transaction.
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;
/// Per-byte cost of non-zero payload data.
pub const TX_DATA_NON_ZERO_GAS: u64 = 68;
/// Per-byte cost of zero payload data.
pub const TX_DATA_ZERO_GAS: u64 = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    /// Sender's ed25519 public key; the sender address is derived from it.
    pub pubkey: PublicKeyBytes,
    pub signature: SignatureBytes,
}

impl Transaction {
    /// Total funds this transaction speaks for: `gas * gas_price + value`.
    pub fn cost(&self) -> U256 {
        U256::from(self.gas)
            .saturating_mul(self.gas_price)
            .saturating_add(self.value)
    }

    /// Bytes covered by the sender's signature (everything but the
    /// signature itself, behind a domain tag).
    pub fn sign_bytes(&self) -> Vec<u8> {
        crate::codec::tx_sign_bytes(self)
    }

    pub fn sign_with(&mut self, signer: &impl Signer) {
        self.pubkey = signer.public_key();
        self.signature = signer.sign(&self.sign_bytes());
    }
}

/// Inclusion gas floor irrespective of execution: base cost plus per-byte
/// data cost, with the higher base for contract creation.
pub fn intrinsic_gas(tx: &Transaction) -> u64 {
    let base = if tx.to.is_none() { TX_GAS_CONTRACT_CREATION } else { TX_GAS };
    let mut gas = base;
    for b in &tx.data {
        let per_byte = if *b == 0 { TX_DATA_ZERO_GAS } else { TX_DATA_NON_ZERO_GAS };
        gas = gas.saturating_add(per_byte);
    }
    gas
}
