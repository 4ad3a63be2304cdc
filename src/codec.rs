//! Deterministic RLP encoding of the lattice wire types.
//!
//! Every field is byte-exact with any peer: blocks, witnesses and
//! finalization results round-trip through `rlp::encode`/`rlp::decode`
//! unchanged. Timestamps travel as a single u64 of nanoseconds since the
//! UTC epoch.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use sha3::{Digest, Keccak256};

use crate::crypto::{PublicKeyBytes, SignatureBytes};
use crate::types::tx::Transaction;
use crate::types::{Address, Block, FinalizationResult, Hash32, NodeId, Position, Timestamp, Witness};

const TX_SIGN_DOMAIN: &str = "trellis-tx-v1";

pub fn keccak(bytes: &[u8]) -> Hash32 {
    let mut h = Keccak256::new();
    h.update(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize());
    Hash32(out)
}

impl Encodable for Hash32 {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for Hash32 {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != 32 {
                return Err(DecoderError::RlpInvalidLength);
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(bytes);
            Ok(Hash32(out))
        })
    }
}

impl Encodable for Address {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for Address {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.len() != 20 {
                return Err(DecoderError::RlpInvalidLength);
            }
            let mut out = [0u8; 20];
            out.copy_from_slice(bytes);
            Ok(Address(out))
        })
    }
}

impl Encodable for NodeId {
    fn rlp_append(&self, s: &mut RlpStream) {
        self.0.rlp_append(s);
    }
}

impl Decodable for NodeId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(NodeId(Hash32::decode(rlp)?))
    }
}

impl Encodable for PublicKeyBytes {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for PublicKeyBytes {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(PublicKeyBytes(bytes.to_vec())))
    }
}

impl Encodable for SignatureBytes {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for SignatureBytes {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(SignatureBytes(bytes.to_vec())))
    }
}

impl Encodable for Timestamp {
    fn rlp_append(&self, s: &mut RlpStream) {
        self.nanos().rlp_append(s);
    }
}

impl Decodable for Timestamp {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Timestamp::from_nanos(rlp.as_val()?))
    }
}

impl Encodable for Position {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.round);
        s.append(&self.chain_id);
        s.append(&self.height);
    }
}

impl Decodable for Position {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Position {
            round: rlp.val_at(0)?,
            chain_id: rlp.val_at(1)?,
            height: rlp.val_at(2)?,
        })
    }
}

impl Encodable for Witness {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.height);
        s.append(&self.data);
    }
}

impl Decodable for Witness {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Witness { height: rlp.val_at(0)?, data: rlp.val_at(1)? })
    }
}

impl Encodable for FinalizationResult {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.parent_hash);
        s.append(&self.randomness);
        s.append(&self.timestamp);
        s.append(&self.height);
    }
}

impl Decodable for FinalizationResult {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(FinalizationResult {
            parent_hash: rlp.val_at(0)?,
            randomness: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            height: rlp.val_at(3)?,
        })
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(12);
        s.append(&self.proposer_id);
        s.append(&self.parent_hash);
        s.append(&self.hash);
        s.append(&self.position);
        s.append(&self.timestamp);
        s.append_list(&self.acks);
        s.append(&self.payload);
        s.append(&self.payload_hash);
        s.append(&self.witness);
        s.append(&self.finalization);
        s.append(&self.signature);
        s.append(&self.crs_signature);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 12 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Block {
            proposer_id: rlp.val_at(0)?,
            parent_hash: rlp.val_at(1)?,
            hash: rlp.val_at(2)?,
            position: rlp.val_at(3)?,
            timestamp: rlp.val_at(4)?,
            acks: rlp.list_at(5)?,
            payload: rlp.val_at(6)?,
            payload_hash: rlp.val_at(7)?,
            witness: rlp.val_at(8)?,
            finalization: rlp.val_at(9)?,
            signature: rlp.val_at(10)?,
            crs_signature: rlp.val_at(11)?,
        })
    }
}

impl Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        match &self.to {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.data);
        s.append(&self.pubkey);
        s.append(&self.signature);
    }
}

impl Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 8 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let to_raw = rlp.at(3)?;
        let to = if to_raw.data()?.is_empty() { None } else { Some(to_raw.as_val()?) };
        Ok(Transaction {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            data: rlp.val_at(5)?,
            pubkey: rlp.val_at(6)?,
            signature: rlp.val_at(7)?,
        })
    }
}

/// Transaction hash over the full encoding, signature included.
pub fn tx_hash(tx: &Transaction) -> Hash32 {
    keccak(&rlp::encode(tx))
}

/// Bytes the sender signs: every field but the signature, behind a domain
/// tag so a transaction signature can never be confused with any other
/// message kind.
pub fn tx_sign_bytes(tx: &Transaction) -> Vec<u8> {
    let mut s = RlpStream::new_list(8);
    s.append(&TX_SIGN_DOMAIN);
    s.append(&tx.nonce);
    s.append(&tx.gas_price);
    s.append(&tx.gas);
    match &tx.to {
        Some(addr) => s.append(addr),
        None => s.append_empty_data(),
    };
    s.append(&tx.value);
    s.append(&tx.data);
    s.append(&tx.pubkey);
    s.out().to_vec()
}

pub fn payload_hash(payload: &[u8]) -> Hash32 {
    keccak(payload)
}

/// Block hash: a function of block content. The hash slot itself, the
/// finalization result (assigned after the fact) and the signatures (which
/// cover the hash) are excluded.
pub fn block_hash(block: &Block) -> Hash32 {
    let mut s = RlpStream::new_list(7);
    s.append(&block.proposer_id);
    s.append(&block.parent_hash);
    s.append(&block.position);
    s.append(&block.timestamp);
    s.append_list(&block.acks);
    s.append(&block.payload_hash);
    s.append(&block.witness);
    keccak(&s.out())
}

/// Canonical payload encoding: an RLP list of transactions.
pub fn encode_transactions(txs: &[Transaction]) -> Vec<u8> {
    let mut s = RlpStream::new_list(txs.len());
    for tx in txs {
        s.append(tx);
    }
    s.out().to_vec()
}

pub fn decode_transactions(bytes: &[u8]) -> Result<Vec<Transaction>, DecoderError> {
    Rlp::new(bytes).as_list()
}

/// Witness data is the RLP of the committed block hash the proposer saw.
pub fn encode_witness_data(hash: &Hash32) -> Vec<u8> {
    rlp::encode(hash).to_vec()
}

pub fn decode_witness_data(bytes: &[u8]) -> Result<Hash32, DecoderError> {
    rlp::decode(bytes)
}
