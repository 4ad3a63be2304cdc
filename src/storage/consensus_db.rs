//! Typed schema over the raw KV: lattice blocks by hash, the compaction
//! chain tip, and per-round DKG key material.
//!
//! Key layout (a short ASCII prefix, then the binary-packed key):
//!   - `b-` || hash(32)                          -> RLP(Block)
//!   - `cc-tip`                                  -> RLP((height, hash))
//!   - `dkg-prvs` || LE_u64(round)               -> RLP(DkgPrivateKey)
//!   - `dkg-master-private-shares` || LE_u64(round) -> RLP(DkgPrivateKeyShares)

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Kv;
use crate::types::{Block, Hash32, Height, Round};

const BLOCK_KEY_PREFIX: &[u8] = b"b-";
const COMPACTION_CHAIN_TIP_KEY: &[u8] = b"cc-tip";
const DKG_PRIVATE_KEY_PREFIX: &[u8] = b"dkg-prvs";
const DKG_MASTER_PRIVATE_SHARES_PREFIX: &[u8] = b"dkg-master-private-shares";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block exists")]
    BlockExists,
    #[error("block does not exist")]
    BlockDoesNotExist,
    #[error("invalid compaction chain tip height")]
    InvalidCompactionChainTipHeight,
    #[error("DKG private key exists")]
    DkgPrivateKeyExists,
    #[error("DKG private key does not exist")]
    DkgPrivateKeyDoesNotExist,
    #[error("DKG master private shares do not exist")]
    DkgMasterPrivateSharesDoesNotExist,
    #[error("not implemented")]
    NotImplemented,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] DecoderError),
}

/// DKG private key for one round. Opaque to the store; the consensus core
/// owns the real structure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgPrivateKey(pub Vec<u8>);

/// Master private shares for one round. Opaque, replaceable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgPrivateKeyShares(pub Vec<u8>);

impl Encodable for DkgPrivateKey {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for DkgPrivateKey {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(DkgPrivateKey(bytes.to_vec())))
    }
}

impl Encodable for DkgPrivateKeyShares {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for DkgPrivateKeyShares {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(DkgPrivateKeyShares(bytes.to_vec())))
    }
}

struct TipInfo {
    height: Height,
    hash: Hash32,
}

impl Encodable for TipInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.height);
        s.append(&self.hash);
    }
}

impl Decodable for TipInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(TipInfo { height: rlp.val_at(0)?, hash: rlp.val_at(1)? })
    }
}

fn block_key(hash: &Hash32) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_KEY_PREFIX.len() + 32);
    key.extend_from_slice(BLOCK_KEY_PREFIX);
    key.extend_from_slice(&hash.0);
    key
}

fn dkg_private_key_key(round: Round) -> Vec<u8> {
    let mut key = Vec::with_capacity(DKG_PRIVATE_KEY_PREFIX.len() + 8);
    key.extend_from_slice(DKG_PRIVATE_KEY_PREFIX);
    key.extend_from_slice(&round.to_le_bytes());
    key
}

fn dkg_master_private_shares_key(round: Round) -> Vec<u8> {
    let mut key = Vec::with_capacity(DKG_MASTER_PRIVATE_SHARES_PREFIX.len() + 8);
    key.extend_from_slice(DKG_MASTER_PRIVATE_SHARES_PREFIX);
    key.extend_from_slice(&round.to_le_bytes());
    key
}

/// Compaction-chain database over any [`Kv`] backend.
pub struct ConsensusDb<K: Kv> {
    kv: K,
}

impl<K: Kv> ConsensusDb<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn has_block(&self, hash: &Hash32) -> bool {
        self.kv.has(&block_key(hash))
    }

    pub fn get_block(&self, hash: &Hash32) -> Result<Block, StoreError> {
        let bytes = self.kv.get(&block_key(hash)).ok_or(StoreError::BlockDoesNotExist)?;
        Ok(rlp::decode(&bytes)?)
    }

    pub fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        let key = block_key(&block.hash);
        if self.kv.has(&key) {
            return Err(StoreError::BlockExists);
        }
        self.kv.put(&key, &rlp::encode(block))?;
        Ok(())
    }

    /// Overwrite an existing block record. The hash is a pure function of
    /// the block content, so the key never moves.
    pub fn update_block(&self, block: &Block) -> Result<(), StoreError> {
        let key = block_key(&block.hash);
        if !self.kv.has(&key) {
            return Err(StoreError::BlockDoesNotExist);
        }
        self.kv.put(&key, &rlp::encode(block))?;
        Ok(())
    }

    /// Whole-store block iteration is not part of steady-state operation.
    pub fn all_blocks(&self) -> Result<Vec<Block>, StoreError> {
        Err(StoreError::NotImplemented)
    }

    fn read_tip(&self) -> Option<TipInfo> {
        let bytes = self.kv.get(COMPACTION_CHAIN_TIP_KEY)?;
        match rlp::decode(&bytes) {
            Ok(tip) => Some(tip),
            // A corrupt tip record means the store can no longer be trusted.
            Err(e) => panic!("corrupt compaction chain tip record: {e}"),
        }
    }

    /// Current tip of the compaction chain; `(zero, 0)` when unset.
    pub fn get_compaction_chain_tip_info(&self) -> (Hash32, Height) {
        match self.read_tip() {
            Some(tip) => (tip.hash, tip.height),
            None => (Hash32::zero(), 0),
        }
    }

    /// Advance the tip. The new height must be exactly one above the
    /// current tip (a missing tip counts as height 0).
    pub fn put_compaction_chain_tip_info(
        &self,
        hash: Hash32,
        height: Height,
    ) -> Result<(), StoreError> {
        let current = self.read_tip().map(|t| t.height).unwrap_or(0);
        if current + 1 != height {
            return Err(StoreError::InvalidCompactionChainTipHeight);
        }
        let tip = TipInfo { height, hash };
        self.kv.put(COMPACTION_CHAIN_TIP_KEY, &rlp::encode(&tip))?;
        Ok(())
    }

    pub fn has_dkg_private_key(&self, round: Round) -> bool {
        self.kv.has(&dkg_private_key_key(round))
    }

    pub fn get_dkg_private_key(&self, round: Round) -> Result<DkgPrivateKey, StoreError> {
        let bytes = self
            .kv
            .get(&dkg_private_key_key(round))
            .ok_or(StoreError::DkgPrivateKeyDoesNotExist)?;
        Ok(rlp::decode(&bytes)?)
    }

    /// Write-once per round: a second key for the same round is rejected.
    pub fn put_dkg_private_key(&self, round: Round, key: &DkgPrivateKey) -> Result<(), StoreError> {
        let db_key = dkg_private_key_key(round);
        if self.kv.has(&db_key) {
            return Err(StoreError::DkgPrivateKeyExists);
        }
        self.kv.put(&db_key, &rlp::encode(key))?;
        Ok(())
    }

    pub fn has_dkg_master_private_shares(&self, round: Round) -> bool {
        self.kv.has(&dkg_master_private_shares_key(round))
    }

    pub fn get_dkg_master_private_shares(
        &self,
        round: Round,
    ) -> Result<DkgPrivateKeyShares, StoreError> {
        let bytes = self
            .kv
            .get(&dkg_master_private_shares_key(round))
            .ok_or(StoreError::DkgMasterPrivateSharesDoesNotExist)?;
        Ok(rlp::decode(&bytes)?)
    }

    /// Create-or-replace, unlike the private key: shares are regenerated
    /// whenever the local DKG protocol restarts.
    pub fn put_or_update_dkg_master_private_shares(
        &self,
        round: Round,
        shares: &DkgPrivateKeyShares,
    ) -> Result<(), StoreError> {
        self.kv
            .put(&dkg_master_private_shares_key(round), &rlp::encode(shares))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsKv, MemKv};
    use crate::types::Position;

    fn db() -> ConsensusDb<MemKv> {
        ConsensusDb::new(MemKv::new())
    }

    fn block_with_hash(byte: u8) -> Block {
        Block {
            hash: Hash32([byte; 32]),
            position: Position { round: 1, chain_id: 0, height: byte as u64 },
            ..Default::default()
        }
    }

    #[test]
    fn put_get_update_block() {
        let db = db();
        let mut b = block_with_hash(1);
        assert!(!db.has_block(&b.hash));
        assert!(matches!(db.get_block(&b.hash), Err(StoreError::BlockDoesNotExist)));

        db.put_block(&b).unwrap();
        assert!(db.has_block(&b.hash));
        assert!(matches!(db.put_block(&b), Err(StoreError::BlockExists)));
        assert_eq!(db.get_block(&b.hash).unwrap(), b);

        b.payload = vec![1, 2, 3];
        db.update_block(&b).unwrap();
        assert_eq!(db.get_block(&b.hash).unwrap().payload, vec![1, 2, 3]);

        let unknown = block_with_hash(9);
        assert!(matches!(db.update_block(&unknown), Err(StoreError::BlockDoesNotExist)));
    }

    #[test]
    fn tip_height_must_advance_by_one() {
        let db = db();
        assert_eq!(db.get_compaction_chain_tip_info(), (Hash32::zero(), 0));

        // First write must be height 1.
        assert!(matches!(
            db.put_compaction_chain_tip_info(Hash32([1; 32]), 2),
            Err(StoreError::InvalidCompactionChainTipHeight)
        ));
        db.put_compaction_chain_tip_info(Hash32([1; 32]), 1).unwrap();
        assert_eq!(db.get_compaction_chain_tip_info(), (Hash32([1; 32]), 1));

        // Skipping a height is rejected, the successor is accepted.
        assert!(matches!(
            db.put_compaction_chain_tip_info(Hash32([3; 32]), 3),
            Err(StoreError::InvalidCompactionChainTipHeight)
        ));
        db.put_compaction_chain_tip_info(Hash32([2; 32]), 2).unwrap();
        assert_eq!(db.get_compaction_chain_tip_info(), (Hash32([2; 32]), 2));
    }

    #[test]
    fn dkg_private_key_is_write_once() {
        let db = db();
        assert!(!db.has_dkg_private_key(5));
        assert!(matches!(db.get_dkg_private_key(5), Err(StoreError::DkgPrivateKeyDoesNotExist)));

        db.put_dkg_private_key(5, &DkgPrivateKey(vec![1, 2])).unwrap();
        assert!(db.has_dkg_private_key(5));
        assert!(matches!(
            db.put_dkg_private_key(5, &DkgPrivateKey(vec![3, 4])),
            Err(StoreError::DkgPrivateKeyExists)
        ));
        assert_eq!(db.get_dkg_private_key(5).unwrap(), DkgPrivateKey(vec![1, 2]));

        // A different round is independent.
        db.put_dkg_private_key(6, &DkgPrivateKey(vec![9])).unwrap();
    }

    #[test]
    fn dkg_master_shares_accept_overwrite() {
        let db = db();
        assert!(matches!(
            db.get_dkg_master_private_shares(2),
            Err(StoreError::DkgMasterPrivateSharesDoesNotExist)
        ));
        db.put_or_update_dkg_master_private_shares(2, &DkgPrivateKeyShares(vec![1]))
            .unwrap();
        db.put_or_update_dkg_master_private_shares(2, &DkgPrivateKeyShares(vec![2]))
            .unwrap();
        assert_eq!(
            db.get_dkg_master_private_shares(2).unwrap(),
            DkgPrivateKeyShares(vec![2])
        );
    }

    #[test]
    fn iteration_is_not_implemented() {
        assert!(matches!(db().all_blocks(), Err(StoreError::NotImplemented)));
    }

    #[test]
    fn fs_backed_db_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let b = block_with_hash(7);
        {
            let db = ConsensusDb::new(FsKv::open(dir.path()).unwrap());
            db.put_block(&b).unwrap();
            db.put_compaction_chain_tip_info(b.hash, 1).unwrap();
        }
        let db = ConsensusDb::new(FsKv::open(dir.path()).unwrap());
        assert_eq!(db.get_block(&b.hash).unwrap(), b);
        assert_eq!(db.get_compaction_chain_tip_info(), (b.hash, 1));
    }
}
