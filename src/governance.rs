//! Read-only governance port.
//!
//! Round parameters and node sets come from the governance contract on the
//! canonical chain; this crate only consumes them. Lookups for a round the
//! contract has not settled yet are reported as errors and the caller
//! decides whether to retry or skip.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::crypto::PublicKeyBytes;
use crate::types::{ChainId, Round};

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("round {0} not ready")]
    RoundNotReady(Round),
    #[error("unknown chain {chain_id} in round {round}")]
    UnknownChain { round: Round, chain_id: ChainId },
}

/// Per-round chain parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundConfig {
    pub num_chains: u32,
    pub block_gas_limit: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self { num_chains: 1, block_gas_limit: 40_000_000 }
    }
}

pub trait Governance: Send + Sync {
    fn configuration(&self, round: Round) -> RoundConfig;

    fn num_chains(&self, round: Round) -> u32 {
        self.configuration(round).num_chains
    }

    fn block_gas_limit(&self, round: Round) -> u64 {
        self.configuration(round).block_gas_limit
    }

    fn notary_set(
        &self,
        round: Round,
        chain_id: ChainId,
    ) -> Result<BTreeSet<PublicKeyBytes>, GovernanceError>;

    fn dkg_set(&self, round: Round) -> Result<BTreeSet<PublicKeyBytes>, GovernanceError>;
}
