//! Wallet database error types.

use hdwallet_types::{ProposalId, SubaccountId, SubchainIndex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletDbError {
    #[error("unknown subchain index {0}")]
    InvalidSubchain(SubchainIndex),

    #[error("subaccount {0} is already registered")]
    DuplicateSubaccount(SubaccountId),

    #[error(
        "scan position for subchain {subchain} would move backwards: \
         {current} -> {requested}"
    )]
    OutOfOrder {
        subchain: SubchainIndex,
        current: u64,
        requested: u64,
    },

    #[error("chain tip would move backwards: {current} -> {requested}")]
    TipOutOfOrder { current: u64, requested: u64 },

    #[error("scan result at height {requested} does not fit the recorded chain tip {tip}")]
    StaleScanResult { tip: u64, requested: u64 },

    #[error("proposal {0} already exists and is active")]
    DuplicateProposal(ProposalId),

    #[error("proposal {0} is still active")]
    ProposalStillActive(ProposalId),

    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    #[error("reorg rollback failed, prior state retained: {0}")]
    ReorgIncomplete(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}
