//! Wallet database core.
//!
//! Provides subchain pattern indexing, scan-progress tracking, the UTXO
//! ledger with per-owner balances, spend proposals with output reservation,
//! and reorg-safe persistence over an embedded key-value store.

pub mod error;
pub mod ledger;
pub mod pattern;
pub mod policy;
pub mod proposal;
pub mod storage;
pub mod wallet;

pub use error::WalletDbError;
pub use ledger::{Balance, OutputQuery, OutputRecord, OutputState, OutputTag};
pub use pattern::Pattern;
pub use policy::{SelectionStrategy, SpendPolicy};
pub use proposal::{ProposalRecord, ProposalStatus};
pub use storage::{ChangeSet, WalletStore};
pub use wallet::{ChainAuthority, ReorgSummary, WalletDb};

// Re-export the shared primitive types for convenience.
pub use hdwallet_types::{
    Amount, BlockHash, BlockPosition, ContactId, KeyRef, NymId, Outpoint, ProposalId,
    Subaccount, SubaccountId, SubaccountType, Subchain, SubchainIndex, TxOut, Txid, WalletTx,
};
