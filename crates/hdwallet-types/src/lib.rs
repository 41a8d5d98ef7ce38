//! Core types for the HD wallet database.
//!
//! This crate provides the foundational types used across all wallet crates:
//! transaction and block identifiers, outpoints, amounts, identity references,
//! and the subaccount/subchain model used to key pattern and scan-progress
//! lookups.

pub mod chain;
pub mod identifier;
pub mod subaccount;

pub use chain::{Amount, BlockHash, BlockPosition, Outpoint, TxOut, Txid, WalletTx};
pub use identifier::{ContactId, NymId, ProposalId, SubaccountId};
pub use subaccount::{KeyRef, Subaccount, SubaccountType, Subchain, SubchainIndex};
