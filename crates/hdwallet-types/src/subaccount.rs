//! The subaccount/subchain model.
//!
//! A subaccount is a key-derivation source (HD chain, payment-code channel,
//! or imported key set). Each subaccount exposes one or more subchains —
//! derivation roles such as external/receiving vs internal/change — and each
//! (subaccount, subchain) pair maps to a deterministic [`SubchainIndex`] used
//! as the key for pattern and scan-progress lookups.

use crate::identifier::{NymId, SubaccountId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A derivation role within a subaccount.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Subchain {
    /// Receiving addresses, visible to counterparties.
    External,
    /// Change addresses, internal to the wallet.
    Internal,
}

impl Subchain {
    /// Stable one-byte tag used in subchain index derivation and storage keys.
    pub fn tag(&self) -> u8 {
        match self {
            Subchain::External => 0,
            Subchain::Internal => 1,
        }
    }
}

impl std::fmt::Display for Subchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subchain::External => write!(f, "external"),
            Subchain::Internal => write!(f, "internal"),
        }
    }
}

/// The kind of key-derivation source backing a subaccount.
///
/// A closed enum: each variant answers capability questions directly instead
/// of going through an inheritance hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum SubaccountType {
    /// BIP32-style hierarchical deterministic account.
    Hd,
    /// BIP47-style payment-code channel.
    PaymentCode,
    /// A set of individually imported keys.
    Imported,
}

impl SubaccountType {
    /// The subchain roles this kind of subaccount derives.
    ///
    /// Imported key sets have no change chain; everything is external.
    pub fn allowed_subchains(&self) -> &'static [Subchain] {
        match self {
            SubaccountType::Hd | SubaccountType::PaymentCode => {
                &[Subchain::External, Subchain::Internal]
            }
            SubaccountType::Imported => &[Subchain::External],
        }
    }

    /// Whether outputs owned by this subaccount count toward spendable
    /// balance.
    pub fn balance_element(&self) -> bool {
        // All current variants contribute. Kept explicit so a future
        // watch-only variant can opt out.
        true
    }

    /// Whether scan progress is tracked per subchain for this kind.
    pub fn tracks_scan_progress(&self) -> bool {
        true
    }
}

/// An immutable key-derivation source registered with the wallet database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subaccount {
    pub id: SubaccountId,
    pub owner: NymId,
    pub kind: SubaccountType,
}

impl Subaccount {
    pub fn new(id: SubaccountId, owner: NymId, kind: SubaccountType) -> Self {
        Self { id, owner, kind }
    }
}

/// Deterministic identifier for a (subaccount, subchain) pair.
///
/// Derived as SHA-256 over a domain tag, the subaccount id, and the subchain
/// role tag, so the same pair always maps to the same 32-byte index on every
/// run and every machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubchainIndex(pub [u8; 32]);

const SUBCHAIN_DOMAIN: &[u8] = b"hdwallet.subchain.v1";

impl SubchainIndex {
    pub fn derive(subaccount: &SubaccountId, subchain: Subchain) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SUBCHAIN_DOMAIN);
        hasher.update(subaccount.as_bytes());
        hasher.update([subchain.tag()]);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for SubchainIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Fully qualified reference to a derived key: which subaccount, which
/// subchain role, and the derivation index within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct KeyRef {
    pub subaccount: SubaccountId,
    pub subchain: Subchain,
    pub index: u32,
}

impl KeyRef {
    pub fn new(subaccount: SubaccountId, subchain: Subchain, index: u32) -> Self {
        Self {
            subaccount,
            subchain,
            index,
        }
    }

    pub fn subchain_index(&self) -> SubchainIndex {
        SubchainIndex::derive(&self.subaccount, self.subchain)
    }
}
