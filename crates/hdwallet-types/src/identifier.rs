//! Opaque 32-byte identifiers for identities, subaccounts, contacts, and
//! spend proposals.
//!
//! The wallet database stores these as-is; resolution to actual nyms or
//! contact records happens in external subsystems.

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            Default,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Generate a fresh random identifier.
            pub fn random() -> Self {
                let mut bytes = [0u8; 32];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
                Self(bytes)
            }

            /// Parse from a 64-character hex string.
            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                if bytes.len() != 32 {
                    return None;
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Some(Self(arr))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }
    };
}

define_id!(
    /// The identity (nym) owning a subaccount or balance.
    NymId
);

define_id!(
    /// A key-derivation source within a wallet (HD account, payment-code
    /// channel, or imported key set).
    SubaccountId
);

define_id!(
    /// An address-book contact attached to an output as payer/payee.
    ContactId
);

define_id!(
    /// A caller-supplied identifier for a pending spend proposal.
    ProposalId
);
