//! Blockchain primitives: transaction/block identifiers, outpoints, positions,
//! and amounts.

use serde::{Deserialize, Serialize};

/// A transaction identifier (32 bytes).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex_to_32(s).map(Txid)
    }
}

impl std::fmt::Display for Txid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A block identifier (32-byte header hash).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex_to_32(s).map(BlockHash)
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A reference to a transaction output: (transaction id, output index).
///
/// Globally unique for a given chain regardless of whether the wallet knows
/// about the output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Outpoint {
    pub txid: Txid,
    pub index: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Serialize to the 36-byte storage key: txid ++ big-endian index.
    pub fn to_key_bytes(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    /// Parse from the 36-byte storage key.
    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&bytes[32..]);
        Some(Self {
            txid: Txid(txid),
            index: u32::from_be_bytes(index),
        })
    }
}

impl std::fmt::Display for Outpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A position on the best chain: height plus the hash at that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPosition {
    pub height: u64,
    pub hash: BlockHash,
}

impl BlockPosition {
    pub fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl std::fmt::Display for BlockPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// An amount in atomic units.
///
/// Arithmetic is checked; overflow returns `None` instead of wrapping.
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
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Saturating sum of an iterator of amounts.
    pub fn sum<I: IntoIterator<Item = Amount>>(iter: I) -> Amount {
        Amount(iter.into_iter().fold(0u64, |acc, a| acc.saturating_add(a.0)))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single output of a wallet-relevant transaction, as delivered by the
/// scanning driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    /// Opaque contact reference for the payer/payee, if the resolver supplied
    /// one.
    pub contact: Option<crate::identifier::ContactId>,
}

impl TxOut {
    pub fn new(value: Amount) -> Self {
        Self {
            value,
            contact: None,
        }
    }
}

/// The subset of a transaction the wallet database needs: its id, the
/// outpoints it consumes, and the outputs it creates.
///
/// Parsing and validation of the full wire transaction happen upstream in the
/// scanning driver; this is the post-match summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTx {
    pub txid: Txid,
    pub inputs: Vec<Outpoint>,
    pub outputs: Vec<TxOut>,
}

impl WalletTx {
    pub fn new(txid: Txid, inputs: Vec<Outpoint>, outputs: Vec<TxOut>) -> Self {
        Self {
            txid,
            inputs,
            outputs,
        }
    }

    pub fn outpoint(&self, index: u32) -> Option<Outpoint> {
        if (index as usize) < self.outputs.len() {
            Some(Outpoint::new(self.txid, index))
        } else {
            None
        }
    }
}

/// Convert a hex string to a 32-byte array.
fn hex_to_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Some(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txid_hex_roundtrip() {
        let txid = Txid([0xAB; 32]);
        let parsed = Txid::from_hex(&txid.to_string()).unwrap();
        assert_eq!(txid, parsed);
    }

    #[test]
    fn test_txid_from_hex_wrong_length() {
        assert!(Txid::from_hex("aabb").is_none());
        assert!(Txid::from_hex("not hex").is_none());
    }

    #[test]
    fn test_outpoint_key_bytes_roundtrip() {
        let op = Outpoint::new(Txid([7u8; 32]), 42);
        let key = op.to_key_bytes();
        assert_eq!(key.len(), 36);
        assert_eq!(Outpoint::from_key_bytes(&key).unwrap(), op);
    }

    #[test]
    fn test_outpoint_key_bytes_ordering() {
        // Big-endian index keeps outputs of the same tx adjacent and ordered.
        let a = Outpoint::new(Txid([1u8; 32]), 1).to_key_bytes();
        let b = Outpoint::new(Txid([1u8; 32]), 2).to_key_bytes();
        let c = Outpoint::new(Txid([2u8; 32]), 0).to_key_bytes();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_outpoint_from_key_bytes_wrong_length() {
        assert!(Outpoint::from_key_bytes(&[0u8; 35]).is_none());
        assert!(Outpoint::from_key_bytes(&[0u8; 37]).is_none());
    }

    #[test]
    fn test_amount_checked_arithmetic() {
        assert_eq!(
            Amount(2).checked_add(Amount(3)),
            Some(Amount(5))
        );
        assert_eq!(Amount(u64::MAX).checked_add(Amount(1)), None);
        assert_eq!(Amount(5).checked_sub(Amount(2)), Some(Amount(3)));
        assert_eq!(Amount(2).checked_sub(Amount(5)), None);
    }

    #[test]
    fn test_amount_sum() {
        let total = Amount::sum([Amount(1), Amount(2), Amount(3)]);
        assert_eq!(total, Amount(6));
    }

    #[test]
    fn test_wallet_tx_outpoint_bounds() {
        let tx = WalletTx::new(
            Txid([9u8; 32]),
            vec![],
            vec![TxOut::new(Amount(100)), TxOut::new(Amount(200))],
        );
        assert_eq!(tx.outpoint(0), Some(Outpoint::new(tx.txid, 0)));
        assert_eq!(tx.outpoint(1), Some(Outpoint::new(tx.txid, 1)));
        assert!(tx.outpoint(2).is_none());
    }

    #[test]
    fn test_block_position_display() {
        let pos = BlockPosition::new(100, BlockHash([0u8; 32]));
        let s = pos.to_string();
        assert!(s.starts_with("100@"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let tx = WalletTx::new(
            Txid([3u8; 32]),
            vec![Outpoint::new(Txid([1u8; 32]), 0)],
            vec![TxOut::new(Amount(12345))],
        );
        let json = serde_json::to_string(&tx).unwrap();
        let back: WalletTx = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }
}
