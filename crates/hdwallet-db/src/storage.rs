//! Persistence layer over redb.
//!
//! All wallet state lives in one embedded key-value database with typed
//! tables keyed by composite binary keys (subchain index bytes ++ derivation
//! index, outpoint bytes, proposal id bytes). Record values are versioned
//! serialized blobs.
//!
//! Mutations are expressed as a [`ChangeSet`] staged by the in-memory
//! components and written in a single transaction: either every record in
//! the set commits, or none do. Dropping the write transaction on any error
//! aborts it, leaving the prior state intact.

use crate::error::WalletDbError;
use crate::ledger::OutputRecord;
use crate::pattern::{BlockScanRecord, PatternRecord, ScanPositionRecord};
use crate::proposal::ProposalRecord;
use hdwallet_types::{
    BlockPosition, ProposalId, Subaccount, SubaccountId, Subchain, SubchainIndex,
};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

pub(crate) const RECORD_VERSION: u32 = 1;

const SUBACCOUNTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("subaccounts");
const SUBCHAINS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("subchains");
const PATTERNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("patterns");
const BLOCK_SCANS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("block_scans");
const SCAN_POSITIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("scan_positions");
const OUTPUTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("outputs");
const PROPOSALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("proposals");
const CHAIN_TIP: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chain_tip");

const TIP_KEY: &[u8] = b"tip";

/// Persisted subaccount registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubaccountRecord {
    pub version: u32,
    pub subaccount: Subaccount,
}

/// Persisted (subchain index -> subaccount, role) registration, so indices
/// can be resolved after restart without re-deriving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubchainRecord {
    pub version: u32,
    pub index: SubchainIndex,
    pub subaccount: SubaccountId,
    pub subchain: Subchain,
}

/// Persisted best-chain checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipRecord {
    pub version: u32,
    pub position: BlockPosition,
}

/// One atomic batch of staged mutations.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub subaccounts: Vec<SubaccountRecord>,
    pub subchains: Vec<SubchainRecord>,
    pub patterns: Vec<PatternRecord>,
    pub block_scans: Vec<BlockScanRecord>,
    pub scan_positions: Vec<ScanPositionRecord>,
    pub outputs: Vec<OutputRecord>,
    pub proposals: Vec<ProposalRecord>,
    pub forgotten_proposals: Vec<ProposalId>,
    pub tip: Option<TipRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.subaccounts.is_empty()
            && self.subchains.is_empty()
            && self.patterns.is_empty()
            && self.block_scans.is_empty()
            && self.scan_positions.is_empty()
            && self.outputs.is_empty()
            && self.proposals.is_empty()
            && self.forgotten_proposals.is_empty()
            && self.tip.is_none()
    }
}

/// Everything the store holds, read back in one snapshot at open.
#[derive(Debug, Default)]
pub(crate) struct LoadedState {
    pub subaccounts: Vec<SubaccountRecord>,
    pub subchains: Vec<SubchainRecord>,
    pub patterns: Vec<PatternRecord>,
    pub block_scans: Vec<BlockScanRecord>,
    pub scan_positions: Vec<ScanPositionRecord>,
    pub outputs: Vec<OutputRecord>,
    pub proposals: Vec<ProposalRecord>,
    pub tip: Option<TipRecord>,
}

/// The embedded wallet database.
pub struct WalletStore {
    db: Database,
}

impl WalletStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: &Path) -> Result<Self, WalletDbError> {
        let db = Database::create(path).map_err(stg)?;
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Open a fresh in-memory store. Used by tests and ephemeral wallets.
    pub fn open_in_memory() -> Result<Self, WalletDbError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(stg)?;
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create every table up front so later read transactions never race
    /// table creation.
    fn ensure_tables(&self) -> Result<(), WalletDbError> {
        let wtx = self.db.begin_write().map_err(stg)?;
        {
            wtx.open_table(SUBACCOUNTS).map_err(stg)?;
            wtx.open_table(SUBCHAINS).map_err(stg)?;
            wtx.open_table(PATTERNS).map_err(stg)?;
            wtx.open_table(BLOCK_SCANS).map_err(stg)?;
            wtx.open_table(SCAN_POSITIONS).map_err(stg)?;
            wtx.open_table(OUTPUTS).map_err(stg)?;
            wtx.open_table(PROPOSALS).map_err(stg)?;
            wtx.open_table(CHAIN_TIP).map_err(stg)?;
        }
        wtx.commit().map_err(stg)
    }

    /// Write a change set in one transaction.
    ///
    /// On any error the transaction is dropped, which aborts it; no partial
    /// writes become visible.
    pub(crate) fn commit(&self, cs: &ChangeSet) -> Result<(), WalletDbError> {
        let wtx = self.db.begin_write().map_err(stg)?;
        {
            let mut table = wtx.open_table(SUBACCOUNTS).map_err(stg)?;
            for record in &cs.subaccounts {
                let blob = to_blob(record)?;
                table
                    .insert(record.subaccount.id.as_bytes().as_slice(), blob.as_slice())
                    .map_err(stg)?;
            }

            let mut table = wtx.open_table(SUBCHAINS).map_err(stg)?;
            for record in &cs.subchains {
                let blob = to_blob(record)?;
                table
                    .insert(record.index.as_bytes().as_slice(), blob.as_slice())
                    .map_err(stg)?;
            }

            let mut table = wtx.open_table(PATTERNS).map_err(stg)?;
            for record in &cs.patterns {
                let blob = to_blob(record)?;
                let key = pattern_key(&record.subchain, record.index);
                table.insert(key.as_slice(), blob.as_slice()).map_err(stg)?;
            }

            let mut table = wtx.open_table(BLOCK_SCANS).map_err(stg)?;
            for record in &cs.block_scans {
                let blob = to_blob(record)?;
                let key = block_scan_key(&record.subchain, &record.block.0);
                table.insert(key.as_slice(), blob.as_slice()).map_err(stg)?;
            }

            let mut table = wtx.open_table(SCAN_POSITIONS).map_err(stg)?;
            for record in &cs.scan_positions {
                let blob = to_blob(record)?;
                table
                    .insert(record.subchain.as_bytes().as_slice(), blob.as_slice())
                    .map_err(stg)?;
            }

            let mut table = wtx.open_table(OUTPUTS).map_err(stg)?;
            for record in &cs.outputs {
                let blob = to_blob(record)?;
                let key = record.outpoint.to_key_bytes();
                table.insert(key.as_slice(), blob.as_slice()).map_err(stg)?;
            }

            let mut table = wtx.open_table(PROPOSALS).map_err(stg)?;
            for record in &cs.proposals {
                let blob = to_blob(record)?;
                table
                    .insert(record.id.as_bytes().as_slice(), blob.as_slice())
                    .map_err(stg)?;
            }
            for id in &cs.forgotten_proposals {
                table.remove(id.as_bytes().as_slice()).map_err(stg)?;
            }

            if let Some(tip) = &cs.tip {
                let mut table = wtx.open_table(CHAIN_TIP).map_err(stg)?;
                let blob = to_blob(tip)?;
                table.insert(TIP_KEY, blob.as_slice()).map_err(stg)?;
            }
        }
        wtx.commit().map_err(stg)
    }

    /// Read the entire store in one consistent snapshot.
    pub(crate) fn load(&self) -> Result<LoadedState, WalletDbError> {
        let rtx = self.db.begin_read().map_err(stg)?;
        let mut state = LoadedState::default();

        state.subaccounts = load_table(&rtx, SUBACCOUNTS)?;
        state.subchains = load_table(&rtx, SUBCHAINS)?;
        state.patterns = load_table(&rtx, PATTERNS)?;
        state.block_scans = load_table(&rtx, BLOCK_SCANS)?;
        state.scan_positions = load_table(&rtx, SCAN_POSITIONS)?;
        state.outputs = load_table(&rtx, OUTPUTS)?;
        state.proposals = load_table(&rtx, PROPOSALS)?;

        let table = rtx.open_table(CHAIN_TIP).map_err(stg)?;
        if let Some(guard) = table.get(TIP_KEY).map_err(stg)? {
            state.tip = Some(from_blob(guard.value())?);
        }

        log::debug!(
            "loaded {} subaccounts, {} subchains, {} pattern sets, {} outputs, {} proposals",
            state.subaccounts.len(),
            state.subchains.len(),
            state.patterns.len(),
            state.outputs.len(),
            state.proposals.len()
        );
        Ok(state)
    }
}

fn load_table<T: DeserializeOwned>(
    rtx: &redb::ReadTransaction,
    def: TableDefinition<'static, &'static [u8], &'static [u8]>,
) -> Result<Vec<T>, WalletDbError> {
    let table = rtx.open_table(def).map_err(stg)?;
    let mut records = Vec::new();
    for entry in table.iter().map_err(stg)? {
        let (_, value) = entry.map_err(stg)?;
        records.push(from_blob(value.value())?);
    }
    Ok(records)
}

/// Composite key: subchain index bytes ++ big-endian derivation index.
fn pattern_key(subchain: &SubchainIndex, index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(subchain.as_bytes());
    key[32..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Composite key: subchain index bytes ++ block hash bytes.
fn block_scan_key(subchain: &SubchainIndex, block: &[u8; 32]) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(subchain.as_bytes());
    key[32..].copy_from_slice(block);
    key
}

fn to_blob<T: Serialize>(value: &T) -> Result<Vec<u8>, WalletDbError> {
    serde_json::to_vec(value).map_err(|e| WalletDbError::Serialization(e.to_string()))
}

fn from_blob<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WalletDbError> {
    serde_json::from_slice(bytes).map_err(|e| WalletDbError::Serialization(e.to_string()))
}

fn stg<E: std::fmt::Display>(e: E) -> WalletDbError {
    WalletDbError::Storage(e.to_string())
}
