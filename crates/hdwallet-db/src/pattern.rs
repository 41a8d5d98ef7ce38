//! Per-subchain pattern index and scan progress.
//!
//! Maps each derivation index of a subchain to the byte patterns (script
//! fragments) the scanning driver tests against blocks and compact filters,
//! records which patterns have been tested against which blocks, and tracks
//! the last fully-scanned position per subchain.
//!
//! Pattern sets are append-only: once a (block, pattern set) pair has been
//! tested, that history is never removed. The scan position only moves
//! backwards through the explicit reorg rollback path.

use crate::error::WalletDbError;
use crate::storage::ChangeSet;
use hdwallet_types::{BlockHash, BlockPosition, SubchainIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A byte-string fragment derived from a key, tested against block data.
pub type Pattern = Vec<u8>;

/// Current on-disk schema version for pattern index records.
pub(crate) const RECORD_VERSION: u32 = 1;

/// Persisted pattern set for one (subchain, derivation index) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub version: u32,
    pub subchain: SubchainIndex,
    pub index: u32,
    pub patterns: Vec<Pattern>,
}

/// Persisted scan history for one (subchain, block) pair: which derivation
/// indices have been tested against the block, and which of them matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockScanRecord {
    pub version: u32,
    pub subchain: SubchainIndex,
    pub block: BlockHash,
    pub tested: BTreeSet<u32>,
    pub matches: BTreeSet<u32>,
}

/// Persisted last-scanned position for a subchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPositionRecord {
    pub version: u32,
    pub subchain: SubchainIndex,
    pub position: BlockPosition,
}

#[derive(Debug, Default)]
struct SubchainPatterns {
    /// Derivation index -> registered patterns, in registration order.
    patterns: BTreeMap<u32, Vec<Pattern>>,
    /// Scan history per block.
    block_scans: HashMap<BlockHash, (BTreeSet<u32>, BTreeSet<u32>)>,
    /// Indices handed out for testing per block, not yet recorded.
    ///
    /// Memory-only: a crash before `record_matches` leaves the block
    /// untested and the batch is simply issued again.
    issued: HashMap<BlockHash, BTreeSet<u32>>,
    /// Last fully-scanned position.
    position: Option<BlockPosition>,
}

/// In-memory pattern index over all registered subchains.
///
/// Owned exclusively by the coordinator; mutations are staged into a
/// [`ChangeSet`], persisted, and only then applied here.
#[derive(Debug, Default)]
pub struct PatternIndex {
    subchains: HashMap<SubchainIndex, SubchainPatterns>,
}

impl PatternIndex {
    /// Make a subchain known to the index. Idempotent.
    pub(crate) fn add_subchain(&mut self, subchain: SubchainIndex) {
        self.subchains.entry(subchain).or_default();
    }

    fn entry(&self, subchain: &SubchainIndex) -> Result<&SubchainPatterns, WalletDbError> {
        self.subchains
            .get(subchain)
            .ok_or(WalletDbError::InvalidSubchain(*subchain))
    }

    // ── Planning (read-only, stages changes) ─────────────────────────────

    /// Stage an idempotent pattern upsert for (subchain, derivation index).
    ///
    /// Existing patterns are never removed; new patterns are appended in
    /// order. Returns `false` when the registration is a no-op. Has no
    /// effect on scan position.
    pub(crate) fn plan_register(
        &self,
        subchain: SubchainIndex,
        index: u32,
        patterns: &[Pattern],
        cs: &mut ChangeSet,
    ) -> Result<bool, WalletDbError> {
        let entry = self.entry(&subchain)?;

        let mut merged = entry.patterns.get(&index).cloned().unwrap_or_default();
        let before = merged.len();
        for pattern in patterns {
            if !merged.contains(pattern) {
                merged.push(pattern.clone());
            }
        }

        if merged.len() == before && entry.patterns.contains_key(&index) {
            return Ok(false);
        }

        log::debug!(
            "registering {} pattern(s) for subchain {} index {}",
            merged.len(),
            subchain,
            index
        );
        cs.patterns.push(PatternRecord {
            version: RECORD_VERSION,
            subchain,
            index,
            patterns: merged,
        });
        Ok(true)
    }

    /// All patterns for `subchain` not yet marked tested against `block`.
    ///
    /// The returned indices are remembered as the issued batch for this
    /// block, so a later `record_matches` marks exactly them tested. A
    /// pattern registered while a batch is out for testing is not in the
    /// issued set and surfaces in the next call.
    pub fn untested_patterns(
        &mut self,
        subchain: &SubchainIndex,
        block: &BlockHash,
    ) -> Result<Vec<(u32, Vec<Pattern>)>, WalletDbError> {
        let entry = self
            .subchains
            .get_mut(subchain)
            .ok_or(WalletDbError::InvalidSubchain(*subchain))?;
        let tested = entry
            .block_scans
            .get(block)
            .map(|(tested, _)| tested.clone())
            .unwrap_or_default();

        let batch: Vec<(u32, Vec<Pattern>)> = entry
            .patterns
            .iter()
            .filter(|(index, _)| !tested.contains(index))
            .map(|(index, patterns)| (*index, patterns.clone()))
            .collect();
        entry
            .issued
            .entry(*block)
            .or_default()
            .extend(batch.iter().map(|(index, _)| *index));
        Ok(batch)
    }

    /// Stage the result of testing `subchain`'s patterns against `block`.
    ///
    /// Marks the batch issued for this block (plus any reported matches) as
    /// tested and adds `matching` to the block's match history. Purely
    /// additive; indices registered after the batch was issued stay
    /// untested.
    pub(crate) fn plan_record_matches(
        &self,
        subchain: SubchainIndex,
        block: BlockHash,
        matching: &[u32],
        cs: &mut ChangeSet,
    ) -> Result<(), WalletDbError> {
        let entry = self.entry(&subchain)?;

        let (mut tested, mut matches) = entry
            .block_scans
            .get(&block)
            .cloned()
            .unwrap_or_default();

        if let Some(issued) = entry.issued.get(&block) {
            tested.extend(issued.iter().copied());
        }
        for index in matching {
            if !entry.patterns.contains_key(index) {
                log::warn!(
                    "match reported for unregistered index {} on subchain {}",
                    index,
                    subchain
                );
            }
            tested.insert(*index);
            matches.insert(*index);
        }

        cs.block_scans.push(BlockScanRecord {
            version: RECORD_VERSION,
            subchain,
            block,
            tested,
            matches,
        });
        Ok(())
    }

    /// Stage a scan position update.
    ///
    /// Height must be non-decreasing unless `allow_decrease` is set, which
    /// only the reorg rollback path does.
    pub(crate) fn plan_set_position(
        &self,
        subchain: SubchainIndex,
        position: BlockPosition,
        allow_decrease: bool,
        cs: &mut ChangeSet,
    ) -> Result<(), WalletDbError> {
        let entry = self.entry(&subchain)?;

        if let Some(current) = entry.position {
            if position.height < current.height && !allow_decrease {
                return Err(WalletDbError::OutOfOrder {
                    subchain,
                    current: current.height,
                    requested: position.height,
                });
            }
        }

        cs.scan_positions.push(ScanPositionRecord {
            version: RECORD_VERSION,
            subchain,
            position,
        });
        Ok(())
    }

    /// Stage rollbacks for every subchain scanned past `last_good`.
    ///
    /// Subchains already at or behind the rollback point keep their position;
    /// a rollback never moves a scan position forward.
    pub(crate) fn plan_rollback(
        &self,
        last_good: BlockPosition,
        cs: &mut ChangeSet,
    ) -> Vec<SubchainIndex> {
        let mut affected = Vec::new();
        for (subchain, entry) in &self.subchains {
            if let Some(current) = entry.position {
                if current.height > last_good.height {
                    cs.scan_positions.push(ScanPositionRecord {
                        version: RECORD_VERSION,
                        subchain: *subchain,
                        position: last_good,
                    });
                    affected.push(*subchain);
                }
            }
        }
        affected
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Highest derivation index with registered patterns, if any.
    pub fn last_indexed(&self, subchain: &SubchainIndex) -> Result<Option<u32>, WalletDbError> {
        Ok(self.entry(subchain)?.patterns.keys().next_back().copied())
    }

    /// Last fully-scanned position, if any block has completed.
    pub fn last_scanned(
        &self,
        subchain: &SubchainIndex,
    ) -> Result<Option<BlockPosition>, WalletDbError> {
        Ok(self.entry(subchain)?.position)
    }

    /// Match history for a block: derivation indices that produced a match.
    pub fn block_matches(
        &self,
        subchain: &SubchainIndex,
        block: &BlockHash,
    ) -> Result<Vec<u32>, WalletDbError> {
        Ok(self
            .entry(subchain)?
            .block_scans
            .get(block)
            .map(|(_, matches)| matches.iter().copied().collect())
            .unwrap_or_default())
    }

    /// All registered patterns for a subchain, by derivation index.
    pub fn patterns(
        &self,
        subchain: &SubchainIndex,
    ) -> Result<Vec<(u32, Vec<Pattern>)>, WalletDbError> {
        Ok(self
            .entry(subchain)?
            .patterns
            .iter()
            .map(|(index, patterns)| (*index, patterns.clone()))
            .collect())
    }

    // ── Application (post-commit, infallible) ────────────────────────────

    pub(crate) fn apply_pattern(&mut self, record: &PatternRecord) {
        self.subchains
            .entry(record.subchain)
            .or_default()
            .patterns
            .insert(record.index, record.patterns.clone());
    }

    pub(crate) fn apply_block_scan(&mut self, record: &BlockScanRecord) {
        let entry = self.subchains.entry(record.subchain).or_default();
        entry
            .block_scans
            .insert(record.block, (record.tested.clone(), record.matches.clone()));
        entry.issued.remove(&record.block);
    }

    pub(crate) fn apply_position(&mut self, record: &ScanPositionRecord) {
        self.subchains
            .entry(record.subchain)
            .or_default()
            .position = Some(record.position);
    }
}
