//! The wallet database coordinator.
//!
//! [`WalletDb`] owns the in-memory components (pattern index, output ledger,
//! proposal book) behind one `RwLock` and pairs them with the persistent
//! [`WalletStore`]. Every mutation follows the same discipline:
//!
//! 1. take the write lock,
//! 2. plan: validate against current state and stage records into a
//!    [`ChangeSet`] without touching memory,
//! 3. commit the change set to storage in one transaction,
//! 4. apply the committed records to memory, infallibly.
//!
//! A failed commit therefore leaves both storage and memory exactly as they
//! were, and readers observe either the full pre-state or the full
//! post-state of any operation, never a mix.

use crate::error::WalletDbError;
use crate::ledger::{Balance, OutputLedger, OutputQuery, OutputRecord};
use crate::pattern::{Pattern, PatternIndex};
use crate::policy::SpendPolicy;
use crate::proposal::{ProposalBook, ProposalRecord};
use crate::storage::{
    ChangeSet, SubaccountRecord, SubchainRecord, TipRecord, WalletStore, RECORD_VERSION,
};
use hdwallet_types::{
    BlockHash, BlockPosition, KeyRef, NymId, Outpoint, ProposalId, Subaccount, SubaccountId,
    Subchain, SubchainIndex, Txid, WalletTx,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The wallet's view of the chain it scans against, supplied by the caller
/// during reorg handling.
pub trait ChainAuthority {
    /// Hash of the block at `height` on the new best chain, if known.
    fn hash_at(&self, height: u64) -> Option<BlockHash>;

    /// Whether `txid` still exists on the new best chain or in its mempool.
    fn tx_exists(&self, txid: &Txid) -> bool;
}

/// Summary of a completed reorg rollback.
#[derive(Debug)]
pub struct ReorgSummary {
    /// The newest block that survived the reorg; scan positions and the
    /// chain tip were rolled back to it.
    pub last_good: BlockPosition,
    /// Output records reverted.
    pub reverted_outputs: usize,
    /// Subchains whose scan position moved back.
    pub rolled_back_subchains: Vec<SubchainIndex>,
    /// Proposals returned to the active set because their confirming block
    /// was invalidated.
    pub reactivated: Vec<ProposalId>,
}

#[derive(Default)]
struct State {
    subaccounts: HashMap<SubaccountId, Subaccount>,
    subchains: HashMap<SubchainIndex, (SubaccountId, Subchain)>,
    patterns: PatternIndex,
    ledger: OutputLedger,
    proposals: ProposalBook,
    tip: Option<BlockPosition>,
}

impl State {
    /// Fold committed records into memory. Must not fail: by the time this
    /// runs the change set is already durable.
    fn apply(&mut self, cs: &ChangeSet) {
        for record in &cs.subaccounts {
            self.subaccounts.insert(record.subaccount.id, record.subaccount);
        }
        for record in &cs.subchains {
            self.subchains
                .insert(record.index, (record.subaccount, record.subchain));
            self.patterns.add_subchain(record.index);
        }
        for record in &cs.patterns {
            self.patterns.apply_pattern(record);
        }
        for record in &cs.block_scans {
            self.patterns.apply_block_scan(record);
        }
        for record in &cs.scan_positions {
            self.patterns.apply_position(record);
        }
        self.ledger.apply(&cs.outputs);
        self.proposals.apply(&cs.proposals, &cs.forgotten_proposals);
        if let Some(tip) = &cs.tip {
            self.tip = Some(tip.position);
        }
    }

    /// Reject scan results for blocks the recorded tip says cannot exist.
    ///
    /// After a reorg rolls the tip back, a stale in-flight result for an
    /// invalidated block would otherwise resurrect the invalidated data;
    /// results flow again once the tip has advanced along the new chain.
    fn check_against_tip(&self, position: &BlockPosition) -> Result<(), WalletDbError> {
        if let Some(tip) = self.tip {
            let stale = position.height > tip.height
                || (position.height == tip.height && position.hash != tip.hash);
            if stale {
                return Err(WalletDbError::StaleScanResult {
                    tip: tip.height,
                    requested: position.height,
                });
            }
        }
        Ok(())
    }

    fn resolve_subchain(
        &self,
        index: &SubchainIndex,
    ) -> Result<(Subaccount, Subchain), WalletDbError> {
        let (subaccount_id, subchain) = self
            .subchains
            .get(index)
            .ok_or(WalletDbError::InvalidSubchain(*index))?;
        let subaccount = self
            .subaccounts
            .get(subaccount_id)
            .copied()
            .ok_or(WalletDbError::InvalidSubchain(*index))?;
        Ok((subaccount, *subchain))
    }
}

/// The wallet database.
///
/// Cheap to share: callers typically wrap it in an `Arc` and hand clones to
/// the scanning driver, the spend path, and UI queries.
pub struct WalletDb {
    state: RwLock<State>,
    store: WalletStore,
}

impl WalletDb {
    /// Open (or create) a file-backed wallet database and load its state.
    pub fn open(path: &Path) -> Result<Self, WalletDbError> {
        Self::from_store(WalletStore::open(path)?)
    }

    /// Open an ephemeral in-memory wallet database.
    pub fn open_in_memory() -> Result<Self, WalletDbError> {
        Self::from_store(WalletStore::open_in_memory()?)
    }

    fn from_store(store: WalletStore) -> Result<Self, WalletDbError> {
        let loaded = store.load()?;
        let mut state = State::default();
        state.apply(&ChangeSet {
            subaccounts: loaded.subaccounts,
            subchains: loaded.subchains,
            patterns: loaded.patterns,
            block_scans: loaded.block_scans,
            scan_positions: loaded.scan_positions,
            outputs: loaded.outputs,
            proposals: loaded.proposals,
            forgotten_proposals: Vec::new(),
            tip: loaded.tip,
        });
        Ok(Self {
            state: RwLock::new(state),
            store,
        })
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, State>, WalletDbError> {
        self.state
            .read()
            .map_err(|e| WalletDbError::Lock(e.to_string()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, State>, WalletDbError> {
        self.state
            .write()
            .map_err(|e| WalletDbError::Lock(e.to_string()))
    }

    /// Commit a staged change set and fold it into memory. No-op when the
    /// plan staged nothing.
    fn commit(&self, state: &mut State, cs: ChangeSet) -> Result<(), WalletDbError> {
        if cs.is_empty() {
            return Ok(());
        }
        self.store.commit(&cs)?;
        state.apply(&cs);
        Ok(())
    }

    // ── Subaccounts ──────────────────────────────────────────────────────

    /// Register a subaccount and derive indices for every subchain role its
    /// kind exposes. Returns the derived (role, index) pairs.
    pub fn register_subaccount(
        &self,
        subaccount: Subaccount,
    ) -> Result<Vec<(Subchain, SubchainIndex)>, WalletDbError> {
        let mut state = self.write_lock()?;
        if state.subaccounts.contains_key(&subaccount.id) {
            return Err(WalletDbError::DuplicateSubaccount(subaccount.id));
        }

        let mut cs = ChangeSet::default();
        cs.subaccounts.push(SubaccountRecord {
            version: RECORD_VERSION,
            subaccount,
        });
        let mut derived = Vec::new();
        for subchain in subaccount.kind.allowed_subchains() {
            let index = SubchainIndex::derive(&subaccount.id, *subchain);
            cs.subchains.push(SubchainRecord {
                version: RECORD_VERSION,
                index,
                subaccount: subaccount.id,
                subchain: *subchain,
            });
            derived.push((*subchain, index));
        }
        self.commit(&mut state, cs)?;
        log::info!(
            "registered subaccount {} with {} subchain(s)",
            subaccount.id,
            derived.len()
        );
        Ok(derived)
    }

    pub fn subaccounts(&self) -> Result<Vec<Subaccount>, WalletDbError> {
        let state = self.read_lock()?;
        let mut all: Vec<Subaccount> = state.subaccounts.values().copied().collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }

    /// The subchain index for a registered (subaccount, role) pair.
    pub fn subchain_index(
        &self,
        subaccount: &SubaccountId,
        subchain: Subchain,
    ) -> Result<SubchainIndex, WalletDbError> {
        let state = self.read_lock()?;
        let index = SubchainIndex::derive(subaccount, subchain);
        if !state.subchains.contains_key(&index) {
            return Err(WalletDbError::InvalidSubchain(index));
        }
        Ok(index)
    }

    // ── Pattern index and scan progress ──────────────────────────────────

    /// Register the patterns for one derivation index of a subchain.
    ///
    /// Idempotent and append-only; returns `false` when every pattern was
    /// already registered. Never affects scan positions.
    pub fn register_elements(
        &self,
        subchain: SubchainIndex,
        index: u32,
        patterns: &[Pattern],
    ) -> Result<bool, WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let changed = state.patterns.plan_register(subchain, index, patterns, &mut cs)?;
        self.commit(&mut state, cs)?;
        Ok(changed)
    }

    /// Patterns of `subchain` not yet tested against `block`.
    ///
    /// The batch is remembered so a later [`record_matches`](Self::record_matches)
    /// marks exactly these indices tested, not indices registered in
    /// between.
    pub fn untested_patterns(
        &self,
        subchain: &SubchainIndex,
        block: &BlockHash,
    ) -> Result<Vec<(u32, Vec<Pattern>)>, WalletDbError> {
        self.write_lock()?.patterns.untested_patterns(subchain, block)
    }

    /// Record the outcome of testing `subchain`'s patterns against `block`:
    /// all currently-registered indices become tested, `matching` joins the
    /// block's match history.
    pub fn record_matches(
        &self,
        subchain: SubchainIndex,
        block: BlockHash,
        matching: &[u32],
    ) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        state
            .patterns
            .plan_record_matches(subchain, block, matching, &mut cs)?;
        self.commit(&mut state, cs)
    }

    /// Advance the fully-scanned position of a subchain. Height must be
    /// non-decreasing; only the reorg path moves it back.
    pub fn set_scan_position(
        &self,
        subchain: SubchainIndex,
        position: BlockPosition,
    ) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        state.check_against_tip(&position)?;
        let mut cs = ChangeSet::default();
        state
            .patterns
            .plan_set_position(subchain, position, false, &mut cs)?;
        self.commit(&mut state, cs)
    }

    /// Highest derivation index with registered patterns.
    pub fn last_indexed(&self, subchain: &SubchainIndex) -> Result<Option<u32>, WalletDbError> {
        self.read_lock()?.patterns.last_indexed(subchain)
    }

    /// Last fully-scanned position of a subchain.
    pub fn last_scanned(
        &self,
        subchain: &SubchainIndex,
    ) -> Result<Option<BlockPosition>, WalletDbError> {
        self.read_lock()?.patterns.last_scanned(subchain)
    }

    /// Derivation indices of `subchain` that matched in `block`.
    pub fn block_matches(
        &self,
        subchain: &SubchainIndex,
        block: &BlockHash,
    ) -> Result<Vec<u32>, WalletDbError> {
        self.read_lock()?.patterns.block_matches(subchain, block)
    }

    // ── Outputs and balances ─────────────────────────────────────────────

    /// Apply a confirmed wallet-relevant transaction.
    ///
    /// `outputs` pairs each matched vout with its derivation index. Inputs
    /// consuming wallet outputs are marked spent, and proposals whose spend
    /// this confirms complete. Idempotent per (txid, position). Returns
    /// `false`, without failing, when the subchain or an output index did
    /// not resolve.
    pub fn add_confirmed_outputs(
        &self,
        subchain: SubchainIndex,
        position: BlockPosition,
        block_index: u32,
        outputs: &[(u32, u32)],
        tx: &WalletTx,
    ) -> Result<bool, WalletDbError> {
        let mut state = self.write_lock()?;
        state.check_against_tip(&position)?;
        let (subaccount, role) = match state.resolve_subchain(&subchain) {
            Ok(resolved) => resolved,
            Err(_) => {
                log::warn!("confirmed tx {} references unknown subchain {}", tx.txid, subchain);
                return Ok(false);
            }
        };

        let mut cs = ChangeSet::default();
        let outcome = state.ledger.plan_add_confirmed(
            &subaccount,
            role,
            position,
            block_index,
            outputs,
            tx,
            &mut cs,
        );
        for proposal in &outcome.completed {
            state.proposals.plan_complete(proposal, &mut cs);
        }
        self.commit(&mut state, cs)?;
        Ok(outcome.applied)
    }

    /// Apply an unconfirmed wallet-relevant transaction from the mempool.
    pub fn add_mempool_outputs(
        &self,
        subchain: SubchainIndex,
        outputs: &[(u32, u32)],
        tx: &WalletTx,
    ) -> Result<bool, WalletDbError> {
        let mut state = self.write_lock()?;
        let (subaccount, role) = match state.resolve_subchain(&subchain) {
            Ok(resolved) => resolved,
            Err(_) => {
                log::warn!("mempool tx {} references unknown subchain {}", tx.txid, subchain);
                return Ok(false);
            }
        };

        let mut cs = ChangeSet::default();
        let applied = state
            .ledger
            .plan_add_mempool(&subaccount, role, outputs, tx, &mut cs);
        self.commit(&mut state, cs)?;
        Ok(applied)
    }

    /// Total balance across all owners.
    pub fn balance(&self) -> Result<Balance, WalletDbError> {
        Ok(self.read_lock()?.ledger.balance())
    }

    /// Balance for one owner.
    pub fn balance_for_owner(&self, owner: &NymId) -> Result<Balance, WalletDbError> {
        Ok(self.read_lock()?.ledger.balance_for_owner(owner))
    }

    /// Balance for one subaccount of an owner.
    pub fn balance_for_subaccount(
        &self,
        owner: &NymId,
        subaccount: &SubaccountId,
    ) -> Result<Balance, WalletDbError> {
        Ok(self
            .read_lock()?
            .ledger
            .balance_for_subaccount(owner, subaccount))
    }

    /// Balance attributable to a single derived key.
    pub fn balance_for_key(&self, key: &KeyRef) -> Result<Balance, WalletDbError> {
        Ok(self.read_lock()?.ledger.balance_for_key(key))
    }

    pub fn get_output(&self, outpoint: &Outpoint) -> Result<Option<OutputRecord>, WalletDbError> {
        Ok(self.read_lock()?.ledger.get_output(outpoint).cloned())
    }

    /// Output records matching `query`, ordered by outpoint.
    pub fn get_outputs(&self, query: &OutputQuery) -> Result<Vec<OutputRecord>, WalletDbError> {
        Ok(self.read_lock()?.ledger.get_outputs(query))
    }

    // ── Proposals ────────────────────────────────────────────────────────

    /// Create a spend proposal with an opaque description.
    ///
    /// Outputs already reserved under this id (reservation may precede the
    /// proposal record) are adopted into its reserved list, so a later
    /// cancel or forget releases them.
    pub fn add_proposal(
        &self,
        id: ProposalId,
        description: Vec<u8>,
    ) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let reserved = state.ledger.reserved_by(&id);
        state.proposals.plan_add(id, description, reserved, &mut cs)?;
        self.commit(&mut state, cs)
    }

    /// Reserve one eligible output of `spender` for `proposal`, chosen by
    /// `policy`.
    ///
    /// Returns `None` when nothing is eligible. Reservation and the
    /// proposal's reserved list update under one lock and one transaction, so
    /// two concurrent calls can never hold the same output.
    pub fn reserve_utxo(
        &self,
        spender: &NymId,
        proposal: ProposalId,
        policy: &SpendPolicy,
    ) -> Result<Option<OutputRecord>, WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let reserved = state
            .ledger
            .plan_reserve(spender, proposal, policy, &mut cs);
        if let Some(record) = &reserved {
            state.proposals.plan_attach(&proposal, record.outpoint, &mut cs);
        }
        self.commit(&mut state, cs)?;
        Ok(reserved)
    }

    /// Record the broadcast transaction built from `proposal`: its reserved
    /// outputs become unconfirmed spends of `tx.txid`.
    pub fn add_outgoing_transaction(
        &self,
        proposal: &ProposalId,
        tx: &WalletTx,
    ) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let reserved = state.proposals.plan_set_spending(proposal, tx.txid, &mut cs)?;
        state
            .ledger
            .plan_mark_spending(&reserved, proposal, tx.txid, &mut cs);
        self.commit(&mut state, cs)
    }

    /// Cancel a proposal and release its reservations. Idempotent: unknown
    /// or already-terminal proposals are a no-op.
    pub fn cancel_proposal(&self, id: &ProposalId) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let released = state.proposals.plan_cancel(id, &mut cs);
        state.ledger.plan_release(&released, id, &mut cs);
        self.commit(&mut state, cs)
    }

    /// Drop terminal proposals entirely, releasing any reservations still
    /// marked under them. Fails with `ProposalStillActive` if any id names an
    /// active proposal; unknown ids are skipped.
    pub fn forget_proposals(&self, ids: &[ProposalId]) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        let mut cs = ChangeSet::default();
        let released = state.proposals.plan_forget(ids, &mut cs)?;
        for (id, outpoints) in &released {
            state.ledger.plan_release(outpoints, id, &mut cs);
        }
        self.commit(&mut state, cs)
    }

    pub fn load_proposal(
        &self,
        id: &ProposalId,
    ) -> Result<Option<ProposalRecord>, WalletDbError> {
        Ok(self.read_lock()?.proposals.load(id).cloned())
    }

    /// All proposals, ordered by id.
    pub fn proposals(&self) -> Result<Vec<ProposalRecord>, WalletDbError> {
        Ok(self
            .read_lock()?
            .proposals
            .load_all()
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn proposal_exists(&self, id: &ProposalId) -> Result<bool, WalletDbError> {
        Ok(self.read_lock()?.proposals.exists(id))
    }

    /// Ids of proposals whose spend has confirmed.
    pub fn completed_proposals(
        &self,
    ) -> Result<std::collections::BTreeSet<ProposalId>, WalletDbError> {
        Ok(self.read_lock()?.proposals.completed())
    }

    // ── Chain tip and reorgs ─────────────────────────────────────────────

    /// Advance the recorded best-chain tip. Height must be non-decreasing;
    /// only [`finalize_reorg`](Self::finalize_reorg) moves it back.
    pub fn advance_tip(&self, position: BlockPosition) -> Result<(), WalletDbError> {
        let mut state = self.write_lock()?;
        if let Some(current) = state.tip {
            if position.height < current.height {
                return Err(WalletDbError::TipOutOfOrder {
                    current: current.height,
                    requested: position.height,
                });
            }
        }
        let mut cs = ChangeSet::default();
        cs.tip = Some(TipRecord {
            version: RECORD_VERSION,
            position,
        });
        self.commit(&mut state, cs)
    }

    pub fn chain_tip(&self) -> Result<Option<BlockPosition>, WalletDbError> {
        Ok(self.read_lock()?.tip)
    }

    /// Roll the database back after a reorg invalidated the given blocks.
    ///
    /// Everything happens in one transaction: scan positions and the chain
    /// tip move back to the newest surviving block, outputs mined in
    /// invalidated blocks revert to unconfirmed (or orphaned, when their
    /// transaction is gone from the new chain), confirmed spends are undone
    /// the same way, and proposals completed by un-confirmed spends return to
    /// the active set. If the commit fails, nothing changes and the caller
    /// gets `ReorgIncomplete`; retrying is safe.
    pub fn finalize_reorg(
        &self,
        authority: &dyn ChainAuthority,
        invalidated: &[BlockPosition],
    ) -> Result<ReorgSummary, WalletDbError> {
        let mut state = self.write_lock()?;

        let oldest = invalidated
            .iter()
            .min_by_key(|p| p.height)
            .ok_or_else(|| WalletDbError::ReorgIncomplete("empty invalidation set".into()))?;
        if oldest.height == 0 {
            return Err(WalletDbError::ReorgIncomplete(
                "cannot invalidate the genesis block".into(),
            ));
        }
        let last_good_height = oldest.height - 1;
        let last_good_hash = authority.hash_at(last_good_height).ok_or_else(|| {
            WalletDbError::ReorgIncomplete(format!(
                "no block hash for height {} on the new chain",
                last_good_height
            ))
        })?;
        let last_good = BlockPosition::new(last_good_height, last_good_hash);

        let mut newest_first: Vec<BlockPosition> = invalidated.to_vec();
        newest_first.sort_by(|a, b| b.height.cmp(&a.height));

        let mut cs = ChangeSet::default();
        let tx_exists = |txid: &Txid| authority.tx_exists(txid);
        let outcome = state
            .ledger
            .plan_rollback_chain(&newest_first, &tx_exists, &mut cs);
        let rolled_back_subchains = state.patterns.plan_rollback(last_good, &mut cs);
        for proposal in &outcome.reactivate {
            state.proposals.plan_reactivate(proposal, &mut cs);
        }
        cs.tip = Some(TipRecord {
            version: RECORD_VERSION,
            position: last_good,
        });

        self.store
            .commit(&cs)
            .map_err(|e| WalletDbError::ReorgIncomplete(e.to_string()))?;
        state.apply(&cs);

        log::info!(
            "reorg rolled back to {}: {} output(s) reverted, {} subchain(s) rewound",
            last_good,
            outcome.reverted,
            rolled_back_subchains.len()
        );
        Ok(ReorgSummary {
            last_good,
            reverted_outputs: outcome.reverted,
            rolled_back_subchains,
            reactivated: outcome.reactivate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::OutputState;
    use hdwallet_types::{Amount, SubaccountType, TxOut};

    fn block(n: u8) -> BlockHash {
        BlockHash([n; 32])
    }

    fn position(height: u64) -> BlockPosition {
        BlockPosition::new(height, block(height as u8))
    }

    fn tx(n: u8, values: &[u64]) -> WalletTx {
        WalletTx::new(
            Txid([n; 32]),
            vec![],
            values.iter().map(|v| TxOut::new(Amount(*v))).collect(),
        )
    }

    fn setup() -> (WalletDb, Subaccount, SubchainIndex) {
        let db = WalletDb::open_in_memory().unwrap();
        let subaccount = Subaccount::new(
            SubaccountId([1; 32]),
            NymId([2; 32]),
            SubaccountType::Hd,
        );
        let derived = db.register_subaccount(subaccount).unwrap();
        let external = derived
            .iter()
            .find(|(role, _)| *role == Subchain::External)
            .map(|(_, index)| *index)
            .unwrap();
        (db, subaccount, external)
    }

    struct StaticChain {
        hashes: HashMap<u64, BlockHash>,
        txs: Vec<Txid>,
    }

    impl ChainAuthority for StaticChain {
        fn hash_at(&self, height: u64) -> Option<BlockHash> {
            self.hashes.get(&height).copied()
        }

        fn tx_exists(&self, txid: &Txid) -> bool {
            self.txs.contains(txid)
        }
    }

    #[test]
    fn test_register_subaccount_derives_roles() {
        let (db, subaccount, external) = setup();
        assert_eq!(
            db.subchain_index(&subaccount.id, Subchain::External).unwrap(),
            external
        );
        db.subchain_index(&subaccount.id, Subchain::Internal).unwrap();

        let err = db.register_subaccount(subaccount).unwrap_err();
        assert!(matches!(err, WalletDbError::DuplicateSubaccount(_)));
    }

    #[test]
    fn test_imported_subaccount_has_no_internal_subchain() {
        let db = WalletDb::open_in_memory().unwrap();
        let imported = Subaccount::new(
            SubaccountId([3; 32]),
            NymId([2; 32]),
            SubaccountType::Imported,
        );
        let derived = db.register_subaccount(imported).unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].0, Subchain::External);

        let err = db
            .subchain_index(&imported.id, Subchain::Internal)
            .unwrap_err();
        assert!(matches!(err, WalletDbError::InvalidSubchain(_)));
    }

    #[test]
    fn test_scan_workflow() {
        let (db, _, external) = setup();

        assert!(db.register_elements(external, 0, &[vec![0xAA]]).unwrap());
        assert!(db.register_elements(external, 1, &[vec![0xBB]]).unwrap());
        assert!(!db.register_elements(external, 1, &[vec![0xBB]]).unwrap());
        assert_eq!(db.last_indexed(&external).unwrap(), Some(1));

        let b = block(10);
        assert_eq!(db.untested_patterns(&external, &b).unwrap().len(), 2);
        db.record_matches(external, b, &[1]).unwrap();
        assert!(db.untested_patterns(&external, &b).unwrap().is_empty());
        assert_eq!(db.block_matches(&external, &b).unwrap(), vec![1]);

        db.set_scan_position(external, position(10)).unwrap();
        assert_eq!(db.last_scanned(&external).unwrap().unwrap().height, 10);
        let err = db.set_scan_position(external, position(5)).unwrap_err();
        assert!(matches!(err, WalletDbError::OutOfOrder { .. }));
    }

    #[test]
    fn test_confirmed_outputs_and_balance() {
        let (db, subaccount, external) = setup();
        let t = tx(1, &[500, 300]);
        let applied = db
            .add_confirmed_outputs(external, position(10), 0, &[(0, 0), (1, 1)], &t)
            .unwrap();
        assert!(applied);

        assert_eq!(db.balance().unwrap().confirmed, Amount(800));
        assert_eq!(
            db.balance_for_owner(&subaccount.owner).unwrap().confirmed,
            Amount(800)
        );
        let outputs = db.get_outputs(&OutputQuery::default()).unwrap();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_unknown_subchain_is_non_fatal() {
        let (db, _, _) = setup();
        let bogus = SubchainIndex([0xFF; 32]);
        let applied = db
            .add_confirmed_outputs(bogus, position(10), 0, &[(0, 0)], &tx(1, &[5]))
            .unwrap();
        assert!(!applied);
        assert!(!db
            .add_mempool_outputs(bogus, &[(0, 0)], &tx(1, &[5]))
            .unwrap());
        assert_eq!(db.balance().unwrap(), Balance::default());
    }

    #[test]
    fn test_proposal_lifecycle() {
        let (db, subaccount, external) = setup();
        db.add_confirmed_outputs(external, position(10), 0, &[(0, 0)], &tx(1, &[500]))
            .unwrap();

        let id = ProposalId([7; 32]);
        db.add_proposal(id, b"send 400".to_vec()).unwrap();
        assert!(db.proposal_exists(&id).unwrap());

        let reserved = db
            .reserve_utxo(&subaccount.owner, id, &SpendPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(reserved.reserved_by, Some(id));
        assert_eq!(
            db.load_proposal(&id).unwrap().unwrap().reserved,
            vec![reserved.outpoint]
        );

        // The broadcast spend confirms; the proposal completes.
        let spend = WalletTx::new(Txid([9; 32]), vec![reserved.outpoint], vec![]);
        db.add_outgoing_transaction(&id, &spend).unwrap();
        assert_eq!(
            db.get_output(&reserved.outpoint).unwrap().unwrap().state,
            OutputState::UnconfirmedSpend
        );
        db.add_confirmed_outputs(external, position(11), 0, &[], &spend)
            .unwrap();
        assert!(db.completed_proposals().unwrap().contains(&id));

        db.forget_proposals(&[id]).unwrap();
        assert!(!db.proposal_exists(&id).unwrap());
    }

    #[test]
    fn test_cancel_releases_reservation() {
        let (db, subaccount, external) = setup();
        db.add_confirmed_outputs(external, position(10), 0, &[(0, 0)], &tx(1, &[500]))
            .unwrap();

        let id = ProposalId([7; 32]);
        db.add_proposal(id, vec![]).unwrap();
        let reserved = db
            .reserve_utxo(&subaccount.owner, id, &SpendPolicy::default())
            .unwrap()
            .unwrap();
        // Second proposal finds nothing while the reservation holds.
        let other = ProposalId([8; 32]);
        db.add_proposal(other, vec![]).unwrap();
        assert!(db
            .reserve_utxo(&subaccount.owner, other, &SpendPolicy::default())
            .unwrap()
            .is_none());

        db.cancel_proposal(&id).unwrap();
        let reclaimed = db
            .reserve_utxo(&subaccount.owner, other, &SpendPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.outpoint, reserved.outpoint);
    }

    #[test]
    fn test_reservation_before_proposal_record_is_released_on_cancel() {
        let (db, subaccount, external) = setup();
        db.add_confirmed_outputs(external, position(10), 0, &[(0, 0)], &tx(1, &[500]))
            .unwrap();

        // Reserve first, create the proposal record second.
        let id = ProposalId([7; 32]);
        let reserved = db
            .reserve_utxo(&subaccount.owner, id, &SpendPolicy::default())
            .unwrap()
            .unwrap();
        db.add_proposal(id, vec![]).unwrap();
        assert_eq!(
            db.load_proposal(&id).unwrap().unwrap().reserved,
            vec![reserved.outpoint]
        );

        db.cancel_proposal(&id).unwrap();
        assert_eq!(
            db.get_output(&reserved.outpoint).unwrap().unwrap().reserved_by,
            None
        );
        let other = ProposalId([8; 32]);
        db.add_proposal(other, vec![]).unwrap();
        let reclaimed = db
            .reserve_utxo(&subaccount.owner, other, &SpendPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.outpoint, reserved.outpoint);
    }

    #[test]
    fn test_stale_result_after_rollback_rejected() {
        let (db, _, external) = setup();
        let t = tx(1, &[500]);
        db.advance_tip(position(11)).unwrap();
        db.add_confirmed_outputs(external, position(11), 0, &[(0, 0)], &t)
            .unwrap();
        db.set_scan_position(external, position(11)).unwrap();

        let chain = StaticChain {
            hashes: HashMap::from([(10, block(10))]),
            txs: vec![],
        };
        db.finalize_reorg(&chain, &[position(11)]).unwrap();
        assert_eq!(db.balance().unwrap().confirmed, Amount(0));

        // Re-delivering the invalidated block does not resurrect it.
        let err = db
            .add_confirmed_outputs(external, position(11), 0, &[(0, 0)], &t)
            .unwrap_err();
        assert!(matches!(err, WalletDbError::StaleScanResult { .. }));
        let err = db.set_scan_position(external, position(11)).unwrap_err();
        assert!(matches!(err, WalletDbError::StaleScanResult { .. }));
        assert_eq!(db.balance().unwrap().confirmed, Amount(0));

        // The replacement block at the same height is accepted once the
        // tip records it.
        let replacement = BlockPosition::new(11, block(0xB1));
        db.advance_tip(replacement).unwrap();
        db.add_confirmed_outputs(external, replacement, 0, &[(0, 0)], &t)
            .unwrap();
        assert_eq!(db.balance().unwrap().confirmed, Amount(500));
    }

    #[test]
    fn test_advance_tip_monotonic() {
        let (db, _, _) = setup();
        db.advance_tip(position(10)).unwrap();
        db.advance_tip(position(10)).unwrap();
        db.advance_tip(position(12)).unwrap();
        let err = db.advance_tip(position(11)).unwrap_err();
        assert!(matches!(err, WalletDbError::TipOutOfOrder { .. }));
        assert_eq!(db.chain_tip().unwrap().unwrap().height, 12);
    }

    #[test]
    fn test_finalize_reorg_rolls_everything_back() {
        let (db, _, external) = setup();
        let t1 = tx(1, &[500]);
        db.add_confirmed_outputs(external, position(10), 0, &[(0, 0)], &t1)
            .unwrap();
        let t2 = tx(2, &[300]);
        db.add_confirmed_outputs(external, position(11), 0, &[(0, 1)], &t2)
            .unwrap();
        db.set_scan_position(external, position(11)).unwrap();
        db.advance_tip(position(11)).unwrap();

        // Blocks 11 and 10 fork away; t1 survives in the mempool, t2 is gone.
        let chain = StaticChain {
            hashes: HashMap::from([(9, block(9))]),
            txs: vec![t1.txid],
        };
        let summary = db
            .finalize_reorg(&chain, &[position(10), position(11)])
            .unwrap();
        assert_eq!(summary.last_good.height, 9);
        assert_eq!(summary.reverted_outputs, 2);
        assert_eq!(summary.rolled_back_subchains, vec![external]);

        assert_eq!(db.chain_tip().unwrap().unwrap().height, 9);
        assert_eq!(db.last_scanned(&external).unwrap().unwrap().height, 9);
        let surviving = db
            .get_output(&Outpoint::new(t1.txid, 0))
            .unwrap()
            .unwrap();
        assert_eq!(surviving.state, OutputState::ImmatureIncoming);
        let orphaned = db
            .get_output(&Outpoint::new(t2.txid, 0))
            .unwrap()
            .unwrap();
        assert_eq!(orphaned.state, OutputState::Orphaned);
        assert_eq!(db.balance().unwrap().confirmed, Amount(0));
        assert_eq!(db.balance().unwrap().unconfirmed, Amount(500));

        // Tip can advance again after the rollback.
        db.advance_tip(position(10)).unwrap();
    }

    #[test]
    fn test_finalize_reorg_requires_known_fork_point() {
        let (db, _, external) = setup();
        db.add_confirmed_outputs(external, position(10), 0, &[(0, 0)], &tx(1, &[500]))
            .unwrap();

        let chain = StaticChain {
            hashes: HashMap::new(),
            txs: vec![],
        };
        let err = db.finalize_reorg(&chain, &[position(10)]).unwrap_err();
        assert!(matches!(err, WalletDbError::ReorgIncomplete(_)));
        // Nothing moved.
        assert_eq!(db.balance().unwrap().confirmed, Amount(500));
    }
}
