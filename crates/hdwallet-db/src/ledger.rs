//! The UTXO ledger: every output the wallet has ever observed, its spend
//! state, and balance aggregation.
//!
//! Output records are never hard-deleted. Confirmation, spending, reservation,
//! and reorg rollback only move a record through the spend-state machine; the
//! full history stays queryable.
//!
//! Per-owner balances are kept in a cache that is recomputed from the record
//! set on every mutation touching that owner, so the cache is consistent with
//! the records by construction.

use crate::policy::{self, SpendPolicy};
use crate::storage::ChangeSet;
use hdwallet_types::{
    Amount, BlockPosition, ContactId, KeyRef, NymId, Outpoint, ProposalId, Subaccount,
    SubaccountId, Subchain, Txid, WalletTx,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

pub(crate) const RECORD_VERSION: u32 = 1;

/// Spend state of a single output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputState {
    /// Observed in the mempool, not yet mined.
    ImmatureIncoming,
    /// Mined on the best chain and not spent.
    ConfirmedUnspent,
    /// An outgoing transaction spending it has been broadcast but not
    /// confirmed.
    UnconfirmedSpend,
    /// The spending transaction is confirmed. Terminal in practice.
    ConfirmedSpent,
    /// The containing block was invalidated by a reorg and the transaction is
    /// gone from the new best chain.
    Orphaned,
}

impl OutputState {
    /// Whether the output contributes to balance, and to which column.
    pub fn balance_column(&self) -> Option<BalanceColumn> {
        match self {
            OutputState::ConfirmedUnspent => Some(BalanceColumn::Confirmed),
            OutputState::ImmatureIncoming => Some(BalanceColumn::Unconfirmed),
            _ => None,
        }
    }

    /// Whether the output is eligible for reservation by a proposal.
    pub fn reservable(&self) -> bool {
        matches!(self, OutputState::ConfirmedUnspent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceColumn {
    Confirmed,
    Unconfirmed,
}

/// Descriptive tags attached to output records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OutputTag {
    /// Received on an external subchain.
    Incoming,
    /// Received on an internal (change) subchain.
    Change,
    /// Created by a generation (coinbase-like) transaction.
    Generation,
}

/// A confirmed/unconfirmed balance pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

impl Balance {
    fn add(&mut self, column: BalanceColumn, value: Amount) {
        let slot = match column {
            BalanceColumn::Confirmed => &mut self.confirmed,
            BalanceColumn::Unconfirmed => &mut self.unconfirmed,
        };
        *slot = match slot.checked_add(value) {
            Some(sum) => sum,
            None => {
                log::warn!("balance overflow adding {}, saturating", value);
                Amount(u64::MAX)
            }
        };
    }

    fn merge(&mut self, other: &Balance) {
        self.add(BalanceColumn::Confirmed, other.confirmed);
        self.add(BalanceColumn::Unconfirmed, other.unconfirmed);
    }
}

/// Persisted record for one output. Keyed by outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub version: u32,
    pub outpoint: Outpoint,
    pub value: Amount,
    /// The derived key this output pays to.
    pub key: KeyRef,
    /// The nym owning the subaccount; balances are isolated per owner.
    pub owner: NymId,
    pub state: OutputState,
    pub tags: BTreeSet<OutputTag>,
    /// Mined position, if confirmed.
    pub position: Option<BlockPosition>,
    /// Index of the containing transaction within its block, if confirmed.
    pub block_index: Option<u32>,
    /// Opaque payer/payee contact reference.
    pub contact: Option<ContactId>,
    /// Active proposal holding this output, if reserved.
    pub reserved_by: Option<ProposalId>,
    /// Transaction spending this output, once broadcast or confirmed.
    pub spending_tx: Option<Txid>,
    /// Position the spending transaction confirmed at.
    pub spent_position: Option<BlockPosition>,
}

impl OutputRecord {
    pub fn new_confirmed(
        outpoint: Outpoint,
        value: Amount,
        key: KeyRef,
        owner: NymId,
        position: BlockPosition,
        block_index: Option<u32>,
        contact: Option<ContactId>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            outpoint,
            value,
            key,
            owner,
            state: OutputState::ConfirmedUnspent,
            tags: BTreeSet::new(),
            position: Some(position),
            block_index,
            contact,
            reserved_by: None,
            spending_tx: None,
            spent_position: None,
        }
    }

    pub fn new_mempool(
        outpoint: Outpoint,
        value: Amount,
        key: KeyRef,
        owner: NymId,
        contact: Option<ContactId>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            outpoint,
            value,
            key,
            owner,
            state: OutputState::ImmatureIncoming,
            tags: BTreeSet::new(),
            position: None,
            block_index: None,
            contact,
            reserved_by: None,
            spending_tx: None,
            spent_position: None,
        }
    }
}

/// Filter for [`OutputLedger::get_outputs`].
#[derive(Debug, Clone, Default)]
pub struct OutputQuery {
    pub states: Option<Vec<OutputState>>,
    pub owner: Option<NymId>,
    pub subaccount: Option<SubaccountId>,
    pub key: Option<KeyRef>,
}

impl OutputQuery {
    pub fn by_state(state: OutputState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Default::default()
        }
    }

    fn matches(&self, record: &OutputRecord) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&record.state) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if record.owner != *owner {
                return false;
            }
        }
        if let Some(subaccount) = &self.subaccount {
            if record.key.subaccount != *subaccount {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if record.key != *key {
                return false;
            }
        }
        true
    }
}

/// Result of applying a confirmed transaction.
#[derive(Debug, Default)]
pub(crate) struct ConfirmOutcome {
    /// False when an output index did not resolve; the caller reports a
    /// non-fatal failure.
    pub applied: bool,
    /// Proposals whose reserved outputs were all confirmed spent by this
    /// transaction.
    pub completed: Vec<ProposalId>,
}

/// Result of rolling back one invalidated block.
#[derive(Debug, Default)]
pub(crate) struct RollbackOutcome {
    pub reverted: usize,
    /// Completed proposals whose completing spend was un-confirmed and must
    /// return to the active set.
    pub reactivate: Vec<ProposalId>,
}

/// In-memory output set plus the per-owner balance cache.
#[derive(Debug, Default)]
pub struct OutputLedger {
    outputs: HashMap<Outpoint, OutputRecord>,
    balances: HashMap<NymId, Balance>,
}

impl OutputLedger {
    // ── Planning ─────────────────────────────────────────────────────────

    /// Stage application of a confirmed transaction's outputs and inputs.
    ///
    /// `outputs` pairs each relevant vout index with the derivation index
    /// that matched it. Idempotent per (txid, position): reapplying the same
    /// confirmed block stages nothing.
    pub(crate) fn plan_add_confirmed(
        &self,
        subaccount: &Subaccount,
        subchain: Subchain,
        position: BlockPosition,
        block_index: u32,
        outputs: &[(u32, u32)],
        tx: &WalletTx,
        cs: &mut ChangeSet,
    ) -> ConfirmOutcome {
        let mut outcome = ConfirmOutcome {
            applied: true,
            completed: Vec::new(),
        };

        for (vout, derivation) in outputs {
            let outpoint = match tx.outpoint(*vout) {
                Some(op) => op,
                None => {
                    log::warn!(
                        "confirmed output index {} out of range for tx {}",
                        vout,
                        tx.txid
                    );
                    outcome.applied = false;
                    continue;
                }
            };
            let txout = &tx.outputs[*vout as usize];

            match self.outputs.get(&outpoint) {
                // Already applied at this position: reapplying a confirmed
                // block must not double-count.
                Some(existing) if existing.position == Some(position) => continue,
                // Mempool promotion, or re-confirmation on the new best
                // chain after a reorg.
                Some(existing)
                    if matches!(
                        existing.state,
                        OutputState::ImmatureIncoming | OutputState::Orphaned
                    ) =>
                {
                    let mut updated = existing.clone();
                    updated.state = OutputState::ConfirmedUnspent;
                    updated.position = Some(position);
                    updated.block_index = Some(block_index);
                    cs.outputs.push(updated);
                }
                Some(existing) => {
                    log::warn!(
                        "output {} re-confirmed at {} while {:?} at {:?}; ignoring",
                        outpoint,
                        position,
                        existing.state,
                        existing.position
                    );
                }
                None => {
                    let mut record = OutputRecord::new_confirmed(
                        outpoint,
                        txout.value,
                        KeyRef::new(subaccount.id, subchain, *derivation),
                        subaccount.owner,
                        position,
                        Some(block_index),
                        txout.contact,
                    );
                    record.tags = tags_for(subchain, tx);
                    cs.outputs.push(record);
                }
            }
        }

        // Inputs consuming wallet outputs: confirmed spends.
        for input in &tx.inputs {
            if let Some(existing) = self.outputs.get(input) {
                if existing.state == OutputState::ConfirmedSpent
                    && existing.spending_tx == Some(tx.txid)
                {
                    continue;
                }
                if let Some(other) = existing.spending_tx {
                    if other != tx.txid {
                        log::warn!(
                            "output {} spend superseded: {} replaces {}",
                            input,
                            tx.txid,
                            other
                        );
                    }
                }
                let mut updated = existing.clone();
                updated.state = OutputState::ConfirmedSpent;
                updated.spending_tx = Some(tx.txid);
                updated.spent_position = Some(position);
                if let Some(proposal) = updated.reserved_by {
                    outcome.completed.push(proposal);
                }
                cs.outputs.push(updated);
            }
        }

        outcome
    }

    /// Stage application of a mempool transaction. Same shape as
    /// [`plan_add_confirmed`] minus the block position.
    pub(crate) fn plan_add_mempool(
        &self,
        subaccount: &Subaccount,
        subchain: Subchain,
        outputs: &[(u32, u32)],
        tx: &WalletTx,
        cs: &mut ChangeSet,
    ) -> bool {
        let mut applied = true;

        for (vout, derivation) in outputs {
            let outpoint = match tx.outpoint(*vout) {
                Some(op) => op,
                None => {
                    log::warn!(
                        "mempool output index {} out of range for tx {}",
                        vout,
                        tx.txid
                    );
                    applied = false;
                    continue;
                }
            };
            // A record in any state means the output was already observed;
            // a mempool sighting never downgrades it.
            if self.outputs.contains_key(&outpoint) {
                continue;
            }
            let txout = &tx.outputs[*vout as usize];
            let mut record = OutputRecord::new_mempool(
                outpoint,
                txout.value,
                KeyRef::new(subaccount.id, subchain, *derivation),
                subaccount.owner,
                txout.contact,
            );
            record.tags = tags_for(subchain, tx);
            cs.outputs.push(record);
        }

        for input in &tx.inputs {
            if let Some(existing) = self.outputs.get(input) {
                if matches!(
                    existing.state,
                    OutputState::ConfirmedUnspent | OutputState::ImmatureIncoming
                ) {
                    let mut updated = existing.clone();
                    updated.state = OutputState::UnconfirmedSpend;
                    updated.spending_tx = Some(tx.txid);
                    cs.outputs.push(updated);
                }
            }
        }

        applied
    }

    /// Stage a reservation of one eligible output for `proposal`, chosen by
    /// `policy`. Returns `None` when nothing is eligible; this is a normal
    /// outcome the caller handles by waiting or failing the proposal.
    pub(crate) fn plan_reserve(
        &self,
        spender: &NymId,
        proposal: ProposalId,
        policy: &SpendPolicy,
        cs: &mut ChangeSet,
    ) -> Option<OutputRecord> {
        let candidates: Vec<&OutputRecord> = self
            .outputs
            .values()
            .filter(|r| r.owner == *spender && r.state.reservable() && r.reserved_by.is_none())
            .collect();

        let selected = policy::select_one(&candidates, policy)?;
        let mut updated = selected.clone();
        updated.reserved_by = Some(proposal);
        cs.outputs.push(updated.clone());
        Some(updated)
    }

    /// Stage release of `proposal`'s reservations on the given outpoints.
    ///
    /// A reserved-but-unspent output returns to `ConfirmedUnspent`; a
    /// broadcast-but-unconfirmed spend is rolled back to unspent; a confirmed
    /// spend keeps its state and only drops the reservation marker.
    pub(crate) fn plan_release(
        &self,
        outpoints: &[Outpoint],
        proposal: &ProposalId,
        cs: &mut ChangeSet,
    ) {
        for outpoint in outpoints {
            let existing = match self.outputs.get(outpoint) {
                Some(r) if r.reserved_by.as_ref() == Some(proposal) => r,
                _ => continue,
            };
            let mut updated = existing.clone();
            updated.reserved_by = None;
            if updated.state == OutputState::UnconfirmedSpend {
                updated.state = OutputState::ConfirmedUnspent;
                updated.spending_tx = None;
            }
            cs.outputs.push(updated);
        }
    }

    /// Stage the broadcast of a spend: the proposal's reserved outputs become
    /// `UnconfirmedSpend` with `txid` attached.
    pub(crate) fn plan_mark_spending(
        &self,
        outpoints: &[Outpoint],
        proposal: &ProposalId,
        txid: Txid,
        cs: &mut ChangeSet,
    ) {
        for outpoint in outpoints {
            match self.outputs.get(outpoint) {
                Some(r) if r.reserved_by.as_ref() == Some(proposal) => {
                    let mut updated = r.clone();
                    updated.state = OutputState::UnconfirmedSpend;
                    updated.spending_tx = Some(txid);
                    cs.outputs.push(updated);
                }
                _ => log::warn!(
                    "outgoing tx {} references outpoint {} not reserved by {}",
                    txid,
                    outpoint,
                    proposal
                ),
            }
        }
    }

    /// Stage reversion of every record touched by the invalidated block at
    /// `position`.
    ///
    /// `tx_exists` reports whether a transaction still exists on the new best
    /// chain (or its mempool); if not, outputs it created become `Orphaned`.
    pub(crate) fn plan_rollback_block(
        &self,
        position: &BlockPosition,
        tx_exists: &dyn Fn(&Txid) -> bool,
        cs: &mut ChangeSet,
    ) -> RollbackOutcome {
        self.plan_rollback_chain(&[*position], tx_exists, cs)
    }

    /// Stage reversion across a run of invalidated blocks, given in
    /// descending height order.
    ///
    /// Blocks must be processed newest-first so an output mined in one
    /// invalidated block and spent in a later one has its spend reverted
    /// before its confirmation; the overlay carries each record's partial
    /// reversion between blocks so only the final form is staged.
    pub(crate) fn plan_rollback_chain(
        &self,
        invalidated: &[BlockPosition],
        tx_exists: &dyn Fn(&Txid) -> bool,
        cs: &mut ChangeSet,
    ) -> RollbackOutcome {
        let mut outcome = RollbackOutcome::default();
        let mut overlay: HashMap<Outpoint, OutputRecord> = HashMap::new();

        for position in invalidated {
            for record in self.outputs.values() {
                let current = overlay.get(&record.outpoint).unwrap_or(record);

                // Outputs mined in the invalidated block.
                if current.position == Some(*position) {
                    let mut updated = current.clone();
                    updated.position = None;
                    updated.block_index = None;
                    updated.state = if !tx_exists(&updated.outpoint.txid) {
                        OutputState::Orphaned
                    } else if updated.spending_tx.is_some() {
                        // A still-pending spend of the now-unconfirmed output.
                        OutputState::UnconfirmedSpend
                    } else {
                        OutputState::ImmatureIncoming
                    };
                    outcome.reverted += 1;
                    overlay.insert(updated.outpoint, updated);
                    continue;
                }

                // Outputs whose spend confirmed in the invalidated block.
                if current.spent_position == Some(*position) {
                    let mut updated = current.clone();
                    updated.spent_position = None;
                    let spending = updated.spending_tx;
                    if spending.map(|txid| tx_exists(&txid)).unwrap_or(false) {
                        updated.state = OutputState::UnconfirmedSpend;
                    } else {
                        updated.state = OutputState::ConfirmedUnspent;
                        updated.spending_tx = None;
                    }
                    if let Some(proposal) = updated.reserved_by {
                        outcome.reactivate.push(proposal);
                    }
                    outcome.reverted += 1;
                    overlay.insert(updated.outpoint, updated);
                }
            }
        }

        let mut staged: Vec<OutputRecord> = overlay.into_values().collect();
        staged.sort_by_key(|r| r.outpoint);
        cs.outputs.extend(staged);
        outcome
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get_output(&self, outpoint: &Outpoint) -> Option<&OutputRecord> {
        self.outputs.get(outpoint)
    }

    pub fn get_outputs(&self, query: &OutputQuery) -> Vec<OutputRecord> {
        let mut results: Vec<OutputRecord> = self
            .outputs
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        results.sort_by_key(|r| r.outpoint);
        results
    }

    /// Total balance across all owners.
    pub fn balance(&self) -> Balance {
        let mut total = Balance::default();
        for balance in self.balances.values() {
            total.merge(balance);
        }
        total
    }

    /// Balance for a single owner, from the maintained cache.
    pub fn balance_for_owner(&self, owner: &NymId) -> Balance {
        self.balances.get(owner).copied().unwrap_or_default()
    }

    /// Balance for one subaccount of an owner.
    pub fn balance_for_subaccount(&self, owner: &NymId, subaccount: &SubaccountId) -> Balance {
        self.filtered_balance(|r| r.owner == *owner && r.key.subaccount == *subaccount)
    }

    /// Balance attributable to a single derived key.
    pub fn balance_for_key(&self, key: &KeyRef) -> Balance {
        self.filtered_balance(|r| r.key == *key)
    }

    /// Outpoints currently reserved under `proposal`, ordered.
    ///
    /// The record markers are the source of truth here, so reservations made
    /// before the proposal record existed are still found.
    pub(crate) fn reserved_by(&self, proposal: &ProposalId) -> Vec<Outpoint> {
        let mut held: Vec<Outpoint> = self
            .outputs
            .values()
            .filter(|r| r.reserved_by.as_ref() == Some(proposal))
            .map(|r| r.outpoint)
            .collect();
        held.sort();
        held
    }

    fn filtered_balance(&self, filter: impl Fn(&OutputRecord) -> bool) -> Balance {
        let mut balance = Balance::default();
        for record in self.outputs.values().filter(|r| filter(r)) {
            if let Some(column) = record.state.balance_column() {
                balance.add(column, record.value);
            }
        }
        balance
    }

    // ── Application (post-commit, infallible) ────────────────────────────

    pub(crate) fn apply(&mut self, records: &[OutputRecord]) {
        let mut touched: HashSet<NymId> = HashSet::new();
        for record in records {
            touched.insert(record.owner);
            if let Some(old) = self.outputs.insert(record.outpoint, record.clone()) {
                touched.insert(old.owner);
            }
        }
        for owner in touched {
            self.recompute_balance(&owner);
        }
    }

    /// Deterministically recompute one owner's balance from the record set.
    fn recompute_balance(&mut self, owner: &NymId) {
        let balance = self.filtered_balance(|r| r.owner == *owner);
        self.balances.insert(*owner, balance);
    }
}

fn tags_for(subchain: Subchain, tx: &WalletTx) -> BTreeSet<OutputTag> {
    let mut tags = BTreeSet::new();
    tags.insert(match subchain {
        Subchain::External => OutputTag::Incoming,
        Subchain::Internal => OutputTag::Change,
    });
    if tx.inputs.is_empty() {
        tags.insert(OutputTag::Generation);
    }
    tags
}
