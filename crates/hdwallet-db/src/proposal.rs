//! Pending spend proposals.
//!
//! A proposal reserves a set of outpoints and carries an opaque serialized
//! description of the outputs the spend intends to create. At most one active
//! proposal may hold a given outpoint; that invariant is enforced together
//! with the ledger under the coordinator's write lock.

use crate::error::WalletDbError;
use crate::storage::ChangeSet;
use hdwallet_types::{Outpoint, ProposalId, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Created and holding reservations; may have been broadcast.
    Active,
    /// The broadcast transaction confirmed and was recorded.
    Completed,
    /// Explicitly aborted, or timed out by a higher-level policy.
    Cancelled,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Completed | ProposalStatus::Cancelled)
    }
}

/// Persisted proposal. Keyed by the caller-supplied id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub version: u32,
    pub id: ProposalId,
    /// Opaque serialized description of the intended outputs; schema owned by
    /// the external serialization layer.
    pub description: Vec<u8>,
    /// Outpoints reserved under this proposal, in reservation order.
    pub reserved: Vec<Outpoint>,
    /// Unix seconds at creation.
    pub created_at: u64,
    pub status: ProposalStatus,
    /// The broadcast transaction, once known.
    pub spending_tx: Option<Txid>,
}

/// In-memory proposal set.
#[derive(Debug, Default)]
pub struct ProposalBook {
    proposals: HashMap<ProposalId, ProposalRecord>,
}

impl ProposalBook {
    // ── Planning ─────────────────────────────────────────────────────────

    /// Stage creation of a proposal.
    ///
    /// `reserved` carries any outpoints already reserved under this id before
    /// the proposal record was created. Fails with `DuplicateProposal` when
    /// an active proposal with this id exists; a terminal record of the same
    /// id may be replaced.
    pub(crate) fn plan_add(
        &self,
        id: ProposalId,
        description: Vec<u8>,
        reserved: Vec<Outpoint>,
        cs: &mut ChangeSet,
    ) -> Result<(), WalletDbError> {
        if let Some(existing) = self.proposals.get(&id) {
            if !existing.status.is_terminal() {
                return Err(WalletDbError::DuplicateProposal(id));
            }
        }

        cs.proposals.push(ProposalRecord {
            version: RECORD_VERSION,
            id,
            description,
            reserved,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            status: ProposalStatus::Active,
            spending_tx: None,
        });
        Ok(())
    }

    /// Stage attachment of a newly reserved outpoint to an active proposal.
    /// A missing record is fine: the reservation precedes `add_proposal`.
    pub(crate) fn plan_attach(&self, id: &ProposalId, outpoint: Outpoint, cs: &mut ChangeSet) {
        if let Some(existing) = self.proposals.get(id) {
            if existing.status == ProposalStatus::Active && !existing.reserved.contains(&outpoint)
            {
                let mut updated = existing.clone();
                updated.reserved.push(outpoint);
                cs.proposals.push(updated);
            }
        }
    }

    /// Stage cancellation. Idempotent: a missing or already-terminal proposal
    /// stages nothing and releases nothing.
    pub(crate) fn plan_cancel(&self, id: &ProposalId, cs: &mut ChangeSet) -> Vec<Outpoint> {
        match self.proposals.get(id) {
            Some(existing) if existing.status == ProposalStatus::Active => {
                let mut updated = existing.clone();
                updated.status = ProposalStatus::Cancelled;
                cs.proposals.push(updated);
                existing.reserved.clone()
            }
            _ => Vec::new(),
        }
    }

    /// Stage the broadcast transaction id on an active proposal.
    pub(crate) fn plan_set_spending(
        &self,
        id: &ProposalId,
        txid: Txid,
        cs: &mut ChangeSet,
    ) -> Result<Vec<Outpoint>, WalletDbError> {
        let existing = self
            .proposals
            .get(id)
            .filter(|p| p.status == ProposalStatus::Active)
            .ok_or(WalletDbError::UnknownProposal(*id))?;
        let mut updated = existing.clone();
        updated.spending_tx = Some(txid);
        cs.proposals.push(updated);
        Ok(existing.reserved.clone())
    }

    /// Stage completion of an active proposal whose spend confirmed.
    pub(crate) fn plan_complete(&self, id: &ProposalId, cs: &mut ChangeSet) {
        if let Some(existing) = self.proposals.get(id) {
            if existing.status != ProposalStatus::Completed {
                let mut updated = existing.clone();
                updated.status = ProposalStatus::Completed;
                cs.proposals.push(updated);
            }
        }
    }

    /// Stage reactivation of a completed proposal whose confirming block was
    /// invalidated by a reorg.
    pub(crate) fn plan_reactivate(&self, id: &ProposalId, cs: &mut ChangeSet) {
        if let Some(existing) = self.proposals.get(id) {
            if existing.status == ProposalStatus::Completed {
                let mut updated = existing.clone();
                updated.status = ProposalStatus::Active;
                cs.proposals.push(updated);
            }
        }
    }

    /// Stage removal of terminal proposals from the active index.
    ///
    /// Returns the outpoints still carrying reservations under the forgotten
    /// ids so the ledger can release them. Fails with `ProposalStillActive`
    /// if any id is not terminal; unknown ids are skipped.
    pub(crate) fn plan_forget(
        &self,
        ids: &[ProposalId],
        cs: &mut ChangeSet,
    ) -> Result<Vec<(ProposalId, Vec<Outpoint>)>, WalletDbError> {
        let mut released = Vec::new();
        for id in ids {
            match self.proposals.get(id) {
                Some(existing) if !existing.status.is_terminal() => {
                    return Err(WalletDbError::ProposalStillActive(*id));
                }
                Some(existing) => {
                    cs.forgotten_proposals.push(*id);
                    released.push((*id, existing.reserved.clone()));
                }
                None => {}
            }
        }
        Ok(released)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn load(&self, id: &ProposalId) -> Option<&ProposalRecord> {
        self.proposals.get(id)
    }

    pub fn load_all(&self) -> Vec<&ProposalRecord> {
        let mut all: Vec<&ProposalRecord> = self.proposals.values().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn exists(&self, id: &ProposalId) -> bool {
        self.proposals.contains_key(id)
    }

    pub fn completed(&self) -> BTreeSet<ProposalId> {
        self.proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Completed)
            .map(|p| p.id)
            .collect()
    }

    /// Proposals completed by `txid`, for reorg reactivation.
    pub(crate) fn completed_by_tx(&self, txid: &Txid) -> Vec<ProposalId> {
        self.proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Completed && p.spending_tx == Some(*txid))
            .map(|p| p.id)
            .collect()
    }

    // ── Application (post-commit, infallible) ────────────────────────────

    pub(crate) fn apply(&mut self, records: &[ProposalRecord], forgotten: &[ProposalId]) {
        for record in records {
            self.proposals.insert(record.id, record.clone());
        }
        for id in forgotten {
            self.proposals.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ProposalId {
        ProposalId([n; 32])
    }

    fn outpoint(n: u8) -> Outpoint {
        Outpoint::new(Txid([n; 32]), 0)
    }

    fn apply(book: &mut ProposalBook, cs: &ChangeSet) {
        book.apply(&cs.proposals, &cs.forgotten_proposals);
    }

    #[test]
    fn test_add_and_load_roundtrip() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), b"outputs-v1".to_vec(), vec![outpoint(9)], &mut cs)
            .unwrap();
        apply(&mut book, &cs);

        let loaded = book.load(&id(1)).unwrap();
        assert_eq!(loaded.description, b"outputs-v1");
        assert_eq!(loaded.reserved, vec![outpoint(9)]);
        assert_eq!(loaded.status, ProposalStatus::Active);
    }

    #[test]
    fn test_duplicate_active_rejected() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), b"first".to_vec(), vec![], &mut cs).unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        let err = book
            .plan_add(id(1), b"second".to_vec(), vec![], &mut cs)
            .unwrap_err();
        assert!(matches!(err, WalletDbError::DuplicateProposal(_)));
        // Original description unchanged.
        assert_eq!(book.load(&id(1)).unwrap().description, b"first");
    }

    #[test]
    fn test_terminal_id_may_be_reused() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), b"first".to_vec(), vec![], &mut cs).unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_cancel(&id(1), &mut cs);
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_add(id(1), b"second".to_vec(), vec![], &mut cs).unwrap();
        apply(&mut book, &cs);
        assert_eq!(book.load(&id(1)).unwrap().description, b"second");
    }

    #[test]
    fn test_cancel_idempotent() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), vec![], vec![outpoint(1), outpoint(2)], &mut cs)
            .unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        let released = book.plan_cancel(&id(1), &mut cs);
        apply(&mut book, &cs);
        assert_eq!(released, vec![outpoint(1), outpoint(2)]);

        // Second cancel is a no-op.
        let mut cs = ChangeSet::default();
        assert!(book.plan_cancel(&id(1), &mut cs).is_empty());
        assert!(cs.proposals.is_empty());

        // Unknown id is a no-op too.
        let mut cs = ChangeSet::default();
        assert!(book.plan_cancel(&id(99), &mut cs).is_empty());
    }

    #[test]
    fn test_forget_requires_terminal() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), vec![], vec![], &mut cs).unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        let err = book.plan_forget(&[id(1)], &mut cs).unwrap_err();
        assert!(matches!(err, WalletDbError::ProposalStillActive(_)));

        let mut cs = ChangeSet::default();
        book.plan_cancel(&id(1), &mut cs);
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_forget(&[id(1)], &mut cs).unwrap();
        apply(&mut book, &cs);
        assert!(!book.exists(&id(1)));
        assert!(book.load(&id(1)).is_none());
    }

    #[test]
    fn test_completed_tracking() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), vec![], vec![outpoint(1)], &mut cs).unwrap();
        book.plan_add(id(2), vec![], vec![outpoint(2)], &mut cs).unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_set_spending(&id(1), Txid([5; 32]), &mut cs).unwrap();
        apply(&mut book, &cs);
        let mut cs = ChangeSet::default();
        book.plan_complete(&id(1), &mut cs);
        apply(&mut book, &cs);

        assert_eq!(book.completed().len(), 1);
        assert!(book.completed().contains(&id(1)));
        assert_eq!(book.completed_by_tx(&Txid([5; 32])), vec![id(1)]);
    }

    #[test]
    fn test_reactivate_completed() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), vec![], vec![], &mut cs).unwrap();
        apply(&mut book, &cs);
        let mut cs = ChangeSet::default();
        book.plan_complete(&id(1), &mut cs);
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_reactivate(&id(1), &mut cs);
        apply(&mut book, &cs);
        assert_eq!(book.load(&id(1)).unwrap().status, ProposalStatus::Active);
    }

    #[test]
    fn test_set_spending_unknown_proposal() {
        let book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        let err = book
            .plan_set_spending(&id(1), Txid([5; 32]), &mut cs)
            .unwrap_err();
        assert!(matches!(err, WalletDbError::UnknownProposal(_)));
    }

    #[test]
    fn test_attach_reservation() {
        let mut book = ProposalBook::default();
        let mut cs = ChangeSet::default();
        book.plan_add(id(1), vec![], vec![outpoint(1)], &mut cs).unwrap();
        apply(&mut book, &cs);

        let mut cs = ChangeSet::default();
        book.plan_attach(&id(1), outpoint(2), &mut cs);
        apply(&mut book, &cs);
        assert_eq!(
            book.load(&id(1)).unwrap().reserved,
            vec![outpoint(1), outpoint(2)]
        );

        // Attaching the same outpoint again is a no-op.
        let mut cs = ChangeSet::default();
        book.plan_attach(&id(1), outpoint(2), &mut cs);
        assert!(cs.proposals.is_empty());
    }
}
