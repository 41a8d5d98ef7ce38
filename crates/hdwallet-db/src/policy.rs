//! UTXO selection policies for proposal construction.
//!
//! A policy picks exactly one eligible output per reservation call; callers
//! loop until the proposal is funded or nothing eligible remains. Strategies
//! aim either for an exact fit (fewer inputs, less change) or for simple
//! largest-first accumulation.

use crate::ledger::OutputRecord;
use hdwallet_types::Amount;
use serde::{Deserialize, Serialize};

/// Available selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Default: an output exactly matching the target if one exists, else the
    /// smallest single output covering it, else largest-first.
    ExactOrLargest,
    /// Always the largest eligible output.
    LargestFirst,
    /// The oldest output by mined height (consolidates early coins first).
    Oldest,
    /// Uniformly random among eligible outputs.
    Random,
}

/// Caller-supplied selection policy for [`reserve`] calls.
///
/// `target` is the amount still needed by the proposal; strategies use it to
/// prefer a close fit. Without a target, fit-based strategies degrade to
/// largest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendPolicy {
    pub strategy: SelectionStrategy,
    pub target: Option<Amount>,
}

impl Default for SpendPolicy {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::ExactOrLargest,
            target: None,
        }
    }
}

impl SpendPolicy {
    pub fn with_target(strategy: SelectionStrategy, target: Amount) -> Self {
        Self {
            strategy,
            target: Some(target),
        }
    }
}

/// Select one output from `candidates` according to `policy`.
///
/// Ties break on outpoint ordering so selection is deterministic for the
/// non-random strategies.
pub(crate) fn select_one<'a>(
    candidates: &[&'a OutputRecord],
    policy: &SpendPolicy,
) -> Option<&'a OutputRecord> {
    if candidates.is_empty() {
        return None;
    }

    match policy.strategy {
        SelectionStrategy::LargestFirst => largest(candidates),
        SelectionStrategy::ExactOrLargest => match policy.target {
            Some(target) => {
                // Exact fit first, then the smallest output that covers the
                // target on its own, then largest-first accumulation.
                exact_match(candidates, target)
                    .or_else(|| smallest_covering(candidates, target))
                    .or_else(|| largest(candidates))
            }
            None => largest(candidates),
        },
        SelectionStrategy::Oldest => candidates
            .iter()
            .min_by_key(|r| {
                (
                    r.position.map(|p| p.height).unwrap_or(u64::MAX),
                    r.outpoint,
                )
            })
            .copied(),
        SelectionStrategy::Random => {
            use rand::seq::SliceRandom;
            candidates.choose(&mut rand::thread_rng()).copied()
        }
    }
}

fn largest<'a>(candidates: &[&'a OutputRecord]) -> Option<&'a OutputRecord> {
    candidates
        .iter()
        .max_by_key(|r| (r.value, std::cmp::Reverse(r.outpoint)))
        .copied()
}

fn exact_match<'a>(
    candidates: &[&'a OutputRecord],
    target: Amount,
) -> Option<&'a OutputRecord> {
    candidates
        .iter()
        .filter(|r| r.value == target)
        .min_by_key(|r| r.outpoint)
        .copied()
}

fn smallest_covering<'a>(
    candidates: &[&'a OutputRecord],
    target: Amount,
) -> Option<&'a OutputRecord> {
    candidates
        .iter()
        .filter(|r| r.value >= target)
        .min_by_key(|r| (r.value, r.outpoint))
        .copied()
}
