//! Round observability hooks
//!
//! The engine reports prefill, every decode round and every finished slot
//! to a [`RoundObserver`]. [`TracingObserver`] turns them into structured
//! `tracing` events and is installed by default.

use crate::execution::{RoundOutcome, Verification};
use crate::types::{SlotId, TokenId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Summary of one decode round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    /// Round number, starting at 0
    pub round: usize,
    /// `(slot, accepted)` for every slot that took part
    pub accepted: Vec<(SlotId, usize)>,
    /// Whether every slot accepted all proposals
    pub all_accept: bool,
    /// Whether the round started with a bonus replay
    pub replayed_bonus: bool,
    /// Tokens appended across all slots
    pub appended: usize,
    /// Slots still active afterwards
    pub still_active: usize,
}

impl RoundReport {
    /// Build a report from a round's verification and advancement
    pub fn new(
        round: usize,
        verification: &Verification,
        outcome: &RoundOutcome,
        replayed_bonus: bool,
    ) -> Self {
        Self {
            round,
            accepted: verification
                .verdicts
                .iter()
                .map(|v| (v.slot, v.accepted))
                .collect(),
            all_accept: verification.all_accept,
            replayed_bonus,
            appended: outcome.appended,
            still_active: outcome.active.len(),
        }
    }

    /// Number of slots that took part in the round
    pub fn active(&self) -> usize {
        self.accepted.len()
    }
}

/// Receives decode-loop events
pub trait RoundObserver: Send {
    /// A slot finished prefill
    fn on_prefill(&mut self, _slot: SlotId, _prompt_len: usize, _first_token: TokenId) {}

    /// A decode round completed
    fn on_round(&mut self, _report: &RoundReport) {}

    /// A slot spent its budget
    fn on_slot_finished(&mut self, _slot: SlotId, _generated: usize) {}
}

/// Emits decode-loop events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl RoundObserver for TracingObserver {
    fn on_prefill(&mut self, slot: SlotId, prompt_len: usize, first_token: TokenId) {
        info!(slot, prompt_len, first_token, "Slot prefilled");
    }

    fn on_round(&mut self, report: &RoundReport) {
        debug!(
            round = report.round,
            active = report.active(),
            accepted = ?report.accepted,
            all_accept = report.all_accept,
            replayed_bonus = report.replayed_bonus,
            appended = report.appended,
            "Round complete"
        );
    }

    fn on_slot_finished(&mut self, slot: SlotId, generated: usize) {
        debug!(slot, generated, "Slot reached its budget");
    }
}
