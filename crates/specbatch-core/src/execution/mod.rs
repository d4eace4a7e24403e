//! Execution of the speculative decode loop
//!
//! This module defines the executor interface the draft and target models
//! are driven through, and the phases of one generation run: chunked
//! prefill, draft proposal, target verification and round advancement.

pub mod advance;
pub mod draft;
pub mod prefill;
pub mod verify;

pub use advance::{RoundAdvancer, RoundOutcome};
pub use draft::{DraftProposer, Proposal};
pub use prefill::{padded_len, prefill, PaddedPrompt, PrefillOutput};
pub use verify::{accepted_run_length, verify, SlotVerdict, Verification};

use crate::error::Result;
use crate::tensor::NamedTensors;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A compiled model the decode loop drives.
///
/// Executors run on fixed input shapes and write their scores into the
/// `logits` buffer bound through [`Executor::set_buffers`]. Cache state lives
/// inside the executor and is addressed by `batch_index` and `position_ids`.
pub trait Executor: Send {
    /// Run one forward pass
    fn run(&mut self, inputs: &NamedTensors) -> Result<NamedTensors>;

    /// Bind output buffers, replacing any previous binding of the same name
    fn set_buffers(&mut self, buffers: NamedTensors) -> Result<()>;

    /// Mark buffers the executor manages itself (cache inputs and retained outputs)
    fn skip_buffers(&mut self, names: &BTreeSet<String>) -> Result<()>;

    /// Names of all inputs
    fn input_names(&self) -> Vec<String>;

    /// Names of all outputs
    fn output_names(&self) -> Vec<String>;

    /// Shapes the executor was compiled for, empty when unknown
    fn specializations(&self) -> Vec<Specialization> {
        Vec::new()
    }
}

/// One compiled input shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Specialization {
    /// Rows per call
    pub batch_size: usize,
    /// Tokens per row
    pub seq_len: usize,
}

impl Specialization {
    /// Create a specialization
    pub fn new(batch_size: usize, seq_len: usize) -> Self {
        Self {
            batch_size,
            seq_len,
        }
    }
}

/// Statistics of one generation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeculativeStats {
    /// Decode rounds run
    pub rounds: usize,

    /// Draft executor calls, prefill chunks and bonus replays included
    pub draft_calls: usize,

    /// Target executor calls, prefill chunks included
    pub target_calls: usize,

    /// Rounds that started by replaying a bonus token
    pub bonus_replays: usize,

    /// Total proposed tokens
    pub total_proposed: usize,

    /// Total accepted tokens
    pub total_accepted: usize,

    /// Tokens appended by decode rounds
    pub decode_tokens: usize,

    /// Accepted count of every active slot, per round
    pub acceptance_log: Vec<Vec<usize>>,
}

impl SpeculativeStats {
    /// Record the verdicts of one round
    pub fn record_round(&mut self, accepted: &[usize], num_speculative_tokens: usize, appended: usize) {
        self.rounds += 1;
        self.total_proposed += accepted.len() * num_speculative_tokens;
        self.total_accepted += accepted.iter().sum::<usize>();
        self.decode_tokens += appended;
        self.acceptance_log.push(accepted.to_vec());
    }

    /// Fraction of proposed tokens the target accepted
    pub fn acceptance_rate(&self) -> f64 {
        if self.total_proposed == 0 {
            return 0.0;
        }
        self.total_accepted as f64 / self.total_proposed as f64
    }

    /// Mean accepted tokens per slot per round
    pub fn mean_accepted_per_slot(&self) -> f64 {
        let samples: usize = self.acceptance_log.iter().map(Vec::len).sum();
        if samples == 0 {
            return 0.0;
        }
        self.total_accepted as f64 / samples as f64
    }

    /// Tokens appended per verification call
    pub fn tokens_per_target_call(&self) -> f64 {
        if self.rounds == 0 {
            return 0.0;
        }
        self.decode_tokens as f64 / self.rounds as f64
    }

    /// Estimated speedup over target-only decoding.
    /// Assumes the draft model is `draft_speedup` times faster than the target.
    pub fn speedup(&self, draft_speedup: f64) -> f64 {
        if self.rounds == 0 || self.total_proposed == 0 {
            return 1.0;
        }
        let slots = self.acceptance_log.iter().map(Vec::len).sum::<usize>() as f64;
        let proposals_per_slot = self.total_proposed as f64 / slots;

        // Cost: one target pass plus the draft steps of a round.
        // Benefit: accepted tokens plus the target's own token.
        let cost = 1.0 + proposals_per_slot / draft_speedup;
        let benefit = self.mean_accepted_per_slot() + 1.0;
        benefit / cost
    }
}

impl std::fmt::Display for SpeculativeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rounds: {}, acceptance: {:.1}%, mean accepted/slot: {:.2}, tokens/verify: {:.2}",
            self.rounds,
            self.acceptance_rate() * 100.0,
            self.mean_accepted_per_slot(),
            self.tokens_per_target_call(),
        )
    }
}
