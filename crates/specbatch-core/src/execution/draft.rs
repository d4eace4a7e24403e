//! Draft proposal loop
//!
//! The draft model extends every active slot by `num_speculative_tokens`
//! greedy tokens, one batched call per token. Each proposal is written into
//! the verification input column by column and fed back as the next draft
//! input.

use crate::error::{Result, ResultExt};
use crate::execution::Executor;
use crate::memory::{BufferPool, DecodeInputs, ModelRole, PrecodeInputs};
use crate::scheduler::ActiveSet;
use crate::types::Phase;
use tracing::debug;

/// What one proposal pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Whether a pending bonus token was replayed first
    pub replayed_bonus: bool,
    /// Draft executor calls made
    pub calls: usize,
}

/// Runs the draft model to fill the verification input
#[derive(Debug, Clone, Copy)]
pub struct DraftProposer {
    num_speculative_tokens: usize,
}

impl DraftProposer {
    /// Create a proposer for `num_speculative_tokens` tokens per round
    pub fn new(num_speculative_tokens: usize) -> Self {
        Self {
            num_speculative_tokens,
        }
    }

    /// Tokens proposed per round
    pub fn num_speculative_tokens(&self) -> usize {
        self.num_speculative_tokens
    }

    /// Propose one draft chain for every active slot.
    ///
    /// A two-wide decode input left by an all-accept round is split first
    /// and its bonus half run once with the output discarded, so the draft
    /// cache catches up with the token it never saw. Afterwards step `k`
    /// writes its greedy tokens into column `k + 1` of `precode`.
    pub fn propose<D>(
        &self,
        draft: &mut D,
        pool: &BufferPool,
        decode: &mut DecodeInputs,
        precode: &mut PrecodeInputs,
        active: &ActiveSet,
    ) -> Result<Proposal>
    where
        D: Executor + ?Sized,
    {
        let mut calls = 0;
        let bonus = decode.split_bonus().in_phase(Phase::Draft)?;
        let replayed_bonus = bonus.is_some();
        if let Some(bonus) = bonus {
            draft
                .run(&bonus)
                .context("draft bonus replay")
                .in_phase(Phase::Draft)?;
            calls += 1;
            debug!(active = active.len(), "Replayed bonus token");
        }

        for step in 0..self.num_speculative_tokens {
            let outputs = draft
                .run(decode.tensors())
                .with_context(|| format!("draft step {}", step))
                .in_phase(Phase::Draft)?;
            calls += 1;

            let ids = pool
                .logits(ModelRole::Draft, &outputs)
                .and_then(|logits| logits.argmax())
                .with_context(|| format!("draft step {}", step))
                .in_phase(Phase::Draft)?;
            precode.write_column(step + 1, &ids).in_phase(Phase::Draft)?;
            decode.set_input_ids(ids).in_phase(Phase::Draft)?;
            decode.advance_positions(active).in_phase(Phase::Draft)?;
        }

        Ok(Proposal {
            replayed_bonus,
            calls,
        })
    }
}
