//! Target verification
//!
//! The target scores the seed and the whole draft chain in one call. Its
//! greedy token at every position is compared with the next proposal; the
//! longest matching prefix is accepted.

use crate::error::{Error, Result, ResultExt};
use crate::execution::Executor;
use crate::memory::{BufferPool, ModelRole, PrecodeInputs};
use crate::scheduler::ActiveSet;
use crate::tensor::{token_id, Tensor};
use crate::types::{Phase, SlotId, TokenId};
use tracing::debug;

/// Length of the leading run where `draft[i] == target[i]`
pub fn accepted_run_length(draft: &[TokenId], target: &[TokenId]) -> usize {
    draft
        .iter()
        .zip(target)
        .take_while(|(d, t)| d == t)
        .count()
}

/// Verdict for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotVerdict {
    /// Slot the verdict belongs to
    pub slot: SlotId,
    /// Number of accepted proposals
    pub accepted: usize,
    /// Target greedy tokens for every scored position
    pub target_tokens: Vec<TokenId>,
}

impl SlotVerdict {
    /// Judge a draft chain against the target's tokens
    pub fn judge(slot: SlotId, draft_tokens: &[TokenId], target_tokens: Vec<TokenId>) -> Self {
        let accepted = accepted_run_length(draft_tokens, &target_tokens);
        Self {
            slot,
            accepted,
            target_tokens,
        }
    }

    /// Accepted tokens followed by the target's own next token
    pub fn emitted(&self) -> &[TokenId] {
        let end = (self.accepted + 1).min(self.target_tokens.len());
        &self.target_tokens[..end]
    }

    /// Target token following the accepted prefix, the next round's seed
    pub fn next_seed(&self) -> Option<TokenId> {
        self.target_tokens.get(self.accepted).copied()
    }
}

/// Outcome of one verification call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// One verdict per active slot, in slot order
    pub verdicts: Vec<SlotVerdict>,
    /// True iff every active slot accepted all proposals
    pub all_accept: bool,
}

impl Verification {
    /// Collect verdicts and decide `all_accept`
    pub fn new(verdicts: Vec<SlotVerdict>, num_speculative_tokens: usize) -> Self {
        let all_accept = !verdicts.is_empty()
            && verdicts
                .iter()
                .all(|v| v.accepted == num_speculative_tokens);
        Self {
            verdicts,
            all_accept,
        }
    }

    /// Judge every active row of a `(B, N+1)` tensor of target tokens
    pub fn from_target_ids(
        target_ids: &Tensor,
        precode: &PrecodeInputs,
        active: &ActiveSet,
        num_speculative_tokens: usize,
    ) -> Result<Self> {
        let verdicts = active
            .iter()
            .map(|slot| {
                let target_tokens = target_ids
                    .row_i64(slot)?
                    .iter()
                    .map(|&v| token_id(v))
                    .collect::<Result<Vec<_>>>()?;
                let draft_tokens = precode.draft_tokens(slot)?;
                Ok(SlotVerdict::judge(slot, &draft_tokens, target_tokens))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(verdicts, num_speculative_tokens))
    }

    /// Accepted counts in slot order
    pub fn accepted_counts(&self) -> Vec<usize> {
        self.verdicts.iter().map(|v| v.accepted).collect()
    }
}

/// Score the verification input with the target and judge every active slot
pub fn verify<T>(
    target: &mut T,
    pool: &BufferPool,
    precode: &PrecodeInputs,
    active: &ActiveSet,
    num_speculative_tokens: usize,
) -> Result<Verification>
where
    T: Executor + ?Sized,
{
    let outputs = target
        .run(precode.tensors())
        .context("target verification")
        .in_phase(Phase::Verify)?;
    let target_ids = pool
        .logits(ModelRole::Target, &outputs)
        .and_then(Tensor::argmax)
        .in_phase(Phase::Verify)?;
    if target_ids.dims().get(1) != Some(&(num_speculative_tokens + 1)) {
        return Err(Error::execution(
            Phase::Verify,
            format!(
                "target scored {:?} positions, expected {}",
                target_ids.dims(),
                num_speculative_tokens + 1
            ),
        ));
    }

    let verification =
        Verification::from_target_ids(&target_ids, precode, active, num_speculative_tokens)
            .in_phase(Phase::Verify)?;
    debug!(
        accepted = ?verification.accepted_counts(),
        all_accept = verification.all_accept,
        "Verified draft chains"
    );
    Ok(verification)
}
