//! Round advancement
//!
//! Commits each slot's verdict to the slot table and prepares the draft and
//! verification inputs of the next round.

use crate::config::SpeculativeConfig;
use crate::error::{Error, Result, ResultExt};
use crate::execution::Verification;
use crate::memory::{DecodeInputs, PrecodeInputs};
use crate::scheduler::{ActiveSet, SlotTable};
use crate::types::{Phase, SlotId, TokenId};
use tracing::{debug, warn};

/// Result of advancing one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Tokens appended across all slots
    pub appended: usize,
    /// Slots that spent their budget this round
    pub finished: Vec<SlotId>,
    /// Slots taking part in the next round
    pub active: ActiveSet,
    /// Whether the next round starts with a bonus replay
    pub bonus_pending: bool,
}

/// Commits verdicts and seeds the next round
#[derive(Debug, Clone)]
pub struct RoundAdvancer {
    num_speculative_tokens: usize,
    ctx_len: usize,
    zero_acceptance_limit: Option<usize>,
}

impl RoundAdvancer {
    /// Create an advancer for a configuration
    pub fn new(config: &SpeculativeConfig) -> Self {
        Self {
            num_speculative_tokens: config.num_speculative_tokens,
            ctx_len: config.ctx_len,
            zero_acceptance_limit: config.zero_acceptance_limit,
        }
    }

    /// Apply one round's verification.
    ///
    /// Every verdict appends `t_0..=t_a` to its slot. Slots that stay active
    /// are reseeded with `t_a` at `p + a + 1`. After an all-accept round the
    /// draft input becomes `[t_(a-1), t_a]` at `[p + a, p + a + 1]` so the
    /// draft can catch up on the last proposal it never consumed.
    pub fn advance(
        &self,
        slots: &mut SlotTable,
        verification: &Verification,
        decode: &mut DecodeInputs,
        precode: &mut PrecodeInputs,
    ) -> Result<RoundOutcome> {
        let mut appended = 0;
        let mut finished = Vec::new();
        let mut single_seeds: Vec<(SlotId, TokenId, usize)> = Vec::new();
        let mut bonus_seeds: Vec<(SlotId, [TokenId; 2], usize)> = Vec::new();

        for verdict in &verification.verdicts {
            let accepted = verdict.accepted;
            if accepted > self.num_speculative_tokens {
                return Err(Error::invariant(format!(
                    "slot {} accepted {} of {} proposals",
                    verdict.slot, accepted, self.num_speculative_tokens
                )));
            }
            let slot = slots.get_mut(verdict.slot).ok_or_else(|| {
                Error::invariant(format!("verdict for unoccupied slot {}", verdict.slot))
            })?;

            let seed_position = precode.seed_position(verdict.slot).in_phase(Phase::Advance)?;
            if seed_position != slot.position() as i64 {
                return Err(Error::invariant(format!(
                    "slot {} seed at position {} but cursor at {}",
                    verdict.slot,
                    seed_position,
                    slot.position()
                )));
            }

            appended += slot.commit(verdict.emitted(), accepted)?;
            if !slot.is_active() {
                debug!(slot = verdict.slot, generated = slot.generated().len(), "Slot finished");
                finished.push(verdict.slot);
                continue;
            }

            if let Some(limit) = self.zero_acceptance_limit {
                if slot.zero_accept_streak() >= limit {
                    warn!(
                        slot = verdict.slot,
                        rounds = slot.zero_accept_streak(),
                        "Draft proposals rejected every round"
                    );
                    return Err(Error::invariant(format!(
                        "slot {} accepted nothing for {} consecutive rounds",
                        verdict.slot,
                        slot.zero_accept_streak()
                    )));
                }
            }

            let position = slot.position();
            if position >= self.ctx_len {
                return Err(Error::invariant(format!(
                    "slot {} cursor {} past ctx_len {}",
                    verdict.slot, position, self.ctx_len
                )));
            }

            let seed = verdict.next_seed().ok_or_else(|| {
                Error::execution(
                    Phase::Advance,
                    format!("slot {} has no target token after the accepted prefix", verdict.slot),
                )
            })?;
            precode
                .advance(verdict.slot, seed, accepted + 1)
                .in_phase(Phase::Advance)?;
            single_seeds.push((verdict.slot, seed, position));
            if verification.all_accept {
                // accepted == N >= 1 here, so the previous token exists.
                let bonus = verdict.target_tokens[accepted - 1];
                bonus_seeds.push((verdict.slot, [bonus, seed], position - 1));
            }
        }

        let active = slots.active_set();
        let bonus_pending = verification.all_accept && !active.is_empty();
        if bonus_pending {
            decode.rebind_bonus(&bonus_seeds).in_phase(Phase::Advance)?;
        } else {
            decode.rebind_single(&single_seeds).in_phase(Phase::Advance)?;
        }

        Ok(RoundOutcome {
            appended,
            finished,
            active,
            bonus_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SlotVerdict;
    use crate::memory::POSITION_IDS;

    fn setup(batch: usize, k: usize, budget: usize) -> (RoundAdvancer, SlotTable, DecodeInputs, PrecodeInputs) {
        let config = SpeculativeConfig::default()
            .with_num_speculative_tokens(k)
            .with_prefill_seq_len(4)
            .with_ctx_len(64)
            .with_decode_batch_size(batch)
            .with_vocab_size(32)
            .with_zero_acceptance_limit(Some(3));
        let mut slots = SlotTable::new(batch);
        let mut decode = DecodeInputs::new(batch, 0).unwrap();
        let mut precode = PrecodeInputs::new(batch, k).unwrap();
        for slot in 0..batch {
            slots.admit(slot, 4, budget, 1).unwrap();
            decode.set_seed(slot, 1, 4).unwrap();
            precode.set_seed(slot, 1, 4).unwrap();
        }
        (RoundAdvancer::new(&config), slots, decode, precode)
    }

    #[test]
    fn test_partial_acceptance_reseeds_single() {
        let (advancer, mut slots, mut decode, mut precode) = setup(2, 2, 20);
        let verification = Verification::new(
            vec![
                SlotVerdict::judge(0, &[5, 9], vec![5, 7, 12]),
                SlotVerdict::judge(1, &[3, 9], vec![4, 9, 1]),
            ],
            2,
        );

        let outcome = advancer
            .advance(&mut slots, &verification, &mut decode, &mut precode)
            .unwrap();
        assert_eq!(outcome.appended, 3);
        assert!(!outcome.bonus_pending);

        assert_eq!(slots.get(0).unwrap().generated(), &[1, 5, 7]);
        assert_eq!(slots.get(1).unwrap().generated(), &[1, 4]);
        assert_eq!(decode.token(0).unwrap(), 7);
        assert_eq!(decode.position(0).unwrap(), 6);
        assert_eq!(decode.position(1).unwrap(), 5);
        assert_eq!(precode.seed(0).unwrap(), 7);
        assert_eq!(
            precode.tensors().get(POSITION_IDS).unwrap().row_i64(0).unwrap(),
            &[6, 7, 8]
        );
    }

    #[test]
    fn test_all_accept_sets_up_bonus_replay() {
        let (advancer, mut slots, mut decode, mut precode) = setup(1, 2, 20);
        let verification =
            Verification::new(vec![SlotVerdict::judge(0, &[5, 9], vec![5, 9, 12])], 2);

        let outcome = advancer
            .advance(&mut slots, &verification, &mut decode, &mut precode)
            .unwrap();
        assert_eq!(outcome.appended, 3);
        assert!(outcome.bonus_pending);
        assert_eq!(slots.get(0).unwrap().generated(), &[1, 5, 9, 12]);
        assert_eq!(decode.width().unwrap(), 2);

        let bonus = decode.split_bonus().unwrap().unwrap();
        assert_eq!(bonus.get(crate::memory::INPUT_IDS).unwrap().as_i64().unwrap(), &[9]);
        assert_eq!(bonus.get(POSITION_IDS).unwrap().as_i64().unwrap(), &[6]);
        assert_eq!(decode.token(0).unwrap(), 12);
        assert_eq!(decode.position(0).unwrap(), 7);
        assert_eq!(precode.seed_position(0).unwrap(), 7);
    }

    #[test]
    fn test_budget_clips_and_finishes() {
        let (advancer, mut slots, mut decode, mut precode) = setup(2, 2, 3);
        let verification = Verification::new(
            vec![
                SlotVerdict::judge(0, &[5, 9], vec![5, 9, 12]),
                SlotVerdict::judge(1, &[3, 9], vec![4, 9, 1]),
            ],
            2,
        );

        let outcome = advancer
            .advance(&mut slots, &verification, &mut decode, &mut precode)
            .unwrap();
        assert_eq!(outcome.finished, vec![0]);
        assert_eq!(outcome.active.as_slice(), &[1]);
        assert_eq!(slots.get(0).unwrap().generated(), &[1, 5, 9]);
        assert!(!outcome.bonus_pending);
    }

    #[test]
    fn test_zero_acceptance_limit() {
        let (advancer, mut slots, mut decode, mut precode) = setup(1, 2, 50);
        let mut last = None;
        for round in 0..3 {
            let seed = precode.seed(0).unwrap();
            let verification = Verification::new(
                vec![SlotVerdict::judge(0, &[seed, seed], vec![seed + 1, 0, 0])],
                2,
            );
            last = Some(advancer.advance(&mut slots, &verification, &mut decode, &mut precode));
            if round < 2 {
                assert!(last.as_ref().unwrap().is_ok());
            }
        }
        assert!(last.unwrap().unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_rejects_impossible_acceptance() {
        let (advancer, mut slots, mut decode, mut precode) = setup(1, 2, 50);
        let verdict = SlotVerdict {
            slot: 0,
            accepted: 3,
            target_tokens: vec![1, 2, 3],
        };
        let verification = Verification::new(vec![verdict], 2);
        let err = advancer
            .advance(&mut slots, &verification, &mut decode, &mut precode)
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
