//! Sequence slot table
//!
//! Every concurrently generating sequence owns one decode batch row (its
//! slot) from prefill until its budget is spent. The table is the single
//! source of truth for which rows take part in a round; the active set is
//! rebuilt from it after every round instead of being edited in place.

use crate::error::{Error, Result};
use crate::types::{FinishReason, SlotId, SlotOutput, TokenId};

/// Status of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Still generating
    Active,
    /// Budget exhausted
    Finished,
}

/// State of one generating sequence
#[derive(Debug, Clone)]
pub struct Slot {
    /// Batch row of the sequence
    index: SlotId,

    /// Number of real prompt tokens
    prompt_len: usize,

    /// Generated tokens, append-only
    generated: Vec<TokenId>,

    /// Absolute position of the pending seed token
    position: usize,

    /// Generation budget
    max_gen_len: usize,

    /// Current status
    status: SlotStatus,

    /// Consecutive rounds with nothing accepted
    zero_accept_streak: usize,
}

impl Slot {
    /// Create a slot right after prefill.
    ///
    /// The first token comes from prefill and sits at position `prompt_len`.
    /// A slot without budget starts out finished and keeps no token.
    pub fn new(index: SlotId, prompt_len: usize, max_gen_len: usize, first_token: TokenId) -> Self {
        let mut slot = Self {
            index,
            prompt_len,
            generated: Vec::with_capacity(max_gen_len),
            position: prompt_len,
            max_gen_len,
            status: SlotStatus::Active,
            zero_accept_streak: 0,
        };
        slot.push_bounded(&[first_token]);
        slot
    }

    /// Get the slot index
    pub fn index(&self) -> SlotId {
        self.index
    }

    /// Get the prompt length
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Get the generated tokens
    pub fn generated(&self) -> &[TokenId] {
        &self.generated
    }

    /// Position of the pending seed token
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the generation budget
    pub fn max_gen_len(&self) -> usize {
        self.max_gen_len
    }

    /// Get the status
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Check if the slot still generates
    pub fn is_active(&self) -> bool {
        self.status == SlotStatus::Active
    }

    /// Tokens left in the budget
    pub fn remaining(&self) -> usize {
        self.max_gen_len - self.generated.len()
    }

    /// Consecutive zero-acceptance rounds so far
    pub fn zero_accept_streak(&self) -> usize {
        self.zero_accept_streak
    }

    /// Commit the tokens produced for this slot in one round.
    ///
    /// `tokens` is the accepted prefix followed by the target's next token;
    /// the cursor moves past all of them and the append is clipped to the
    /// budget. Returns the number of tokens actually appended.
    pub fn commit(&mut self, tokens: &[TokenId], accepted: usize) -> Result<usize> {
        if !self.is_active() {
            return Err(Error::invariant(format!(
                "slot {} committed tokens after finishing",
                self.index
            )));
        }
        if accepted == 0 {
            self.zero_accept_streak += 1;
        } else {
            self.zero_accept_streak = 0;
        }
        self.position += tokens.len();
        Ok(self.push_bounded(tokens))
    }

    fn push_bounded(&mut self, tokens: &[TokenId]) -> usize {
        let n = tokens.len().min(self.remaining());
        self.generated.extend_from_slice(&tokens[..n]);
        if self.generated.len() >= self.max_gen_len {
            self.status = SlotStatus::Finished;
        }
        n
    }

    fn into_output(self) -> SlotOutput {
        SlotOutput {
            slot: self.index,
            prompt_len: self.prompt_len,
            max_gen_len: self.max_gen_len,
            tokens: self.generated,
            finish_reason: FinishReason::Length,
        }
    }
}

/// Slots that take part in the current round, in ascending row order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSet(Vec<SlotId>);

impl ActiveSet {
    /// Iterate over active slot indices
    pub fn iter(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.0.iter().copied()
    }

    /// Number of active slots
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no slot is active
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check membership
    pub fn contains(&self, slot: SlotId) -> bool {
        self.0.binary_search(&slot).is_ok()
    }

    /// Active indices as a slice
    pub fn as_slice(&self) -> &[SlotId] {
        &self.0
    }
}

impl FromIterator<SlotId> for ActiveSet {
    fn from_iter<I: IntoIterator<Item = SlotId>>(iter: I) -> Self {
        let mut slots: Vec<SlotId> = iter.into_iter().collect();
        slots.sort_unstable();
        slots.dedup();
        Self(slots)
    }
}

/// Fixed-capacity table of slots, one per decode batch row
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
}

impl SlotTable {
    /// Create a table with one empty entry per decode row
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Number of decode rows
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Register a freshly prefilled sequence at a decode row
    pub fn admit(
        &mut self,
        index: SlotId,
        prompt_len: usize,
        max_gen_len: usize,
        first_token: TokenId,
    ) -> Result<&Slot> {
        let capacity = self.capacity();
        let entry = self.slots.get_mut(index).ok_or_else(|| {
            Error::config(format!(
                "slot {} outside decode batch of {}",
                index, capacity
            ))
        })?;
        if entry.is_some() {
            return Err(Error::config(format!("slot {} already occupied", index)));
        }
        Ok(&*entry.insert(Slot::new(index, prompt_len, max_gen_len, first_token)))
    }

    /// Get a slot
    pub fn get(&self, index: SlotId) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Get a slot for mutation
    pub fn get_mut(&mut self, index: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Occupied slots in row order
    pub fn occupied(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Build the set of slots that still generate
    pub fn active_set(&self) -> ActiveSet {
        ActiveSet(
            self.occupied()
                .filter(|slot| slot.is_active())
                .map(Slot::index)
                .collect(),
        )
    }

    /// Check whether every occupied slot has finished
    pub fn is_done(&self) -> bool {
        self.occupied().all(|slot| !slot.is_active())
    }

    /// Consume the table into per-slot outputs
    pub fn into_outputs(self) -> Vec<SlotOutput> {
        self.slots
            .into_iter()
            .flatten()
            .map(Slot::into_output)
            .collect()
    }
}
