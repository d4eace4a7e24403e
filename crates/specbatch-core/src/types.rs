//! Core types for the specbatch decode loop

use crate::execution::SpeculativeStats;
use serde::{Deserialize, Serialize};

/// Token ID type
pub type TokenId = u32;

/// Index of a decode batch row owned by one sequence
pub type SlotId = usize;

/// Phase of the decode loop, used to report where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Engine construction and buffer binding
    Setup,
    /// Chunked prompt processing
    Prefill,
    /// Draft model proposal steps
    Draft,
    /// Target model verification
    Verify,
    /// Slot and buffer bookkeeping between rounds
    Advance,
}

impl Phase {
    /// Get the phase name as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Prefill => "prefill",
            Phase::Draft => "draft",
            Phase::Verify => "verify",
            Phase::Advance => "advance",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a slot stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Generated as many tokens as the context allows
    Length,
}

/// Generated tokens of a single slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOutput {
    /// Batch row the sequence occupied
    pub slot: SlotId,

    /// Number of real (unpadded) prompt tokens
    pub prompt_len: usize,

    /// Generation budget of the slot
    pub max_gen_len: usize,

    /// Generated token IDs, starting with the prefill token
    pub tokens: Vec<TokenId>,

    /// Why generation stopped
    pub finish_reason: FinishReason,
}

/// Result of a full speculative generation run
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Per-slot outputs ordered by slot index
    pub slots: Vec<SlotOutput>,

    /// Round and acceptance statistics
    pub stats: SpeculativeStats,
}

impl GenerationOutput {
    /// Tokens generated for a slot
    pub fn tokens(&self, slot: SlotId) -> Option<&[TokenId]> {
        self.slots
            .iter()
            .find(|s| s.slot == slot)
            .map(|s| s.tokens.as_slice())
    }

    /// Total number of generated tokens across all slots
    pub fn total_tokens(&self) -> usize {
        self.slots.iter().map(|s| s.tokens.len()).sum()
    }
}
