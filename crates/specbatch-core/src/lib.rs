//! specbatch core - speculative decoding with continuous batching
//!
//! This crate drives a cheap draft model and an expensive target model,
//! both compiled for fixed tensor shapes, through greedy speculative
//! decoding over a batch of independent sequences:
//! - Chunked prefill of every prompt into its own decode batch row
//! - Multi-token draft proposals verified by one batched target call
//! - Bonus-token replay after rounds where every proposal was accepted
//! - Per-slot budgets, with finished slots leaving the batch
//!
//! The generated tokens are exactly the target model's greedy continuation.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod execution;
pub mod memory;
pub mod observer;
pub mod scheduler;

pub mod error;
pub mod tensor;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{BufferNamingConfig, DataType, DeviceConfig, SpeculativeConfig};
pub use engine::SpeculativeEngine;
pub use error::{Error, Result, ResultExt};
pub use execution::{Executor, Specialization, SpeculativeStats};
pub use tensor::{NamedTensors, Shape, Tensor};
pub use types::{FinishReason, GenerationOutput, Phase, SlotId, SlotOutput, TokenId};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::engine::SpeculativeEngine;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::execution::{Executor, Specialization, SpeculativeStats};
    pub use crate::observer::{RoundObserver, RoundReport, TracingObserver};
    pub use crate::tensor::{NamedTensors, Shape, Tensor};
    pub use crate::types::*;
}
