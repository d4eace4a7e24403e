//! Buffer management for specbatch
//!
//! Holds the fixed-shape tensors exchanged with the draft and target
//! executors and the logits buffers bound to them for each phase.

pub mod buffers;

pub use buffers::{
    BufferPhase, BufferPool, DecodeInputs, LogitsBinding, ModelRole, PrecodeInputs, BATCH_INDEX,
    INPUT_IDS, LOGITS, POSITION_IDS,
};
