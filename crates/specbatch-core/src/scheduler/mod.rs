//! Slot scheduling for continuous batching
//!
//! Sequences are admitted into fixed decode batch rows at prefill time and
//! leave the batch when their generation budget is spent. Finished rows stay
//! in the compiled batch shape but are no longer read or advanced.

mod slots;

pub use slots::{ActiveSet, Slot, SlotStatus, SlotTable};
