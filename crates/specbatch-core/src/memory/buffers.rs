//! Pre-allocated input and output buffers for the decode loop
//!
//! Executors are compiled for fixed shapes, so every buffer is allocated once
//! per phase and then mutated in place. Moving between phases always goes
//! through an explicit rebind that allocates fresh buffers of the new shape.

use crate::config::{DataType, SpeculativeConfig};
use crate::error::{Error, Result};
use crate::execution::Executor;
use crate::scheduler::ActiveSet;
use crate::tensor::{token_id, NamedTensors, Shape, Tensor};
use crate::types::{SlotId, TokenId};
use tracing::debug;

/// Token ids fed to an executor
pub const INPUT_IDS: &str = "input_ids";
/// Absolute position of every input token
pub const POSITION_IDS: &str = "position_ids";
/// Cache row each batch row reads and writes
pub const BATCH_INDEX: &str = "batch_index";
/// Output scores over the vocabulary
pub const LOGITS: &str = "logits";

/// Shape family a buffer set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPhase {
    /// One prompt chunk of a single slot
    Prefill,
    /// One draft step across the decode batch
    Decode,
    /// Seed plus draft chain across the decode batch, scored by the target
    Precode,
}

/// Which executor a binding belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// The cheap proposal model
    Draft,
    /// The model whose greedy output is reproduced
    Target,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelRole::Draft => f.write_str("draft"),
            ModelRole::Target => f.write_str("target"),
        }
    }
}

/// Logits buffer currently bound to an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogitsBinding {
    /// Phase the buffer was allocated for
    pub phase: BufferPhase,
    /// Shape of the buffer
    pub shape: Shape,
    /// Monotonic allocation counter, shared by both models
    pub version: u64,
}

/// Tracks the logits buffers bound to the draft and target executors
#[derive(Debug)]
pub struct BufferPool {
    vocab_size: usize,
    decode_batch_size: usize,
    num_logits_to_keep: usize,
    dtype: DataType,
    draft: Option<LogitsBinding>,
    target: Option<LogitsBinding>,
    next_version: u64,
}

impl BufferPool {
    /// Create an empty pool for the configured shapes
    pub fn new(config: &SpeculativeConfig) -> Self {
        Self {
            vocab_size: config.vocab_size,
            decode_batch_size: config.decode_batch_size,
            num_logits_to_keep: config.num_logits_to_keep(),
            dtype: config.logits_dtype,
            draft: None,
            target: None,
            next_version: 0,
        }
    }

    /// Logits shape of a phase
    pub fn logits_shape(&self, phase: BufferPhase) -> Shape {
        match phase {
            BufferPhase::Prefill => Shape::from([1, 1, self.vocab_size]),
            BufferPhase::Decode => Shape::from([self.decode_batch_size, 1, self.vocab_size]),
            BufferPhase::Precode => Shape::from([
                self.decode_batch_size,
                self.num_logits_to_keep,
                self.vocab_size,
            ]),
        }
    }

    /// Bind prefill logits `(1, 1, V)` to both executors
    pub fn bind_prefill<D, T>(&mut self, draft: &mut D, target: &mut T) -> Result<()>
    where
        D: Executor + ?Sized,
        T: Executor + ?Sized,
    {
        self.bind(ModelRole::Draft, draft, BufferPhase::Prefill)?;
        self.bind(ModelRole::Target, target, BufferPhase::Prefill)
    }

    /// Bind decode logits: `(B, 1, V)` for the draft, `(B, N+1, V)` for the target
    pub fn bind_decode<D, T>(&mut self, draft: &mut D, target: &mut T) -> Result<()>
    where
        D: Executor + ?Sized,
        T: Executor + ?Sized,
    {
        self.bind(ModelRole::Draft, draft, BufferPhase::Decode)?;
        self.bind(ModelRole::Target, target, BufferPhase::Precode)
    }

    /// Current binding of a model
    pub fn binding(&self, role: ModelRole) -> Option<&LogitsBinding> {
        match role {
            ModelRole::Draft => self.draft.as_ref(),
            ModelRole::Target => self.target.as_ref(),
        }
    }

    /// Fetch the logits from executor outputs and check them against the binding
    pub fn logits<'a>(&self, role: ModelRole, outputs: &'a NamedTensors) -> Result<&'a Tensor> {
        let binding = self
            .binding(role)
            .ok_or_else(|| Error::Tensor(format!("no logits buffer bound for the {} model", role)))?;
        let logits = outputs.get(LOGITS)?;
        logits.expect_dims(LOGITS, binding.shape.dims())?;
        Ok(logits)
    }

    fn bind<E>(&mut self, role: ModelRole, executor: &mut E, phase: BufferPhase) -> Result<()>
    where
        E: Executor + ?Sized,
    {
        let shape = self.logits_shape(phase);
        let buffers = NamedTensors::new().with(LOGITS, Tensor::zeros(shape.clone(), self.dtype));
        executor.set_buffers(buffers)?;

        let version = self.next_version;
        self.next_version += 1;
        debug!(model = %role, ?phase, %shape, version, "Bound logits buffer");

        let binding = Some(LogitsBinding {
            phase,
            shape,
            version,
        });
        match role {
            ModelRole::Draft => self.draft = binding,
            ModelRole::Target => self.target = binding,
        }
        Ok(())
    }
}

fn batch_index(batch_size: usize) -> Result<Tensor> {
    Tensor::from_i64((0..batch_size as i64).collect(), [batch_size, 1])
}

/// Draft decode input: `(B, 1)` normally, `(B, 2)` after an all-accept round
#[derive(Debug, Clone)]
pub struct DecodeInputs {
    tensors: NamedTensors,
    batch_size: usize,
}

impl DecodeInputs {
    /// Allocate a single-token input with every row padded
    pub fn new(batch_size: usize, pad_token_id: TokenId) -> Result<Self> {
        let tensors = NamedTensors::new()
            .with(INPUT_IDS, Tensor::full_i64([batch_size, 1], pad_token_id as i64))
            .with(POSITION_IDS, Tensor::full_i64([batch_size, 1], 0))
            .with(BATCH_INDEX, batch_index(batch_size)?);
        Ok(Self {
            tensors,
            batch_size,
        })
    }

    /// Tensors handed to the draft executor
    pub fn tensors(&self) -> &NamedTensors {
        &self.tensors
    }

    /// Number of tokens per row
    pub fn width(&self) -> Result<usize> {
        Ok(self.tensors.get(INPUT_IDS)?.dims()[1])
    }

    /// Check whether a bonus token is pending replay
    pub fn has_bonus(&self) -> Result<bool> {
        Ok(self.width()? == 2)
    }

    /// Place a seed token for one row of a single-token input
    pub fn set_seed(&mut self, slot: SlotId, token: TokenId, position: usize) -> Result<()> {
        self.expect_width(1)?;
        self.tensors
            .get_mut(INPUT_IDS)?
            .set_i64(slot, 0, token as i64)?;
        self.tensors
            .get_mut(POSITION_IDS)?
            .set_i64(slot, 0, position as i64)
    }

    /// Replace the ids with a `(B, 1)` tensor, typically the previous argmax
    pub fn set_input_ids(&mut self, ids: Tensor) -> Result<()> {
        self.expect_width(1)?;
        ids.expect_dims(INPUT_IDS, &[self.batch_size, 1])?;
        self.tensors.insert(INPUT_IDS, ids);
        Ok(())
    }

    /// Move the positions of active rows one step forward
    pub fn advance_positions(&mut self, active: &ActiveSet) -> Result<()> {
        let positions = self.tensors.get_mut(POSITION_IDS)?;
        for slot in active.iter() {
            for pos in positions.row_i64_mut(slot)? {
                *pos += 1;
            }
        }
        Ok(())
    }

    /// Reallocate as a `(B, 2)` input holding `[bonus, regular]` per active row.
    ///
    /// `seeds` lists `(slot, [bonus, regular], bonus_position)`; rows not
    /// listed are zeroed.
    pub fn rebind_bonus(&mut self, seeds: &[(SlotId, [TokenId; 2], usize)]) -> Result<()> {
        let shape = [self.batch_size, 2];
        let mut ids = Tensor::full_i64(shape, 0);
        let mut positions = Tensor::full_i64(shape, 0);
        for &(slot, tokens, position) in seeds {
            let id_row = ids.row_i64_mut(slot)?;
            id_row[0] = tokens[0] as i64;
            id_row[1] = tokens[1] as i64;
            let pos_row = positions.row_i64_mut(slot)?;
            pos_row[0] = position as i64;
            pos_row[1] = position as i64 + 1;
        }
        self.tensors.insert(INPUT_IDS, ids);
        self.tensors.insert(POSITION_IDS, positions);
        Ok(())
    }

    /// Reallocate as a `(B, 1)` input holding the given seeds
    pub fn rebind_single(&mut self, seeds: &[(SlotId, TokenId, usize)]) -> Result<()> {
        if self.width()? != 1 {
            let shape = [self.batch_size, 1];
            self.tensors.insert(INPUT_IDS, Tensor::full_i64(shape, 0));
            self.tensors.insert(POSITION_IDS, Tensor::full_i64(shape, 0));
        }
        for &(slot, token, position) in seeds {
            self.set_seed(slot, token, position)?;
        }
        Ok(())
    }

    /// Split a pending `(B, 2)` input by even halving.
    ///
    /// Keeps the regular half in place and returns the bonus half as a
    /// ready-to-run input map. Returns `None` when no bonus is pending.
    pub fn split_bonus(&mut self) -> Result<Option<NamedTensors>> {
        if !self.has_bonus()? {
            return Ok(None);
        }
        let (bonus_ids, regular_ids) = self.tensors.get(INPUT_IDS)?.split_columns()?;
        let (bonus_pos, regular_pos) = self.tensors.get(POSITION_IDS)?.split_columns()?;
        self.tensors.insert(INPUT_IDS, regular_ids);
        self.tensors.insert(POSITION_IDS, regular_pos);

        let bonus = NamedTensors::new()
            .with(INPUT_IDS, bonus_ids)
            .with(POSITION_IDS, bonus_pos)
            .with(BATCH_INDEX, self.tensors.get(BATCH_INDEX)?.clone());
        Ok(Some(bonus))
    }

    /// Current token of a row in a single-token input
    pub fn token(&self, slot: SlotId) -> Result<TokenId> {
        token_id(self.tensors.get(INPUT_IDS)?.get_i64(slot, 0)?)
    }

    /// Current position of a row in a single-token input
    pub fn position(&self, slot: SlotId) -> Result<i64> {
        self.tensors.get(POSITION_IDS)?.get_i64(slot, 0)
    }

    fn expect_width(&self, width: usize) -> Result<()> {
        self.tensors
            .get(INPUT_IDS)?
            .expect_dims(INPUT_IDS, &[self.batch_size, width])
    }
}

/// Target verification input: seed plus draft chain, `(B, N+1)`
#[derive(Debug, Clone)]
pub struct PrecodeInputs {
    tensors: NamedTensors,
    batch_size: usize,
    width: usize,
}

impl PrecodeInputs {
    /// Allocate a zeroed input for `num_speculative_tokens` proposals
    pub fn new(batch_size: usize, num_speculative_tokens: usize) -> Result<Self> {
        let width = num_speculative_tokens + 1;
        let tensors = NamedTensors::new()
            .with(INPUT_IDS, Tensor::full_i64([batch_size, width], 0))
            .with(POSITION_IDS, Tensor::full_i64([batch_size, width], 0))
            .with(BATCH_INDEX, batch_index(batch_size)?);
        Ok(Self {
            tensors,
            batch_size,
            width,
        })
    }

    /// Tensors handed to the target executor
    pub fn tensors(&self) -> &NamedTensors {
        &self.tensors
    }

    /// Seed plus proposals per row
    pub fn width(&self) -> usize {
        self.width
    }

    /// Write the seed in column 0 and lay out positions `start..start + N + 1`
    pub fn set_seed(&mut self, slot: SlotId, token: TokenId, start: usize) -> Result<()> {
        self.tensors
            .get_mut(INPUT_IDS)?
            .set_i64(slot, 0, token as i64)?;
        let row = self.tensors.get_mut(POSITION_IDS)?.row_i64_mut(slot)?;
        for (offset, pos) in row.iter_mut().enumerate() {
            *pos = (start + offset) as i64;
        }
        Ok(())
    }

    /// Copy a `(B, 1)` tensor of draft tokens into one column
    pub fn write_column(&mut self, column: usize, ids: &Tensor) -> Result<()> {
        ids.expect_dims(INPUT_IDS, &[self.batch_size, 1])?;
        if column == 0 || column >= self.width {
            return Err(Error::Tensor(format!(
                "draft column {} outside 1..{}",
                column, self.width
            )));
        }
        let values = ids.as_i64()?;
        let target = self.tensors.get_mut(INPUT_IDS)?;
        for (row, &value) in values.iter().enumerate() {
            target.set_i64(row, column, value)?;
        }
        Ok(())
    }

    /// Replace the seed of a row and shift its positions forward
    pub fn advance(&mut self, slot: SlotId, seed: TokenId, shift: usize) -> Result<()> {
        self.tensors
            .get_mut(INPUT_IDS)?
            .set_i64(slot, 0, seed as i64)?;
        for pos in self.tensors.get_mut(POSITION_IDS)?.row_i64_mut(slot)? {
            *pos += shift as i64;
        }
        Ok(())
    }

    /// Proposed tokens of a row (columns `1..=N`)
    pub fn draft_tokens(&self, slot: SlotId) -> Result<Vec<TokenId>> {
        self.tensors.get(INPUT_IDS)?.row_i64(slot)?[1..]
            .iter()
            .map(|&v| token_id(v))
            .collect()
    }

    /// Seed token of a row
    pub fn seed(&self, slot: SlotId) -> Result<TokenId> {
        token_id(self.tensors.get(INPUT_IDS)?.get_i64(slot, 0)?)
    }

    /// Position of the seed token of a row
    pub fn seed_position(&self, slot: SlotId) -> Result<i64> {
        self.tensors.get(POSITION_IDS)?.get_i64(slot, 0)
    }
}
