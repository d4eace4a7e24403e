//! Test support: a deterministic toy language model executor
//!
//! [`ToyLm`] keeps a per-row token cache indexed by absolute position and
//! predicts the next token from a hash of the whole history up to the
//! scored position. A draft variant disagrees with the target at chosen
//! positions, so acceptance can be steered from a test.

use crate::config::DataType;
use crate::error::{Error, Result};
use crate::execution::{Executor, Specialization};
use crate::memory::{BATCH_INDEX, INPUT_IDS, LOGITS, POSITION_IDS};
use crate::tensor::{NamedTensors, Tensor};
use crate::types::TokenId;
use half::f16;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Greedy next token of the target after `history`
pub(crate) fn predict(history: &[TokenId], vocab_size: usize) -> TokenId {
    let mut h: u64 = 0x9e37_79b9;
    for &token in history {
        h = h.wrapping_mul(31).wrapping_add(token as u64 + 7);
        h ^= h >> 13;
    }
    (h % vocab_size as u64) as TokenId
}

/// Target-only greedy decoding of `n` tokens
pub(crate) fn greedy_reference(prompt: &[TokenId], n: usize, vocab_size: usize) -> Vec<TokenId> {
    let mut history = prompt.to_vec();
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let next = predict(&history, vocab_size);
        history.push(next);
        out.push(next);
    }
    out
}

/// Reproducible random prompts
pub(crate) fn random_prompts(seed: u64, lengths: &[usize], vocab_size: usize) -> Vec<Vec<TokenId>> {
    let mut rng = StdRng::seed_from_u64(seed);
    lengths
        .iter()
        .map(|&len| (0..len).map(|_| rng.gen_range(0..vocab_size as TokenId)).collect())
        .collect()
}

/// Install a test subscriber once, filtered by `RUST_LOG`
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One executor interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    /// `set_buffers` with the logits shape bound
    Bind { model: &'static str, shape: Vec<usize> },
    /// `run` with the input ids shape and batch indices
    Run {
        model: &'static str,
        shape: Vec<usize>,
        batch_index: Vec<i64>,
    },
}

/// Shared, ordered log of calls across both executors
pub(crate) type CallLog = Arc<Mutex<Vec<Call>>>;

/// Deterministic toy language model
pub(crate) struct ToyLm {
    name: &'static str,
    vocab_size: usize,
    ctx_len: usize,
    cache: Vec<Vec<TokenId>>,
    logits: Option<(Vec<usize>, DataType)>,
    disagree_every: Option<usize>,
    fail_on_run: Option<usize>,
    runs: usize,
    skipped: BTreeSet<String>,
    specializations: Vec<Specialization>,
    log: CallLog,
}

impl ToyLm {
    /// The model whose greedy output is the reference
    pub(crate) fn target(vocab_size: usize, ctx_len: usize, rows: usize, log: &CallLog) -> Self {
        Self {
            name: "target",
            vocab_size,
            ctx_len,
            cache: vec![vec![0; ctx_len]; rows],
            logits: None,
            disagree_every: None,
            fail_on_run: None,
            runs: 0,
            skipped: BTreeSet::new(),
            specializations: Vec::new(),
            log: Arc::clone(log),
        }
    }

    /// A draft that agrees with the target except where `position % every == 0`
    pub(crate) fn draft(
        vocab_size: usize,
        ctx_len: usize,
        rows: usize,
        every: Option<usize>,
        log: &CallLog,
    ) -> Self {
        Self {
            name: "draft",
            disagree_every: every,
            ..Self::target(vocab_size, ctx_len, rows, log)
        }
    }

    /// Fail the `n`th `run` call (0-based)
    pub(crate) fn fail_on_run(mut self, n: usize) -> Self {
        self.fail_on_run = Some(n);
        self
    }

    /// Declare compiled shapes
    pub(crate) fn with_specializations(mut self, shapes: Vec<Specialization>) -> Self {
        self.specializations = shapes;
        self
    }

    /// Buffers handed over through `skip_buffers`
    pub(crate) fn skipped(&self) -> &BTreeSet<String> {
        &self.skipped
    }

    /// Cached token history of a row up to and including `position`
    pub(crate) fn history(&self, row: usize, position: usize) -> &[TokenId] {
        &self.cache[row][..=position]
    }

    fn score(&self, row: usize, position: usize) -> TokenId {
        let next = predict(self.history(row, position), self.vocab_size);
        // The token scored at `position` lands at `position + 1`.
        match self.disagree_every {
            Some(every) if (position + 1) % every == 0 => (next + 1) % self.vocab_size as TokenId,
            _ => next,
        }
    }
}

impl Executor for ToyLm {
    fn run(&mut self, inputs: &NamedTensors) -> Result<NamedTensors> {
        let ids = inputs.get(INPUT_IDS)?;
        let positions = inputs.get(POSITION_IDS)?;
        let batch_index = inputs.get(BATCH_INDEX)?.as_i64()?.to_vec();
        self.log.lock().push(Call::Run {
            model: self.name,
            shape: ids.dims().to_vec(),
            batch_index: batch_index.clone(),
        });

        let run = self.runs;
        self.runs += 1;
        if self.fail_on_run == Some(run) {
            return Err(Error::Tensor(format!("{} run {} failed", self.name, run)));
        }

        let (bound, dtype) = self
            .logits
            .clone()
            .ok_or_else(|| Error::MissingBuffer(LOGITS.to_string()))?;
        let (rows, width) = (ids.dims()[0], ids.dims()[1]);
        if bound[0] != rows || (bound[1] != 1 && bound[1] != width) {
            return Err(Error::ShapeMismatch {
                buffer: INPUT_IDS.to_string(),
                expected: bound[..2].to_vec(),
                actual: ids.dims().to_vec(),
            });
        }

        // Write every input token into the cache before scoring anything.
        let mut valid: Vec<Vec<usize>> = vec![Vec::new(); rows];
        for (r, row_valid) in valid.iter_mut().enumerate() {
            let cache_row = batch_index[r] as usize;
            for c in 0..width {
                let pos = positions.get_i64(r, c)?;
                if pos < 0 || pos as usize >= self.ctx_len {
                    continue;
                }
                self.cache[cache_row][pos as usize] = ids.get_i64(r, c)? as TokenId;
                row_valid.push(pos as usize);
            }
        }

        let seq = bound[1];
        let mut scores = vec![0.0f32; rows * seq * self.vocab_size];
        for (r, row_valid) in valid.iter().enumerate() {
            let cache_row = batch_index[r] as usize;
            let scored: Vec<Option<usize>> = if seq == width {
                (0..width)
                    .map(|c| {
                        let pos = positions.get_i64(r, c).ok()?;
                        (pos >= 0 && (pos as usize) < self.ctx_len).then_some(pos as usize)
                    })
                    .collect()
            } else {
                vec![row_valid.last().copied()]
            };
            for (s, position) in scored.into_iter().enumerate() {
                if let Some(position) = position {
                    let token = self.score(cache_row, position) as usize;
                    scores[(r * seq + s) * self.vocab_size + token] = 1.0;
                }
            }
        }

        let shape = [rows, seq, self.vocab_size];
        let logits = match dtype {
            DataType::Float16 => {
                let halves: Vec<f16> = scores.iter().map(|&v| f16::from_f32(v)).collect();
                Tensor::from_f16(&halves, shape)?
            }
            _ => Tensor::from_f32(&scores, shape)?,
        };
        Ok(NamedTensors::new().with(LOGITS, logits))
    }

    fn set_buffers(&mut self, buffers: NamedTensors) -> Result<()> {
        let logits = buffers.get(LOGITS)?;
        self.log.lock().push(Call::Bind {
            model: self.name,
            shape: logits.dims().to_vec(),
        });
        self.logits = Some((logits.dims().to_vec(), logits.dtype()));
        Ok(())
    }

    fn skip_buffers(&mut self, names: &BTreeSet<String>) -> Result<()> {
        self.skipped.extend(names.iter().cloned());
        Ok(())
    }

    fn input_names(&self) -> Vec<String> {
        [INPUT_IDS, POSITION_IDS, BATCH_INDEX, "past_key.0", "past_value.0"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn output_names(&self) -> Vec<String> {
        [LOGITS, "past_key.0_RetainedState", "past_value.0_RetainedState"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn specializations(&self) -> Vec<Specialization> {
        self.specializations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_reference_is_deterministic() {
        let a = greedy_reference(&[1, 2, 3], 10, 50);
        let b = greedy_reference(&[1, 2, 3], 10, 50);
        assert_eq!(a, b);
        assert!(a.iter().all(|&t| (t as usize) < 50));
        assert_ne!(greedy_reference(&[1, 2, 4], 10, 50), a);
    }

    #[test]
    fn test_random_prompts_are_reproducible() {
        let a = random_prompts(7, &[3, 5], 20);
        assert_eq!(a, random_prompts(7, &[3, 5], 20));
        assert_eq!(a[1].len(), 5);
    }
}
