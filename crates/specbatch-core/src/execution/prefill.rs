//! Chunked prompt prefill
//!
//! A prompt is right-padded to a whole number of `prefill_seq_len` chunks and
//! run chunk by chunk through the target and then the draft executor, both
//! writing into the cache row of the slot the prompt was assigned to. The
//! target's scores for the last real prompt position give the first token.

use crate::config::SpeculativeConfig;
use crate::error::{Error, Result, ResultExt};
use crate::execution::Executor;
use crate::memory::{BATCH_INDEX, INPUT_IDS, LOGITS, POSITION_IDS};
use crate::tensor::{token_id, NamedTensors, Tensor};
use crate::types::{Phase, SlotId, TokenId};
use tracing::debug;

/// Padded prompt length: the next multiple of `prefill_seq_len`.
///
/// Fails when the prompt is empty or the padded length does not fit the context.
pub fn padded_len(prompt_len: usize, prefill_seq_len: usize, ctx_len: usize) -> Result<usize> {
    if prompt_len == 0 {
        return Err(Error::config("prompt must contain at least one token"));
    }
    if prefill_seq_len == 0 {
        return Err(Error::config("prefill_seq_len must be positive"));
    }
    let padded = prompt_len.div_ceil(prefill_seq_len) * prefill_seq_len;
    if padded > ctx_len {
        return Err(Error::config(format!(
            "prompt of {} tokens pads to {}, which exceeds ctx_len {}",
            prompt_len, padded, ctx_len
        )));
    }
    Ok(padded)
}

/// A prompt right-padded to whole prefill chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedPrompt {
    input_ids: Vec<i64>,
    position_ids: Vec<i64>,
    prompt_len: usize,
    chunk_len: usize,
}

impl PaddedPrompt {
    /// Pad a prompt with the configured pad token.
    ///
    /// Real tokens sit at positions `0..prompt_len`; padding carries position `-1`.
    pub fn new(prompt: &[TokenId], config: &SpeculativeConfig) -> Result<Self> {
        let padded = padded_len(prompt.len(), config.prefill_seq_len, config.ctx_len)?;
        if let Some(&bad) = prompt.iter().find(|&&t| t as usize >= config.vocab_size) {
            return Err(Error::config(format!(
                "token {} outside vocabulary of {}",
                bad, config.vocab_size
            )));
        }

        let mut input_ids: Vec<i64> = prompt.iter().map(|&t| t as i64).collect();
        input_ids.resize(padded, config.pad_token_id as i64);
        let position_ids = (0..padded as i64)
            .map(|p| if (p as usize) < prompt.len() { p } else { -1 })
            .collect();

        Ok(Self {
            input_ids,
            position_ids,
            prompt_len: prompt.len(),
            chunk_len: config.prefill_seq_len,
        })
    }

    /// Number of real prompt tokens
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Padded length
    pub fn padded_len(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of prefill chunks
    pub fn num_chunks(&self) -> usize {
        self.input_ids.len() / self.chunk_len
    }

    /// Inputs of one chunk, addressed to the cache row of `slot`
    pub fn chunk(&self, index: usize, slot: SlotId) -> Result<NamedTensors> {
        let start = index * self.chunk_len;
        let end = start + self.chunk_len;
        if end > self.input_ids.len() {
            return Err(Error::Tensor(format!(
                "chunk {} outside prompt of {} chunks",
                index,
                self.num_chunks()
            )));
        }
        let shape = [1, self.chunk_len];
        Ok(NamedTensors::new()
            .with(INPUT_IDS, Tensor::from_i64(self.input_ids[start..end].to_vec(), shape)?)
            .with(
                POSITION_IDS,
                Tensor::from_i64(self.position_ids[start..end].to_vec(), shape)?,
            )
            .with(BATCH_INDEX, Tensor::from_i64(vec![slot as i64], [1, 1])?))
    }

    /// Offset of the last real token within the final chunk
    fn last_offset(&self) -> usize {
        (self.prompt_len - 1) % self.chunk_len
    }
}

/// First token of a slot and where it sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefillOutput {
    /// Target's greedy token after the prompt
    pub first_token: TokenId,
    /// Absolute position of that token (the prompt length)
    pub start_position: usize,
    /// Chunks run through each executor
    pub chunks: usize,
}

/// Prefill one slot on both executors.
///
/// Chunks run target first, then draft, with identical boundaries. Failures
/// are reported as [`Phase::Prefill`] execution errors.
pub fn prefill<D, T>(
    draft: &mut D,
    target: &mut T,
    prompt: &PaddedPrompt,
    slot: SlotId,
    vocab_size: usize,
) -> Result<PrefillOutput>
where
    D: Executor + ?Sized,
    T: Executor + ?Sized,
{
    let mut last = None;
    for index in 0..prompt.num_chunks() {
        let inputs = prompt.chunk(index, slot)?;
        let outputs = target
            .run(&inputs)
            .with_context(|| format!("target prefill chunk {} of slot {}", index, slot))
            .in_phase(Phase::Prefill)?;
        draft
            .run(&inputs)
            .with_context(|| format!("draft prefill chunk {} of slot {}", index, slot))
            .in_phase(Phase::Prefill)?;
        last = Some(outputs);
    }

    let outputs = last.ok_or_else(|| Error::execution(Phase::Prefill, "prompt produced no chunks"))?;
    let first_token = first_token(&outputs, prompt, vocab_size).in_phase(Phase::Prefill)?;
    debug!(slot, chunks = prompt.num_chunks(), first_token, "Prefilled slot");

    Ok(PrefillOutput {
        first_token,
        start_position: prompt.prompt_len(),
        chunks: prompt.num_chunks(),
    })
}

fn first_token(outputs: &NamedTensors, prompt: &PaddedPrompt, vocab_size: usize) -> Result<TokenId> {
    let logits = outputs.get(LOGITS)?;
    let column = match logits.dims() {
        [1, 1, v] if *v == vocab_size => 0,
        [1, s, v] if *s == prompt.chunk_len && *v == vocab_size => prompt.last_offset(),
        other => {
            return Err(Error::execution(
                Phase::Prefill,
                format!(
                    "prefill logits shape {:?} is neither [1, 1, {}] nor [1, {}, {}]",
                    other, vocab_size, prompt.chunk_len, vocab_size
                ),
            ))
        }
    };
    token_id(logits.argmax()?.get_i64(0, column)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn config() -> SpeculativeConfig {
        SpeculativeConfig::default()
            .with_prefill_seq_len(4)
            .with_ctx_len(16)
            .with_vocab_size(8)
            .with_pad_token_id(7)
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(5, 4, 16).unwrap(), 8);
        assert_eq!(padded_len(8, 4, 16).unwrap(), 8);
        assert_eq!(padded_len(1, 4, 16).unwrap(), 4);
        assert!(padded_len(13, 4, 12).unwrap_err().is_config());
        assert!(padded_len(0, 4, 16).unwrap_err().is_config());
    }

    #[test]
    fn test_padded_prompt_chunks() {
        let prompt = PaddedPrompt::new(&[1, 2, 3, 4, 5], &config()).unwrap();
        assert_eq!(prompt.padded_len(), 8);
        assert_eq!(prompt.num_chunks(), 2);
        assert_eq!(prompt.last_offset(), 0);

        let chunk = prompt.chunk(1, 3).unwrap();
        assert_eq!(chunk.get(INPUT_IDS).unwrap().as_i64().unwrap(), &[5, 7, 7, 7]);
        assert_eq!(
            chunk.get(POSITION_IDS).unwrap().as_i64().unwrap(),
            &[4, -1, -1, -1]
        );
        assert_eq!(chunk.get(BATCH_INDEX).unwrap().as_i64().unwrap(), &[3]);
        assert!(prompt.chunk(2, 3).is_err());
    }

    #[test]
    fn test_padded_prompt_rejects_out_of_vocab() {
        assert!(PaddedPrompt::new(&[1, 8], &config()).unwrap_err().is_config());
    }

    /// Scores one fixed token and records the chunks it saw
    struct Fixed {
        token: usize,
        full_chunk: bool,
        seen: Vec<Vec<i64>>,
    }

    impl Executor for Fixed {
        fn run(&mut self, inputs: &NamedTensors) -> Result<NamedTensors> {
            self.seen
                .push(inputs.get(INPUT_IDS)?.as_i64()?.to_vec());
            let seq = if self.full_chunk { 4 } else { 1 };
            let mut scores = vec![0.0f32; seq * 8];
            for row in scores.chunks_exact_mut(8) {
                row[self.token] = 1.0;
            }
            // Mark the last real position of a full-chunk output differently.
            if self.full_chunk {
                scores[self.token] = 0.0;
                scores[(self.token + 1) % 8] = 1.0;
            }
            Ok(NamedTensors::new().with(LOGITS, Tensor::from_f32(&scores, [1, seq, 8])?))
        }

        fn set_buffers(&mut self, _buffers: NamedTensors) -> Result<()> {
            Ok(())
        }

        fn skip_buffers(&mut self, _names: &BTreeSet<String>) -> Result<()> {
            Ok(())
        }

        fn input_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn output_names(&self) -> Vec<String> {
            vec![LOGITS.to_string()]
        }
    }

    fn fixed(token: usize, full_chunk: bool) -> Fixed {
        Fixed {
            token,
            full_chunk,
            seen: Vec::new(),
        }
    }

    #[test]
    fn test_prefill_runs_every_chunk_on_both_models() {
        let config = config();
        let prompt = PaddedPrompt::new(&[1, 2, 3, 4, 5, 6], &config).unwrap();
        let (mut draft, mut target) = (fixed(2, false), fixed(5, false));

        let out = prefill(&mut draft, &mut target, &prompt, 0, 8).unwrap();
        assert_eq!(out.first_token, 5);
        assert_eq!(out.start_position, 6);
        assert_eq!(out.chunks, 2);
        assert_eq!(draft.seen, target.seen);
        assert_eq!(target.seen[1], vec![5, 6, 7, 7]);
    }

    #[test]
    fn test_prefill_selects_last_real_position() {
        let config = config();
        // Last real token is the first of its chunk, which scores token + 1.
        let prompt = PaddedPrompt::new(&[1, 2, 3, 4, 5], &config).unwrap();
        let (mut draft, mut target) = (fixed(2, true), fixed(5, true));

        let out = prefill(&mut draft, &mut target, &prompt, 1, 8).unwrap();
        assert_eq!(out.first_token, 6);
    }

    #[test]
    fn test_prefill_rejects_bad_logits() {
        let config = config().with_vocab_size(9);
        let prompt = PaddedPrompt::new(&[1, 2], &config).unwrap();
        let (mut draft, mut target) = (fixed(2, false), fixed(5, false));

        let err = prefill(&mut draft, &mut target, &prompt, 0, 9).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Prefill));
    }
}
