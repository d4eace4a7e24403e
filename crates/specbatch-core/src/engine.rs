//! Speculative decoding engine
//!
//! The engine owns a draft and a target executor and drives them through a
//! generation run: every prompt is prefilled into its own decode batch row,
//! then draft proposal, target verification and round advancement alternate
//! until every slot has spent its budget. The output is token-for-token the
//! target model's greedy continuation.

use crate::config::SpeculativeConfig;
use crate::error::{Error, Result, ResultExt};
use crate::execution::{
    prefill, verify, DraftProposer, Executor, PaddedPrompt, RoundAdvancer, Specialization,
    SpeculativeStats,
};
use crate::memory::{BufferPool, DecodeInputs, PrecodeInputs};
use crate::observer::{RoundObserver, RoundReport, TracingObserver};
use crate::scheduler::SlotTable;
use crate::types::{GenerationOutput, Phase, TokenId};
use std::collections::BTreeSet;

/// Drives a draft and a target executor through speculative decoding
pub struct SpeculativeEngine<D: Executor, T: Executor> {
    /// Engine configuration
    config: SpeculativeConfig,

    /// Proposal model
    draft: D,

    /// Verified model
    target: T,

    /// Logits buffers bound to both executors
    pool: BufferPool,

    /// Receiver of decode-loop events
    observer: Box<dyn RoundObserver>,
}

impl<D: Executor, T: Executor> SpeculativeEngine<D, T> {
    /// Create an engine.
    ///
    /// Validates the configuration against the executors' compiled shapes and
    /// hands the cache buffers over to the executors.
    pub fn new(config: SpeculativeConfig, mut draft: D, mut target: T) -> Result<Self> {
        config.validate()?;
        if config.device.device_ids.is_empty() {
            return Err(Error::DeviceUnavailable(
                "no accelerator device ids configured".to_string(),
            ));
        }

        let decode_shape = Specialization::new(config.decode_batch_size, 1);
        let prefill_shape = Specialization::new(1, config.prefill_seq_len);
        let precode_shape = Specialization::new(config.decode_batch_size, config.num_logits_to_keep());
        check_specializations("draft", &draft.specializations(), &[prefill_shape, decode_shape])?;
        check_specializations("target", &target.specializations(), &[prefill_shape, precode_shape])?;

        skip_cache_buffers(&config, &mut draft)
            .context("draft")
            .in_phase(Phase::Setup)?;
        skip_cache_buffers(&config, &mut target)
            .context("target")
            .in_phase(Phase::Setup)?;

        tracing::info!(
            "Speculative engine ready: {} draft tokens/round, {} decode rows, ctx_len {}, prefill_seq_len {}",
            config.num_speculative_tokens,
            config.decode_batch_size,
            config.ctx_len,
            config.prefill_seq_len
        );

        Ok(Self {
            pool: BufferPool::new(&config),
            config,
            draft,
            target,
            observer: Box::new(TracingObserver),
        })
    }

    /// Replace the round observer
    pub fn with_observer(mut self, observer: impl RoundObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &SpeculativeConfig {
        &self.config
    }

    /// Get the draft executor
    pub fn draft(&self) -> &D {
        &self.draft
    }

    /// Get the target executor
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Get the logits buffer pool
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Generate greedily for up to `decode_batch_size` prompts.
    ///
    /// Prompt `i` occupies decode row `i`. Every prompt is checked before
    /// the first executor call, so configuration errors leave the executors
    /// untouched.
    pub fn generate(&mut self, prompts: &[Vec<TokenId>]) -> Result<GenerationOutput> {
        let config = &self.config;
        let batch_size = config.decode_batch_size;
        let k = config.num_speculative_tokens;

        if prompts.len() > batch_size {
            return Err(Error::config(format!(
                "{} prompts exceed decode batch of {}",
                prompts.len(),
                batch_size
            )));
        }
        let padded = prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| PaddedPrompt::new(prompt, config).with_context(|| format!("prompt {}", i)))
            .collect::<Result<Vec<_>>>()?;

        let mut stats = SpeculativeStats::default();
        let mut slots = SlotTable::new(batch_size);
        let mut decode = DecodeInputs::new(batch_size, config.pad_token_id).in_phase(Phase::Setup)?;
        let mut precode = PrecodeInputs::new(batch_size, k).in_phase(Phase::Setup)?;

        self.pool
            .bind_prefill(&mut self.draft, &mut self.target)
            .context("binding prefill logits")
            .in_phase(Phase::Setup)?;

        for (slot, prompt) in padded.iter().enumerate() {
            let out = prefill(
                &mut self.draft,
                &mut self.target,
                prompt,
                slot,
                config.vocab_size,
            )?;
            stats.draft_calls += out.chunks;
            stats.target_calls += out.chunks;

            let max_gen_len = config.max_gen_len(prompt.prompt_len());
            let admitted = slots.admit(slot, prompt.prompt_len(), max_gen_len, out.first_token)?;
            self.observer
                .on_prefill(slot, prompt.prompt_len(), out.first_token);
            if !admitted.is_active() {
                self.observer.on_slot_finished(slot, admitted.generated().len());
                continue;
            }
            decode
                .set_seed(slot, out.first_token, out.start_position)
                .in_phase(Phase::Prefill)?;
            precode
                .set_seed(slot, out.first_token, out.start_position)
                .in_phase(Phase::Prefill)?;
        }

        self.pool
            .bind_decode(&mut self.draft, &mut self.target)
            .context("binding decode logits")
            .in_phase(Phase::Setup)?;

        let proposer = DraftProposer::new(k);
        let advancer = RoundAdvancer::new(config);
        let mut active = slots.active_set();
        let mut round = 0;

        while !active.is_empty() {
            let proposal = proposer.propose(
                &mut self.draft,
                &self.pool,
                &mut decode,
                &mut precode,
                &active,
            )?;
            stats.draft_calls += proposal.calls;
            if proposal.replayed_bonus {
                stats.bonus_replays += 1;
            }

            let verification = verify(&mut self.target, &self.pool, &precode, &active, k)?;
            stats.target_calls += 1;

            let outcome = advancer.advance(&mut slots, &verification, &mut decode, &mut precode)?;
            stats.record_round(&verification.accepted_counts(), k, outcome.appended);

            let report = RoundReport::new(round, &verification, &outcome, proposal.replayed_bonus);
            self.observer.on_round(&report);
            for &slot in &outcome.finished {
                let generated = slots.get(slot).map_or(0, |s| s.generated().len());
                self.observer.on_slot_finished(slot, generated);
            }

            active = outcome.active;
            round += 1;
        }

        let output = GenerationOutput {
            slots: slots.into_outputs(),
            stats,
        };
        tracing::info!(
            "Generated {} tokens for {} slots in {} rounds ({})",
            output.total_tokens(),
            output.slots.len(),
            output.stats.rounds,
            output.stats
        );
        Ok(output)
    }
}

/// Require every needed shape when an executor declares what it was compiled for
fn check_specializations(model: &str, declared: &[Specialization], needed: &[Specialization]) -> Result<()> {
    if declared.is_empty() {
        return Ok(());
    }
    for shape in needed {
        if !declared.contains(shape) {
            return Err(Error::config(format!(
                "{} executor has no specialization for batch {} x seq {}",
                model, shape.batch_size, shape.seq_len
            )));
        }
    }
    Ok(())
}

/// Hand cache inputs and retained-state outputs over to the executor
fn skip_cache_buffers<E: Executor + ?Sized>(config: &SpeculativeConfig, executor: &mut E) -> Result<()> {
    let naming = &config.buffers;
    let names: BTreeSet<String> = executor
        .input_names()
        .into_iter()
        .filter(|name| name.starts_with(&naming.skip_input_prefix))
        .chain(
            executor
                .output_names()
                .into_iter()
                .filter(|name| name.ends_with(&naming.skip_output_suffix)),
        )
        .collect();
    tracing::debug!(?names, "Skipping cache buffers");
    executor.skip_buffers(&names)
}
