//! Configuration types for specbatch
//!
//! The decode loop is driven by executors compiled for fixed tensor shapes,
//! so most of these values must agree with how the draft and target models
//! were compiled (prefill chunk length, context length, decode batch size
//! and number of speculative tokens).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Element types of the tensors exchanged with executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 64-bit signed integer (ids, positions, batch indices)
    Int64,
    /// 32-bit floating point
    Float32,
    /// 16-bit floating point
    Float16,
}

impl DataType {
    /// Get the size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Int64 => 8,
            DataType::Float32 => 4,
            DataType::Float16 => 2,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }
}

/// Speculative decoding configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of draft tokens proposed per round
    pub num_speculative_tokens: usize,

    /// Prompt chunk length both models were compiled for
    pub prefill_seq_len: usize,

    /// Context length (cache capacity per slot)
    pub ctx_len: usize,

    /// Number of decode batch rows (concurrent sequences)
    pub decode_batch_size: usize,

    /// Vocabulary size shared by both models
    pub vocab_size: usize,

    /// Token used to right-pad prompts
    pub pad_token_id: u32,

    /// Optional cap on generated tokens per slot
    pub max_new_tokens: Option<usize>,

    /// Consecutive zero-acceptance rounds tolerated per slot (None disables)
    pub zero_acceptance_limit: Option<usize>,

    /// Element type of the logits buffers
    pub logits_dtype: DataType,

    /// Device configuration
    pub device: DeviceConfig,

    /// Names of buffers managed by the executors themselves
    pub buffers: BufferNamingConfig,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            prefill_seq_len: 32,
            ctx_len: 128,
            decode_batch_size: 1,
            vocab_size: 32000,
            pad_token_id: 0,
            max_new_tokens: None,
            zero_acceptance_limit: Some(16),
            logits_dtype: DataType::Float32,
            device: DeviceConfig::default(),
            buffers: BufferNamingConfig::default(),
        }
    }
}

impl SpeculativeConfig {
    /// Parse a configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).with_context(format!("reading {}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Set the number of speculative tokens
    pub fn with_num_speculative_tokens(mut self, n: usize) -> Self {
        self.num_speculative_tokens = n;
        self
    }

    /// Set the prefill chunk length
    pub fn with_prefill_seq_len(mut self, len: usize) -> Self {
        self.prefill_seq_len = len;
        self
    }

    /// Set the context length
    pub fn with_ctx_len(mut self, len: usize) -> Self {
        self.ctx_len = len;
        self
    }

    /// Set the decode batch size
    pub fn with_decode_batch_size(mut self, size: usize) -> Self {
        self.decode_batch_size = size;
        self
    }

    /// Set the vocabulary size
    pub fn with_vocab_size(mut self, size: usize) -> Self {
        self.vocab_size = size;
        self
    }

    /// Set the padding token
    pub fn with_pad_token_id(mut self, token: u32) -> Self {
        self.pad_token_id = token;
        self
    }

    /// Cap generated tokens per slot
    pub fn with_max_new_tokens(mut self, max: usize) -> Self {
        self.max_new_tokens = Some(max);
        self
    }

    /// Set the zero-acceptance limit
    pub fn with_zero_acceptance_limit(mut self, limit: Option<usize>) -> Self {
        self.zero_acceptance_limit = limit;
        self
    }

    /// Set the accelerator device ids
    pub fn with_device_ids(mut self, ids: Vec<usize>) -> Self {
        self.device.device_ids = ids;
        self
    }

    /// Number of positions scored by one verification call (N + 1)
    pub fn num_logits_to_keep(&self) -> usize {
        self.num_speculative_tokens + 1
    }

    /// Generation budget of a prompt of the given length
    pub fn max_gen_len(&self, prompt_len: usize) -> usize {
        let budget = self.ctx_len.saturating_sub(prompt_len);
        match self.max_new_tokens {
            Some(cap) => budget.min(cap),
            None => budget,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_speculative_tokens", self.num_speculative_tokens),
            ("prefill_seq_len", self.prefill_seq_len),
            ("ctx_len", self.ctx_len),
            ("decode_batch_size", self.decode_batch_size),
            ("vocab_size", self.vocab_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{} must be positive", name)));
            }
        }

        if self.prefill_seq_len > self.ctx_len {
            return Err(Error::config(format!(
                "prefill_seq_len {} exceeds ctx_len {}",
                self.prefill_seq_len, self.ctx_len
            )));
        }

        if self.num_speculative_tokens >= self.ctx_len {
            return Err(Error::config(format!(
                "num_speculative_tokens {} must be smaller than ctx_len {}",
                self.num_speculative_tokens, self.ctx_len
            )));
        }

        if self.pad_token_id as usize >= self.vocab_size {
            return Err(Error::config(format!(
                "pad_token_id {} outside vocabulary of {}",
                self.pad_token_id, self.vocab_size
            )));
        }

        if !self.logits_dtype.is_float() {
            return Err(Error::config("logits_dtype must be a floating point type"));
        }

        if self.zero_acceptance_limit == Some(0) {
            return Err(Error::config("zero_acceptance_limit must be positive"));
        }

        Ok(())
    }
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Accelerator device ids the executors run on
    pub device_ids: Vec<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_ids: vec![0],
        }
    }
}

/// Naming rules for executor-managed cache buffers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferNamingConfig {
    /// Inputs starting with this prefix are cache state
    pub skip_input_prefix: String,

    /// Outputs ending with this suffix are retained cache state
    pub skip_output_suffix: String,
}

impl Default for BufferNamingConfig {
    fn default() -> Self {
        Self {
            skip_input_prefix: "past_".to_string(),
            skip_output_suffix: "_RetainedState".to_string(),
        }
    }
}
