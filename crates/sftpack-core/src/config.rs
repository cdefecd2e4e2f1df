//! Configuration types for sftpack.

use crate::{FormatType, Result, SftPackError, TextBudget, DEFAULT_MAX_TOKENS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Instruction framing for one dataset type.
///
/// The wording is policy, not code: it is supplied per `dataset_type` by the
/// configuration that selects the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPolicy {
    /// System message attached to every record.
    #[serde(default = "default_system_prompt")]
    pub system: String,

    /// Instruction placed in the user turn ahead of the raw input.
    #[serde(default)]
    pub instruction: String,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            system: default_system_prompt(),
            instruction: String::new(),
        }
    }
}

impl PromptPolicy {
    /// Policy with the given instruction and the default system prompt.
    pub fn with_instruction(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Default::default()
        }
    }
}

/// What to do with an example longer than a whole block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep the first `block_length` tokens in a block of its own.
    #[default]
    Truncate,
    /// Drop the example.
    Skip,
}

/// Sequence packing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingConfig {
    /// Length of every emitted block.
    #[serde(default = "default_block_length")]
    pub block_length: usize,

    /// Token id used for padding. Falls back to the tokenizer's pad/EOS token.
    #[serde(default)]
    pub pad_token_id: Option<u32>,

    /// Examples shorter than this are dropped (and counted).
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Overlong example policy.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Examples per independently packed shard. `None` packs in one pass.
    #[serde(default)]
    pub shard_size: Option<usize>,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            block_length: default_block_length(),
            pad_token_id: None,
            min_length: default_min_length(),
            overflow: OverflowPolicy::default(),
            shard_size: None,
        }
    }
}

impl PackingConfig {
    /// Create a config with the given block length.
    pub fn with_block_length(block_length: usize) -> Self {
        Self {
            block_length,
            ..Default::default()
        }
    }

    /// Set the padding token.
    pub fn with_pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = Some(pad_token_id);
        self
    }

    /// Set the minimum example length.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Pack in shards of `shard_size` examples.
    pub fn with_shard_size(mut self, shard_size: usize) -> Self {
        self.shard_size = Some(shard_size);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_length == 0 {
            return Err(SftPackError::InvalidArgument(
                "block_length must be positive".to_string(),
            ));
        }
        if self.shard_size == Some(0) {
            return Err(SftPackError::InvalidArgument(
                "shard_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chat template used to render conversations before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// `<|im_start|>role\ncontent<|im_end|>`
    #[default]
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>\n\ncontent<|eot_id|>`
    Llama3,
    /// `### Instruction:` / `### Input:` / `### Response:`
    Alpaca,
}

/// Engine configuration, built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to a `tokenizer.json`. Required for tokenization and packing.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,

    /// Per-field token budget (4 characters per token).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Default format type for conversion.
    #[serde(default)]
    pub format_type: FormatType,

    /// Default dataset type for conversion (`""` means generic).
    #[serde(default)]
    pub dataset_type: String,

    /// Instruction policies keyed by dataset type.
    #[serde(default)]
    pub prompts: HashMap<String, PromptPolicy>,

    /// Chat template for record encoding.
    #[serde(default)]
    pub template: TemplateKind,

    /// Packing configuration.
    #[serde(default)]
    pub packing: PackingConfig,

    /// Worker threads for data-parallel stages (`None` = one per core).
    #[serde(default)]
    pub num_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: None,
            max_tokens: default_max_tokens(),
            format_type: FormatType::default(),
            dataset_type: String::new(),
            prompts: HashMap::new(),
            template: TemplateKind::default(),
            packing: PackingConfig::default(),
            num_threads: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Text budget derived from `max_tokens`.
    pub fn budget(&self) -> TextBudget {
        TextBudget::new(self.max_tokens)
    }

    /// Policy for a dataset type, falling back to the default policy.
    pub fn policy_for(&self, dataset_type: &str) -> PromptPolicy {
        self.prompts.get(dataset_type).cloned().unwrap_or_default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(SftPackError::Config(
                "max_tokens must be positive".to_string(),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(SftPackError::Config(
                "num_threads must be positive".to_string(),
            ));
        }
        self.packing
            .validate()
            .map_err(|e| SftPackError::Config(e.to_string()))
    }
}

// Default value functions
fn default_system_prompt() -> String {
    "You are a helpful coding assistant.".to_string()
}
fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}
fn default_block_length() -> usize {
    2048
}
fn default_min_length() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_tokens, 32_000);
        assert_eq!(config.budget().char_limit(), 128_000);
        assert_eq!(config.packing.block_length, 2048);
        assert_eq!(config.packing.overflow, OverflowPolicy::Truncate);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
max_tokens: 1000
format_type: sharegpt
dataset_type: rust_explanation
template: llama3
prompts:
  rust_explanation:
    instruction: "Explain this Rust code."
packing:
  block_length: 512
  pad_token_id: 7
  overflow: skip
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max_tokens, 1000);
        assert_eq!(config.format_type, FormatType::ShareGpt);
        assert_eq!(config.template, TemplateKind::Llama3);
        assert_eq!(config.packing.block_length, 512);
        assert_eq!(config.packing.pad_token_id, Some(7));
        assert_eq!(config.packing.overflow, OverflowPolicy::Skip);
        assert_eq!(config.packing.min_length, 1);

        let policy = config.policy_for("rust_explanation");
        assert_eq!(policy.instruction, "Explain this Rust code.");
        assert_eq!(policy.system, "You are a helpful coding assistant.");
        assert_eq!(config.policy_for("starcoder"), PromptPolicy::default());
    }

    #[test]
    fn test_from_yaml_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_tokens: 10").unwrap();
        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.budget().char_limit(), 40);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = EngineConfig {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            packing: PackingConfig::with_block_length(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(PackingConfig::default().with_shard_size(0).validate().is_err());
    }
}
