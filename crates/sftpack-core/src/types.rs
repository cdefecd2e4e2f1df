//! Canonical conversation data model.

use crate::{RecordError, Result, SftPackError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a turn in the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Human side of the conversation.
    User,
    /// Model side of the conversation.
    Assistant,
}

impl Role {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// The role expected to follow this one.
    #[must_use]
    pub const fn other(&self) -> Self {
        match self {
            Self::User => Self::Assistant,
            Self::Assistant => Self::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a raw turn before it is placed in the canonical schema.
///
/// Raw datasets use several spellings; `system` turns are lifted out of the
/// prompt into the record's `system` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// System / instruction preamble.
    System,
    /// A conversational role.
    Turn(Role),
}

impl Speaker {
    /// Parse a raw role name (`user`, `human`, `assistant`, `gpt`, `model`, `system`).
    pub fn parse(raw: &str) -> std::result::Result<Self, RecordError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Ok(Self::Turn(Role::User)),
            "assistant" | "gpt" | "model" | "bot" => Ok(Self::Turn(Role::Assistant)),
            "system" => Ok(Self::System),
            _ => Err(RecordError::UnsupportedRole(raw.to_string())),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Turn text.
    pub content: String,
    /// Who said it.
    pub role: Role,
}

impl ConversationTurn {
    /// Create a turn.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
        }
    }

    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Canonical conversation record, one per input row.
///
/// After finalization every record satisfies [`ConversationRecord::validate`]:
/// an odd-length prompt alternating from `user`, exactly one `assistant`
/// response turn, and `system`/`tools` present (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Prompt turns.
    pub prompt: Vec<ConversationTurn>,
    /// Response turns.
    pub response: Vec<ConversationTurn>,
    /// System message.
    #[serde(default)]
    pub system: Option<String>,
    /// Tool description.
    #[serde(default)]
    pub tools: Option<String>,
    /// Image references (unused by the engine).
    #[serde(default)]
    pub images: Option<Vec<String>>,
    /// Video references (unused by the engine).
    #[serde(default)]
    pub videos: Option<Vec<String>>,
}

impl ConversationRecord {
    /// The schema-valid record substituted for a malformed input row.
    pub fn empty() -> Self {
        Self {
            prompt: vec![ConversationTurn::user("")],
            response: vec![ConversationTurn::assistant("")],
            system: Some(String::new()),
            tools: Some(String::new()),
            images: None,
            videos: None,
        }
    }

    /// System text, empty when absent.
    pub fn system_text(&self) -> &str {
        self.system.as_deref().unwrap_or_default()
    }

    /// Tools text, empty when absent.
    pub fn tools_text(&self) -> &str {
        self.tools.as_deref().unwrap_or_default()
    }

    /// Check the canonical-schema invariants.
    ///
    /// Returns [`SftPackError::InvariantViolation`] naming the first broken rule.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.len() % 2 == 0 {
            return Err(SftPackError::InvariantViolation(format!(
                "prompt has even length {}",
                self.prompt.len()
            )));
        }
        for (i, turn) in self.prompt.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            if turn.role != expected {
                return Err(SftPackError::InvariantViolation(format!(
                    "prompt turn {i} has role {}, expected {expected}",
                    turn.role
                )));
            }
        }
        match self.response.as_slice() {
            [turn] if turn.role == Role::Assistant => {}
            [turn] => {
                return Err(SftPackError::InvariantViolation(format!(
                    "response turn has role {}",
                    turn.role
                )))
            }
            other => {
                return Err(SftPackError::InvariantViolation(format!(
                    "response has {} turns, expected 1",
                    other.len()
                )))
            }
        }
        if self.system.is_none() || self.tools.is_none() {
            return Err(SftPackError::InvariantViolation(
                "system/tools not defaulted".to_string(),
            ));
        }
        Ok(())
    }
}

/// How multi-turn vs single-turn raw shapes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    /// Instruction / output pairs.
    #[default]
    Alpaca,
    /// Pre-existing multi-turn conversation lists.
    ShareGpt,
}

impl FormatType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alpaca => "alpaca",
            Self::ShareGpt => "sharegpt",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatType {
    type Err = SftPackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alpaca" => Ok(Self::Alpaca),
            "sharegpt" => Ok(Self::ShareGpt),
            other => Err(SftPackError::InvalidArgument(format!(
                "unknown format_type `{other}`, expected `alpaca` or `sharegpt`"
            ))),
        }
    }
}
