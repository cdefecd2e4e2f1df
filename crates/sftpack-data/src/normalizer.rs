//! Record normalization: raw dataset rows to conversation records.
//!
//! Each dataset type has one [`NormalizeStrategy`], looked up by tag in a
//! [`StrategyRegistry`]. Adding a dataset type means registering another
//! strategy; nothing here branches on the tag.
//!
//! Built-in tags:
//!
//! | tag                | raw shape                      |
//! |--------------------|--------------------------------|
//! | `starcoder`        | `{"content": ...}`             |
//! | `rust_explanation` | `{"input": ..., "output": ...}`|
//! | `generic` (or `""`)| `{"content": ..., "role": ...}`|
//!
//! With `format_type = sharegpt`, any record may instead carry a
//! `conversations` (`{from, value}`) or `messages` (`{role, content}`) list,
//! which is taken as the conversation itself.

use serde::Deserialize;
use serde_json::{Map, Value};
use sftpack_core::{
    ConversationRecord, ConversationTurn, FormatType, NormalizeContext, NormalizeStrategy,
    RecordError, Result, Role, SftPackError, Speaker,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Tag of the starcoder strategy.
pub const STARCODER: &str = "starcoder";
/// Tag of the rust explanation strategy.
pub const RUST_EXPLANATION: &str = "rust_explanation";
/// Tag of the generic strategy.
pub const GENERIC: &str = "generic";

/// Registry of normalization strategies keyed by dataset type.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn NormalizeStrategy>>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StarcoderStrategy));
        registry.register(Arc::new(RustExplanationStrategy));
        registry.register(Arc::new(GenericStrategy));
        registry
    }

    /// Register a strategy under its own tag, returning any strategy it replaced.
    pub fn register(
        &mut self,
        strategy: Arc<dyn NormalizeStrategy>,
    ) -> Option<Arc<dyn NormalizeStrategy>> {
        self.strategies
            .insert(strategy.name().to_string(), strategy)
    }

    /// Canonical tag for a dataset type (`""` is generic).
    pub fn canonical_tag(dataset_type: &str) -> &str {
        let tag = dataset_type.trim();
        if tag.is_empty() {
            GENERIC
        } else {
            tag
        }
    }

    /// Look up the strategy for a dataset type.
    pub fn resolve(&self, dataset_type: &str) -> Result<Arc<dyn NormalizeStrategy>> {
        let tag = Self::canonical_tag(dataset_type);
        self.strategies.get(tag).cloned().ok_or_else(|| {
            SftPackError::Config(format!(
                "unknown dataset_type `{tag}`; registered: {}",
                self.tags().join(", ")
            ))
        })
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

/// Parse one serialized raw record into a JSON object.
pub fn parse_raw(line: &str) -> std::result::Result<Value, RecordError> {
    serde_json::from_str(line).map_err(|e| RecordError::Parse(e.to_string()))
}

/// Raw starcoder row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StarcoderRecord {
    /// Source code.
    pub content: String,
}

/// Raw rust explanation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RustExplanationRecord {
    /// Code or question.
    pub input: String,
    /// Explanation.
    pub output: String,
}

/// Raw generic row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericRecord {
    /// Turn text.
    pub content: String,
    /// Raw role name, `user` when absent.
    pub role: String,
}

impl StarcoderRecord {
    fn from_object(obj: &mut Map<String, Value>) -> std::result::Result<Self, RecordError> {
        Ok(Self {
            content: take_string(obj, "content")?,
        })
    }
}

impl RustExplanationRecord {
    fn from_object(obj: &mut Map<String, Value>) -> std::result::Result<Self, RecordError> {
        Ok(Self {
            input: take_string(obj, "input")?,
            output: take_string(obj, "output")?,
        })
    }
}

impl GenericRecord {
    fn from_object(obj: &mut Map<String, Value>) -> std::result::Result<Self, RecordError> {
        let content = take_string(obj, "content")?;
        let role = match obj.remove("role") {
            None | Some(Value::Null) => "user".to_string(),
            Some(Value::String(role)) => role,
            Some(other) => {
                return Err(RecordError::Field {
                    field: "role",
                    reason: format!("expected string, got {}", json_type(&other)),
                })
            }
        };
        Ok(Self { content, role })
    }
}

/// Code sample as the response to a configured instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct StarcoderStrategy;

impl NormalizeStrategy for StarcoderStrategy {
    fn name(&self) -> &str {
        STARCODER
    }

    fn normalize(
        &self,
        raw: Value,
        ctx: &mut NormalizeContext<'_>,
    ) -> std::result::Result<ConversationRecord, RecordError> {
        let mut obj = into_object(raw)?;
        if let Some(record) = conversation_from_list(&mut obj, ctx)? {
            return Ok(record);
        }
        let raw = StarcoderRecord::from_object(&mut obj)?;
        let content = ctx.clip(raw.content);
        let policy = ctx.policy();

        Ok(ConversationRecord {
            prompt: vec![ConversationTurn::user(policy.instruction.clone())],
            response: vec![ConversationTurn::assistant(content)],
            system: Some(policy.system.clone()),
            tools: Some(String::new()),
            images: None,
            videos: None,
        })
    }
}

/// Input/output explanation pairs.
///
/// The budget clips the raw `input` and `output` fields. The user turn is the
/// policy instruction joined to the clipped input, so it can run past the
/// budget by the instruction's length.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustExplanationStrategy;

impl NormalizeStrategy for RustExplanationStrategy {
    fn name(&self) -> &str {
        RUST_EXPLANATION
    }

    fn normalize(
        &self,
        raw: Value,
        ctx: &mut NormalizeContext<'_>,
    ) -> std::result::Result<ConversationRecord, RecordError> {
        let mut obj = into_object(raw)?;
        if let Some(record) = conversation_from_list(&mut obj, ctx)? {
            return Ok(record);
        }
        let raw = RustExplanationRecord::from_object(&mut obj)?;
        let input = ctx.clip(raw.input);
        let output = ctx.clip(raw.output);
        let policy = ctx.policy();

        let user = if policy.instruction.is_empty() {
            input
        } else {
            format!("{}\n\n{}", policy.instruction, input)
        };

        Ok(ConversationRecord {
            prompt: vec![ConversationTurn::user(user)],
            response: vec![ConversationTurn::assistant(output)],
            system: Some(policy.system.clone()),
            tools: Some(String::new()),
            images: None,
            videos: None,
        })
    }
}

/// Pass-through of a single `content`/`role` turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericStrategy;

impl NormalizeStrategy for GenericStrategy {
    fn name(&self) -> &str {
        GENERIC
    }

    fn normalize(
        &self,
        raw: Value,
        ctx: &mut NormalizeContext<'_>,
    ) -> std::result::Result<ConversationRecord, RecordError> {
        let mut obj = into_object(raw)?;
        if let Some(record) = conversation_from_list(&mut obj, ctx)? {
            return Ok(record);
        }
        let raw = GenericRecord::from_object(&mut obj)?;
        let speaker = Speaker::parse(&raw.role)?;
        let content = ctx.clip(raw.content);

        let mut record = ConversationRecord {
            system: Some(ctx.policy().system.clone()),
            tools: Some(String::new()),
            ..Default::default()
        };
        match speaker {
            Speaker::System => record.system = Some(content),
            Speaker::Turn(role) => record.prompt.push(ConversationTurn::new(role, content)),
        }
        Ok(record)
    }
}

/// ShareGPT message.
#[derive(Debug, Deserialize)]
struct ShareGptMessage {
    from: String,
    value: String,
}

/// OpenAI-style message.
#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

/// Interpret a pre-existing turn list, if the format allows one and the record has one.
///
/// `system` turns go to the system field (first one wins); a trailing
/// assistant turn becomes the response; everything before it is prompt.
fn conversation_from_list(
    obj: &mut Map<String, Value>,
    ctx: &mut NormalizeContext<'_>,
) -> std::result::Result<Option<ConversationRecord>, RecordError> {
    if ctx.format() != FormatType::ShareGpt {
        return Ok(None);
    }

    let raw_turns: Vec<(String, String)> = if let Some(list) = obj.remove("conversations") {
        let messages: Vec<ShareGptMessage> =
            serde_json::from_value(list).map_err(|e| RecordError::Field {
                field: "conversations",
                reason: e.to_string(),
            })?;
        messages.into_iter().map(|m| (m.from, m.value)).collect()
    } else if let Some(list) = obj.remove("messages") {
        let messages: Vec<OpenAiMessage> =
            serde_json::from_value(list).map_err(|e| RecordError::Field {
                field: "messages",
                reason: e.to_string(),
            })?;
        messages.into_iter().map(|m| (m.role, m.content)).collect()
    } else {
        return Ok(None);
    };

    let mut system: Option<String> = None;
    let mut turns = Vec::with_capacity(raw_turns.len());
    for (role, content) in raw_turns {
        let speaker = Speaker::parse(&role)?;
        let content = ctx.clip(content);
        match speaker {
            Speaker::System => {
                if system.is_none() {
                    system = Some(content);
                }
            }
            Speaker::Turn(role) => turns.push(ConversationTurn::new(role, content)),
        }
    }

    let response = match turns.last() {
        Some(last) if last.role == Role::Assistant => turns.pop().into_iter().collect(),
        _ => Vec::new(),
    };

    Ok(Some(ConversationRecord {
        prompt: turns,
        response,
        system: Some(system.unwrap_or_else(|| ctx.policy().system.clone())),
        tools: Some(String::new()),
        images: None,
        videos: None,
    }))
}

fn into_object(raw: Value) -> std::result::Result<Map<String, Value>, RecordError> {
    match raw {
        Value::Object(obj) => Ok(obj),
        other => Err(RecordError::NotAnObject(json_type(&other))),
    }
}

fn take_string(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> std::result::Result<String, RecordError> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        None | Some(Value::Null) => Err(RecordError::missing(field)),
        Some(other) => Err(RecordError::Field {
            field,
            reason: format!("expected string, got {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
