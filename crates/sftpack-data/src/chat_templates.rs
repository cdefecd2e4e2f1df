//! Chat templates and record encoding.
//!
//! A [`ChatTemplate`] renders a finalized [`ConversationRecord`] into ordered
//! [`TemplateSegment`]s. Only the response body and its end-of-turn marker
//! are trainable; the system message, prompt turns and role headers are not.
//! [`RecordEncoder`] tokenizes the segments and turns segment trainability
//! into a per-token loss mask.

use crate::TokenizedExample;
use sftpack_core::{ConversationRecord, Result, SftPackError, TemplateKind, TokenCodec};

/// A contiguous piece of rendered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSegment {
    /// Rendered text.
    pub text: String,
    /// Whether tokens of this segment contribute to the loss.
    pub trainable: bool,
}

impl TemplateSegment {
    fn context(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trainable: false,
        }
    }

    fn target(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trainable: true,
        }
    }
}

/// Result of applying a chat template.
#[derive(Debug, Clone)]
pub struct FormattedChat {
    /// The full formatted text.
    pub text: String,
    /// Byte offset where the response begins.
    pub response_start: usize,
    /// The template used.
    pub kind: TemplateKind,
}

impl FormattedChat {
    /// Get the prompt portion (before response).
    pub fn prompt(&self) -> &str {
        &self.text[..self.response_start]
    }

    /// Get the response portion.
    pub fn response(&self) -> &str {
        &self.text[self.response_start..]
    }
}

/// Chat template configuration and application.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    /// The template kind.
    pub kind: TemplateKind,
    /// BOS token (optional).
    pub bos_token: Option<String>,
    /// End-of-response token.
    pub eos_token: String,
    /// Whether to add BOS at the start.
    pub add_bos: bool,
    /// Whether to close the response with the EOS token.
    pub add_eos: bool,
}

impl ChatTemplate {
    /// Create a template of the given kind.
    pub fn new(kind: TemplateKind) -> Self {
        let (bos_token, eos_token) = match kind {
            TemplateKind::ChatMl => (None, "<|im_end|>"),
            TemplateKind::Llama3 => (Some("<|begin_of_text|>".to_string()), "<|eot_id|>"),
            TemplateKind::Alpaca => (None, "</s>"),
        };
        Self {
            kind,
            add_bos: bos_token.is_some(),
            bos_token,
            eos_token: eos_token.to_string(),
            add_eos: true,
        }
    }

    /// Create a ChatML template.
    pub fn chatml() -> Self {
        Self::new(TemplateKind::ChatMl)
    }

    /// Create a Llama-3 template.
    pub fn llama3() -> Self {
        Self::new(TemplateKind::Llama3)
    }

    /// Create an Alpaca template.
    pub fn alpaca() -> Self {
        Self::new(TemplateKind::Alpaca)
    }

    /// Set whether to add BOS token.
    pub fn with_add_bos(mut self, add_bos: bool) -> Self {
        self.add_bos = add_bos;
        self
    }

    /// Set whether to add EOS token.
    pub fn with_add_eos(mut self, add_eos: bool) -> Self {
        self.add_eos = add_eos;
        self
    }

    /// Render a record into segments. Empty segments are omitted.
    pub fn render(&self, record: &ConversationRecord) -> Vec<TemplateSegment> {
        let (context, response) = match self.kind {
            TemplateKind::ChatMl => self.render_chatml(record),
            TemplateKind::Llama3 => self.render_llama3(record),
            TemplateKind::Alpaca => self.render_alpaca(record),
        };

        let mut target = response;
        if self.add_eos {
            target.push_str(&self.eos_token);
        }

        [TemplateSegment::context(context), TemplateSegment::target(target)]
            .into_iter()
            .filter(|segment| !segment.text.is_empty())
            .collect()
    }

    /// Format a record as one string with the response offset.
    pub fn apply(&self, record: &ConversationRecord) -> FormattedChat {
        let mut text = String::new();
        let mut response_start = None;
        for segment in self.render(record) {
            if segment.trainable && response_start.is_none() {
                response_start = Some(text.len());
            }
            text.push_str(&segment.text);
        }
        FormattedChat {
            response_start: response_start.unwrap_or(text.len()),
            text,
            kind: self.kind,
        }
    }

    fn response_text(record: &ConversationRecord) -> String {
        record
            .response
            .first()
            .map(|turn| turn.content.clone())
            .unwrap_or_default()
    }

    fn render_chatml(&self, record: &ConversationRecord) -> (String, String) {
        let mut text = String::new();
        if !record.system_text().is_empty() {
            text.push_str(&format!(
                "<|im_start|>system\n{}<|im_end|>\n",
                record.system_text()
            ));
        }
        for turn in &record.prompt {
            text.push_str(&format!(
                "<|im_start|>{}\n{}<|im_end|>\n",
                turn.role, turn.content
            ));
        }
        text.push_str("<|im_start|>assistant\n");
        (text, Self::response_text(record))
    }

    fn render_llama3(&self, record: &ConversationRecord) -> (String, String) {
        let mut text = String::new();
        if self.add_bos {
            if let Some(ref bos) = self.bos_token {
                text.push_str(bos);
            }
        }
        if !record.system_text().is_empty() {
            text.push_str(&format!(
                "<|start_header_id|>system<|end_header_id|>\n\n{}<|eot_id|>",
                record.system_text()
            ));
        }
        for turn in &record.prompt {
            text.push_str(&format!(
                "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                turn.role, turn.content
            ));
        }
        text.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        (text, Self::response_text(record))
    }

    fn render_alpaca(&self, record: &ConversationRecord) -> (String, String) {
        let mut text = String::new();

        if !record.system_text().is_empty() {
            text.push_str("### Instruction:\n");
            text.push_str(record.system_text());
            text.push_str("\n\n");
        }

        let input = record
            .prompt
            .iter()
            .map(|turn| turn.content.as_str())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if !input.is_empty() {
            text.push_str("### Input:\n");
            text.push_str(&input);
            text.push_str("\n\n");
        }

        text.push_str("### Response:\n");
        (text, Self::response_text(record))
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::new(TemplateKind::default())
    }
}

/// Turns conversation records into tokenized examples with loss masks.
pub struct RecordEncoder<'a> {
    template: &'a ChatTemplate,
    codec: &'a dyn TokenCodec,
}

impl<'a> RecordEncoder<'a> {
    /// Create an encoder.
    pub fn new(template: &'a ChatTemplate, codec: &'a dyn TokenCodec) -> Self {
        Self { template, codec }
    }

    /// Encode one record.
    pub fn encode(&self, record: &ConversationRecord) -> Result<TokenizedExample> {
        self.encode_batch(std::slice::from_ref(record))?
            .pop()
            .ok_or_else(|| SftPackError::InvariantViolation("encoder returned no rows".into()))
    }

    /// Encode a batch of records, preserving order.
    ///
    /// All segments of the batch go through a single `encode_batch` call.
    pub fn encode_batch(&self, records: &[ConversationRecord]) -> Result<Vec<TokenizedExample>> {
        let rendered: Vec<Vec<TemplateSegment>> =
            records.iter().map(|r| self.template.render(r)).collect();
        let texts: Vec<&str> = rendered
            .iter()
            .flatten()
            .map(|segment| segment.text.as_str())
            .collect();

        let encoded = self.codec.encode_batch(&texts)?;
        if encoded.len() != texts.len() {
            return Err(SftPackError::InvariantViolation(format!(
                "codec returned {} sequences for {} segments",
                encoded.len(),
                texts.len()
            )));
        }

        let mut encoded = encoded.into_iter();
        let mut examples = Vec::with_capacity(records.len());
        for segments in &rendered {
            let mut token_ids = Vec::new();
            let mut loss_mask = Vec::new();
            for (segment, ids) in segments.iter().zip(encoded.by_ref()) {
                loss_mask.extend(std::iter::repeat(segment.trainable).take(ids.len()));
                token_ids.extend(ids);
            }
            examples.push(TokenizedExample::new(token_ids, loss_mask)?);
        }
        Ok(examples)
    }
}
