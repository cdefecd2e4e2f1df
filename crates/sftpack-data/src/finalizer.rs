//! Schema finalizer.
//!
//! Brings any normalized record into the canonical shape: an odd-length
//! prompt alternating from `user`, exactly one `assistant` response turn, and
//! `system`/`tools` present. Applied to every record regardless of strategy.

use sftpack_core::{ConversationRecord, ConversationTurn, Role};

/// Repair a record so that it satisfies [`ConversationRecord::validate`].
///
/// Pure and idempotent: finalizing a finalized record returns it unchanged.
pub fn finalize(mut record: ConversationRecord) -> ConversationRecord {
    record.prompt = repair_alternation(record.prompt);

    if record.prompt.len() % 2 == 0 {
        record.prompt.push(ConversationTurn::user(""));
    }

    record.response.truncate(1);
    match record.response.first_mut() {
        Some(turn) => turn.role = Role::Assistant,
        None => record.response.push(ConversationTurn::assistant("")),
    }

    record.system.get_or_insert_with(String::new);
    record.tools.get_or_insert_with(String::new);
    record.images = None;
    record.videos = None;
    record
}

/// Insert empty turns wherever the role sequence breaks `user, assistant, ...`.
fn repair_alternation(turns: Vec<ConversationTurn>) -> Vec<ConversationTurn> {
    let mut repaired = Vec::with_capacity(turns.len() + 1);
    let mut expected = Role::User;
    for turn in turns {
        if turn.role != expected {
            repaired.push(ConversationTurn::new(expected, ""));
        }
        expected = turn.role.other();
        repaired.push(turn);
    }
    repaired
}
