//! Prompt formatting
//!
//! Role-delimited prompt construction and assistant-reply extraction. Both
//! sides of the conversation round-trip through the same markers.

use crate::types::{Message, Role};

/// Marker opening a system turn
pub const SYSTEM_MARKER: &str = "<|system|>";
/// Marker opening a user turn
pub const USER_MARKER: &str = "<|user|>";
/// Marker opening an assistant turn
pub const ASSISTANT_MARKER: &str = "<|assistant|>";

fn marker_for(role: Role) -> &'static str {
    match role {
        Role::System => SYSTEM_MARKER,
        Role::User => USER_MARKER,
        Role::Assistant => ASSISTANT_MARKER,
    }
}

/// Build a role-tagged prompt from the full message history.
///
/// System messages come first, then user/assistant turns in their original
/// order, ending with an open assistant marker for the model to complete.
pub fn build_prompt(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages.iter().filter(|m| m.role == Role::System) {
        push_turn(&mut out, message);
    }
    for message in messages.iter().filter(|m| m.role != Role::System) {
        push_turn(&mut out, message);
    }
    out.push_str(ASSISTANT_MARKER);
    out.push('\n');
    out
}

fn push_turn(out: &mut String, message: &Message) {
    out.push_str(marker_for(message.role));
    out.push('\n');
    out.push_str(&message.content);
    out.push('\n');
}

/// Extract the assistant-only portion of raw model output.
///
/// Takes the text after the last assistant marker, cut at the next role
/// marker if the model kept talking. When no markers are present the raw
/// trailing text is returned as-is (trimmed).
pub fn extract_assistant_reply(raw: &str) -> String {
    let tail = match raw.rfind(ASSISTANT_MARKER) {
        Some(pos) => &raw[pos + ASSISTANT_MARKER.len()..],
        None => raw,
    };
    let end = [SYSTEM_MARKER, USER_MARKER, ASSISTANT_MARKER]
        .iter()
        .filter_map(|marker| tail.find(marker))
        .min()
        .unwrap_or(tail.len());
    tail[..end].trim().to_string()
}
