//! Prompt construction for chat turns, merge summaries and question generation.
use regex::Regex;
use std::sync::LazyLock;

use crate::db::models::{Chunk, Conversation, Document, Message, Role};

use super::ChatMessage;

/// Upper bound on document text inlined into a main-conversation prompt.
const MAX_DOCUMENT_CONTEXT_CHARS: usize = 24_000;

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s*(.+?)\s*$").unwrap());

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// System prompt for the document-wide conversation.
///
/// With a focus chunk only that chunk is inlined, otherwise the document
/// text in sequence order up to a fixed budget.
pub fn main_system_prompt(document: &Document, chunks: &[Chunk], focus: Option<&Chunk>) -> String {
    let mut prompt = format!(
        "You are an assistant helping a reader understand the document \"{}\".\n\
         Ground every answer in the document text, cite the part you rely on, \
         and say so when the text does not support an answer.\n",
        document.title
    );

    match focus {
        Some(chunk) => {
            prompt.push_str(&format!(
                "\nThe reader is currently looking at section {}:\n{}\n",
                chunk.sequence + 1,
                chunk.content
            ));
        }
        None => {
            let joined = chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            prompt.push_str("\nDOCUMENT:\n");
            prompt.push_str(truncate_chars(&joined, MAX_DOCUMENT_CONTEXT_CHARS));
            prompt.push('\n');
        }
    }
    prompt
}

/// System prompt for a conversation scoped to a highlighted range.
pub fn highlight_system_prompt(chunk: &Chunk, highlighted_text: &str) -> String {
    format!(
        "You are discussing one section of a document, with attention on a highlighted passage.\n\
         \nSECTION:\n{}\n\
         \nHIGHLIGHTED:\n{}\n\
         \nKeep answers focused on the highlighted passage and its section. Be concise.",
        chunk.content, highlighted_text
    )
}

/// Prior messages of a conversation as chat history.
pub fn history(system: String, messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(system));
    out.extend(messages.iter().map(|m| match m.role {
        Role::User => ChatMessage::user(&m.content),
        Role::Assistant => ChatMessage::assistant(&m.content),
    }));
    out
}

/// Request for a standalone summary of a highlight conversation.
pub fn summary_request(highlight: &Conversation, messages: &[Message]) -> (Vec<ChatMessage>, String) {
    let system = ChatMessage::system(
        "You condense a discussion about a highlighted passage into a short summary \
         that can be read on its own inside a larger conversation about the document. \
         Start from the passage's core idea, keep the key insights and open questions.",
    );
    let prompt = format!(
        "HIGHLIGHTED TEXT:\n\"{}\"\n\nCONVERSATION:\n{}\n\nWrite the summary.",
        highlight.highlighted_text.as_deref().unwrap_or_default(),
        transcript(messages)
    );
    (vec![system], prompt)
}

/// Prompt asking for `count` follow-up questions as a numbered list.
pub fn questions_request(count: usize) -> String {
    format!(
        "Suggest {count} insightful questions the reader could ask next. \
         Reply with a numbered list only, one question per line (\"1. \"), \
         without any introduction or closing text."
    )
}

/// Extract up to `count` questions from a numbered or bulleted reply.
pub fn parse_questions(text: &str, count: usize) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            NUMBERED_LINE
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .filter(|q| !q.is_empty())
        .take(count)
        .collect()
}

/// Plain `role: content` transcript, one message per line.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
