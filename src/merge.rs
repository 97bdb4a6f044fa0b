//! Merge engine: folds a chunk conversation back into its document's main
//! conversation as one provenance-tagged message.
//!
//! The flag flip on the highlight and the appended message commit together.
//! A pair can be merged once; a second attempt fails with `AlreadyMerged` and
//! writes nothing. Overlapping highlights merge independently.
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::db::SharedDb;
use crate::db::models::{Conversation, Message, NewMessage, Provenance, Role};
use crate::error::{AppError, Entity, Result};
use crate::generation::{GenerationClient, GenerationError, collect_text, open_with_retry, prompts};

/// A validated (main, highlight) pair and the highlight's messages.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub main: Conversation,
    pub highlight: Conversation,
    pub messages: Vec<Message>,
}

impl MergeCandidate {
    fn provenance(&self) -> Result<Provenance> {
        let (Some(range), Some(text)) = (self.highlight.range, &self.highlight.highlighted_text)
        else {
            return Err(AppError::not_found(Entity::Conversation, &self.highlight.id));
        };
        Ok(Provenance {
            source_conversation_id: self.highlight.id.clone(),
            highlight_range: range,
            highlighted_text: text.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    /// The highlight conversation after the merge.
    pub conversation: Conversation,
    /// The message appended to main.
    pub message: Message,
}

/// Body of the merge message: the summary when there is one, otherwise a
/// transcript digest of the highlight conversation.
pub fn merge_message_content(candidate: &MergeCandidate, summary: Option<&str>) -> String {
    let quoted = candidate.highlight.highlighted_text.as_deref().unwrap_or_default();
    let body = match summary.map(str::trim).filter(|s| !s.is_empty()) {
        Some(summary) => summary.to_string(),
        None if candidate.messages.is_empty() => "(no messages)".to_string(),
        None => prompts::transcript(&candidate.messages),
    };
    format!("[Merged from a conversation about \"{quoted}\"]\n{body}")
}

#[derive(Clone)]
pub struct MergeEngine {
    db: SharedDb,
}

impl MergeEngine {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Checks the pair without writing.
    ///
    /// Both ids must exist, `main_id` must be a main conversation and
    /// `highlight_id` a chunk conversation of the same document; anything
    /// else is `NotFound`. An already merged highlight is `AlreadyMerged`.
    pub async fn prepare(&self, main_id: &str, highlight_id: &str) -> Result<MergeCandidate> {
        let db = self.db.lock().await;
        let main = db
            .get_conversation(main_id)?
            .filter(Conversation::is_main)
            .ok_or_else(|| AppError::not_found(Entity::Conversation, main_id))?;
        let highlight = db
            .get_conversation(highlight_id)?
            .filter(|c| !c.is_main() && c.document_id == main.document_id)
            .ok_or_else(|| AppError::not_found(Entity::Conversation, highlight_id))?;
        if highlight.merged {
            return Err(AppError::AlreadyMerged(highlight.id));
        }
        let messages = db.list_messages(highlight_id, None, 0)?;
        Ok(MergeCandidate {
            main,
            highlight,
            messages,
        })
    }

    /// Merges using the transcript digest.
    pub async fn merge(&self, main_id: &str, highlight_id: &str) -> Result<MergeOutcome> {
        let candidate = self.prepare(main_id, highlight_id).await?;
        self.commit(&candidate, None).await
    }

    /// Appends the merge message and flags the highlight in one transaction.
    ///
    /// The merged flag is re-checked inside the transaction, so a concurrent
    /// merge of the same highlight cannot append twice.
    pub async fn commit(
        &self,
        candidate: &MergeCandidate,
        summary: Option<&str>,
    ) -> Result<MergeOutcome> {
        let provenance = candidate.provenance()?;
        let content = merge_message_content(candidate, summary);
        let message = NewMessage {
            role: Role::User,
            content: &content,
            provenance: Some(&provenance),
        };

        let mut db = self.db.lock().await;
        let appended = db
            .commit_merge(&candidate.main.id, &candidate.highlight.id, &message, Utc::now())?
            .ok_or_else(|| AppError::AlreadyMerged(candidate.highlight.id.clone()))?;
        let conversation = db
            .get_conversation(&candidate.highlight.id)?
            .ok_or_else(|| AppError::not_found(Entity::Conversation, &candidate.highlight.id))?;

        info!(
            "Merged conversation {} into {} (message #{})",
            candidate.highlight.id, candidate.main.id, appended.sequence
        );
        Ok(MergeOutcome {
            conversation,
            message: appended,
        })
    }

    /// Asks the generator for a summary of the highlight conversation.
    pub async fn summarize(
        generator: &dyn GenerationClient,
        candidate: &MergeCandidate,
    ) -> Result<String, GenerationError> {
        let (history, prompt) = prompts::summary_request(&candidate.highlight, &candidate.messages);
        let stream = open_with_retry(generator, &history, &prompt).await?;
        collect_text(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::db::models::{HighlightRange, StoredDocument};
    use crate::generation::ScriptedGenerator;

    struct Fixture {
        engine: MergeEngine,
        db: SharedDb,
        stored: StoredDocument,
        highlight: Conversation,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap().shared();
        let (stored, highlight) = {
            let mut guard = db.lock().await;
            let stored = guard
                .insert_document("Doc", &["Highlighted words live here.".to_string()])
                .unwrap();
            let highlight = guard
                .insert_chunk_conversation(
                    &stored.document.id,
                    &stored.chunks[0].id,
                    HighlightRange { start: 0, end: 11 },
                    "Highlighted",
                )
                .unwrap();
            guard
                .append_messages(
                    &highlight.id,
                    &[
                        NewMessage::new(Role::User, "What does this mean?"),
                        NewMessage::new(Role::Assistant, "It means emphasis."),
                    ],
                )
                .unwrap();
            (stored, highlight)
        };
        Fixture {
            engine: MergeEngine::new(db.clone()),
            db,
            stored,
            highlight,
        }
    }

    #[tokio::test]
    async fn test_merge_appends_one_tagged_message() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;

        let outcome = f.engine.merge(main_id, &f.highlight.id).await.unwrap();
        assert!(outcome.conversation.merged);
        assert_eq!(outcome.conversation.merged_into.as_deref(), Some(main_id.as_str()));
        assert_eq!(outcome.message.role, Role::User);
        assert!(outcome.message.content.contains("Highlighted"));
        assert!(outcome.message.content.contains("assistant: It means emphasis."));

        let provenance = outcome.message.provenance.unwrap();
        assert_eq!(provenance.source_conversation_id, f.highlight.id);
        assert_eq!(provenance.highlight_range, HighlightRange { start: 0, end: 11 });
        assert_eq!(provenance.highlighted_text, "Highlighted");

        assert_eq!(f.db.lock().await.count_messages(main_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_merge_fails_without_appending() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;
        f.engine.merge(main_id, &f.highlight.id).await.unwrap();

        let err = f.engine.merge(main_id, &f.highlight.id).await.unwrap_err();
        assert_eq!(err.code(), "already_merged");
        assert_eq!(f.db.lock().await.count_messages(main_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_rechecks_merged_flag() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;
        let a = f.engine.prepare(main_id, &f.highlight.id).await.unwrap();
        let b = f.engine.prepare(main_id, &f.highlight.id).await.unwrap();

        f.engine.commit(&a, None).await.unwrap();
        let err = f.engine.commit(&b, None).await.unwrap_err();
        assert_eq!(err.code(), "already_merged");
        assert_eq!(f.db.lock().await.count_messages(main_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_pairs_are_not_found() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;

        // Swapped roles.
        let err = f.engine.merge(&f.highlight.id, main_id).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        // Main merged into itself.
        let err = f.engine.merge(main_id, main_id).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = f.engine.merge(main_id, "missing").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        // Main of another document.
        let other = f
            .db
            .lock()
            .await
            .insert_document("Other", &["x".to_string()])
            .unwrap();
        let err = f
            .engine
            .merge(&other.main_conversation.id, &f.highlight.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_overlapping_highlights_merge_independently() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;
        let second = f
            .db
            .lock()
            .await
            .insert_chunk_conversation(
                &f.stored.document.id,
                &f.stored.chunks[0].id,
                HighlightRange { start: 0, end: 11 },
                "Highlighted",
            )
            .unwrap();

        f.engine.merge(main_id, &f.highlight.id).await.unwrap();
        f.engine.merge(main_id, &second.id).await.unwrap();
        assert_eq!(f.db.lock().await.count_messages(main_id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_summary_replaces_digest() {
        let f = fixture().await;
        let main_id = &f.stored.main_conversation.id;
        let generator = ScriptedGenerator::with_reply("Emphasis is the point.");

        let candidate = f.engine.prepare(main_id, &f.highlight.id).await.unwrap();
        let summary = MergeEngine::summarize(&generator, &candidate).await.unwrap();
        let outcome = f.engine.commit(&candidate, Some(&summary)).await.unwrap();

        assert!(outcome.message.content.ends_with("Emphasis is the point."));
        assert!(!outcome.message.content.contains("assistant:"));
    }

    #[test]
    fn test_digest_for_empty_conversation() {
        let now = Utc::now();
        let conversation = |id: &str, kind| Conversation {
            id: id.into(),
            document_id: "d".into(),
            kind,
            chunk_id: None,
            range: None,
            highlighted_text: Some("text".into()),
            merged: false,
            merged_into: None,
            merged_at: None,
            created_at: now,
        };
        let candidate = MergeCandidate {
            main: conversation("m", crate::db::models::ConversationKind::Main),
            highlight: conversation("h", crate::db::models::ConversationKind::Chunk),
            messages: vec![],
        };
        assert_eq!(
            merge_message_content(&candidate, Some("   ")),
            "[Merged from a conversation about \"text\"]\n(no messages)"
        );
    }
}
