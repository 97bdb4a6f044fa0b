//! Shared application context handed to the HTTP handlers and every session.
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::config::{Config, Provider};
use crate::db::{Db, SharedDb};
use crate::documents::DocumentStore;
use crate::error;
use crate::generation::{GenerationClient, OpenAiClient, ScriptedGenerator};
use crate::graph::ConversationGraph;
use crate::identity::{IdentityProvider, StaticTokenProvider};
use crate::ingest::{IngestionService, TextIngestor};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::message_log::MessageLog;
use crate::navigation::NavigationIndex;
use crate::session::busy::BusyRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub db: SharedDb,
    pub config: Arc<Config>,
    pub generator: Arc<dyn GenerationClient>,
    pub ingestor: Arc<dyn IngestionService>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Process-wide "generation in progress" flags.
    pub busy: BusyRegistry,
}

impl AppContext {
    /// Context over an open store with collaborators derived from `config`,
    /// except the generator.
    pub fn new(db: SharedDb, config: Config, generator: Arc<dyn GenerationClient>) -> Self {
        Self {
            db,
            ingestor: Arc::new(TextIngestor::from_config(&config)),
            identity: Arc::new(StaticTokenProvider::new(config.api_tokens.clone())),
            config: Arc::new(config),
            generator,
            busy: BusyRegistry::default(),
        }
    }

    /// Opens the store and builds the configured generator.
    pub fn from_config(config: Config) -> Result<Self> {
        let db = Db::open(&config.db_path)
            .with_context(|| format!("failed to open database: {}", config.db_path))?
            .shared();

        let generator: Arc<dyn GenerationClient> = match config.generation.provider {
            Provider::Openai => {
                let client = OpenAiClient::from_config(&config.generation)
                    .context("failed to build generation client")?;
                if std::env::var(&config.generation.api_key_env).is_err() {
                    warn!(
                        "{} is not set, generation requests are sent without credentials",
                        config.generation.api_key_env
                    );
                }
                info!(
                    "Generation: openai-compatible ({}, model {})",
                    config.generation.base_url, config.generation.model
                );
                Arc::new(client)
            }
            Provider::Scripted => {
                info!("Generation: scripted");
                Arc::new(ScriptedGenerator::default())
            }
        };

        Ok(Self::new(db, config, generator))
    }

    pub fn documents(&self) -> DocumentStore {
        DocumentStore::new(self.db.clone())
    }

    pub fn graph(&self) -> ConversationGraph {
        ConversationGraph::new(self.db.clone())
    }

    pub fn messages(&self) -> MessageLog {
        MessageLog::new(self.db.clone())
    }

    pub fn merges(&self) -> MergeEngine {
        MergeEngine::new(self.db.clone())
    }

    pub fn navigation(&self) -> NavigationIndex {
        NavigationIndex::new(self.db.clone())
    }

    /// Merges following the configured summary policy. A failed summary
    /// falls back to the transcript digest.
    pub async fn merge(&self, main_id: &str, highlight_id: &str) -> error::Result<MergeOutcome> {
        let engine = self.merges();
        let candidate = engine.prepare(main_id, highlight_id).await?;
        let summary = if self.config.merge.summarize {
            match MergeEngine::summarize(self.generator.as_ref(), &candidate).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("merge summary for {highlight_id} failed ({e}), using transcript");
                    None
                }
            }
        } else {
            None
        };
        engine.commit(&candidate, summary.as_deref()).await
    }

    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        filename: String,
    ) -> error::Result<crate::db::models::StoredDocument> {
        self.documents()
            .ingest(self.ingestor.clone(), bytes, filename)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationError;

    async fn context(generator: ScriptedGenerator, summarize: bool) -> AppContext {
        let mut config = Config::default();
        config.merge.summarize = summarize;
        config.chunk_size = 40;
        AppContext::new(
            Db::open_in_memory().unwrap().shared(),
            config,
            Arc::new(generator),
        )
    }

    #[tokio::test]
    async fn test_ingest_uses_configured_chunk_size() {
        let ctx = context(ScriptedGenerator::default(), false).await;
        let text = "Short opening paragraph here.\n\nAnother paragraph that follows it.";
        let stored = ctx
            .ingest(text.as_bytes().to_vec(), "doc.md".into())
            .await
            .unwrap();
        assert_eq!(stored.chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_with_failed_summary_falls_back() {
        let generator = ScriptedGenerator::with_reply("unused")
            .fail_next_open(GenerationError::Upstream {
                status: Some(400),
                message: "bad request".into(),
            });
        let ctx = context(generator, true).await;
        let stored = ctx
            .ingest(b"Some highlighted content".to_vec(), "doc.txt".into())
            .await
            .unwrap();
        let highlight = ctx
            .graph()
            .create_chunk_conversation(&stored.document.id, &stored.chunks[0].id, 0, 4, None)
            .await
            .unwrap();

        let outcome = ctx
            .merge(&stored.main_conversation.id, &highlight.id)
            .await
            .unwrap();
        assert!(outcome.message.content.ends_with("(no messages)"));
    }

    #[tokio::test]
    async fn test_merge_with_summary() {
        let ctx = context(ScriptedGenerator::with_reply("A tidy summary."), true).await;
        let stored = ctx
            .ingest(b"Some highlighted content".to_vec(), "doc.txt".into())
            .await
            .unwrap();
        let highlight = ctx
            .graph()
            .create_chunk_conversation(&stored.document.id, &stored.chunks[0].id, 0, 4, None)
            .await
            .unwrap();

        let outcome = ctx
            .merge(&stored.main_conversation.id, &highlight.id)
            .await
            .unwrap();
        assert!(outcome.message.content.ends_with("A tidy summary."));
    }
}
