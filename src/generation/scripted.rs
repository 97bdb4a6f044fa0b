/// Scripted generation client for tests and offline runs.
///
/// Replies are deterministic: either a fixed reply or a canned echo of the
/// prompt. Open failures, mid-stream failures and per-token delays can be
/// queued to exercise error paths.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use super::{ChatMessage, GenerationClient, GenerationError, GenerationEvent, TokenStream};

#[derive(Default)]
pub struct ScriptedGenerator {
    reply: Option<String>,
    token_delay: Option<Duration>,
    open_failures: Mutex<VecDeque<GenerationError>>,
    fail_after: Option<(usize, GenerationError)>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    /// A generator that always streams `reply`.
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::default()
        }
    }

    /// Sleep before each token.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Queue an error for the next `generate` call. Queued errors are used
    /// in order, one per call.
    #[must_use]
    pub fn fail_next_open(self, error: GenerationError) -> Self {
        if let Ok(mut queue) = self.open_failures.lock() {
            queue.push_back(error);
        }
        self
    }

    /// Emit `tokens` tokens, then fail with `error` instead of completing.
    #[must_use]
    pub fn fail_mid_stream(mut self, tokens: usize, error: GenerationError) -> Self {
        self.fail_after = Some((tokens, error));
        self
    }

    /// Number of `generate` calls so far, including failed opens.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply_for(&self, prompt: &str) -> String {
        match &self.reply {
            Some(reply) => reply.clone(),
            None => format!("You asked: {prompt}"),
        }
    }
}

/// Split text into word tokens that keep their trailing whitespace, so the
/// concatenation of all tokens is the original text.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    async fn generate(
        &self,
        _history: &[ChatMessage],
        prompt: &str,
    ) -> Result<TokenStream, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let queued = self
            .open_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(error) = queued {
            return Err(error);
        }

        let reply = self.reply_for(prompt);
        let mut events: Vec<Result<GenerationEvent, GenerationError>> = tokenize(&reply)
            .into_iter()
            .map(|t| Ok(GenerationEvent::Token(t)))
            .collect();
        match &self.fail_after {
            Some((after, error)) => {
                events.truncate(*after);
                events.push(Err(error.clone()));
            }
            None => events.push(Ok(GenerationEvent::Completed(reply))),
        }

        let delay = self.token_delay;
        let stream = stream::iter(events).then(move |event| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            event
        });
        Ok(stream.boxed())
    }
}
