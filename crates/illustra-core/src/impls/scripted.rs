//! ScriptedGenerator - replays queued outcomes, then succeeds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::ports::{GenerationContext, GenerationError, IllustrationGenerator};

/// Deterministic generator for tests and dry runs.
///
/// Each call pops the next scripted outcome; once the script runs out every
/// call succeeds. Calls are recorded, and the peak number of concurrent calls
/// is tracked so tests can check the concurrency limit.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Vec<u8>, GenerationError>>>,
    calls: Mutex<Vec<(String, GenerationContext)>>,
    latency: Duration,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: impl IntoIterator<Item = Result<Vec<u8>, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Every call succeeds.
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn calls(&self) -> Vec<(String, GenerationContext)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(prompt, _)| prompt).collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IllustrationGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<Vec<u8>, GenerationError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);

        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((prompt.to_string(), context.clone()));
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        outcome.unwrap_or_else(|| Ok(format!("image:{prompt}").into_bytes()))
    }
}
