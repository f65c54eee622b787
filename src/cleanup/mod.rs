//! Text cleanup routing
//!
//! Routes raw transcriptions to one of two interchangeable rewrite backends
//! with bounded retries. Cleanup is strictly best-effort: any non-recovered
//! failure degrades to the unmodified raw text, never to a failed attempt.

mod cloud;
mod local;
mod prompt;

pub use cloud::CloudCleanupBackend;
pub use local::LocalCleanupBackend;
pub use prompt::build_instruction;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dictionary::Dictionary;
use crate::error::Result;
use crate::types::{CleanupMode, DictationSettings};

/// Text under this length skips cleanup entirely (not worth the round trip)
pub const MIN_CLEANUP_CHARS: usize = 3;

/// One rewrite call to a backend
#[derive(Debug, Clone)]
pub struct RewriteJob {
    pub system: String,
    pub text: String,
    pub model: String,
    /// Bearer credential, for backends that need one
    pub api_key: Option<String>,
}

/// A cleanup backend the router can dispatch to
#[async_trait]
pub trait CleanupBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rewrite(&self, job: &RewriteJob) -> Result<String>;
}

/// Bounded exponential backoff for transient backend failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(250) }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given 1-based attempt
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Immutable cleanup input for one attempt
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    pub raw_text: String,
    pub mode: CleanupMode,
}

/// Routes cleanup requests to the configured backend with retry + fallback
pub struct TextCleanupRouter {
    local: Arc<dyn CleanupBackend>,
    cloud: Arc<dyn CleanupBackend>,
    retry: RetryPolicy,
}

impl TextCleanupRouter {
    pub fn new(local: Arc<dyn CleanupBackend>, cloud: Arc<dyn CleanupBackend>) -> Self {
        Self { local, cloud, retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rewrite `request.raw_text` per the selected mode.
    ///
    /// Returns `(text, was_transformed)`; on any non-recovered failure the
    /// raw text comes back unchanged with `was_transformed = false`.
    pub async fn process(
        &self,
        request: &CleanupRequest,
        settings: &DictationSettings,
    ) -> (String, bool) {
        let raw = &request.raw_text;

        if request.mode == CleanupMode::Off {
            return (raw.clone(), false);
        }
        if raw.trim().chars().count() < MIN_CLEANUP_CHARS {
            debug!("Text too short for cleanup, passing through");
            return (raw.clone(), false);
        }

        let (backend, model, api_key) = match request.mode {
            CleanupMode::Local => (&self.local, settings.local_model.clone(), None),
            CleanupMode::Cloud => {
                (&self.cloud, settings.cloud_model.clone(), settings.cloud_api_key.clone())
            }
            CleanupMode::Off => unreachable!("handled above"),
        };

        let dictionary = Dictionary::new(settings.dictionary.clone());
        let system = build_instruction(raw, settings.handle_self_corrections, &dictionary);
        let job = RewriteJob { system, text: raw.clone(), model, api_key };

        for attempt in 1..=self.retry.max_attempts {
            match backend.rewrite(&job).await {
                Ok(text) => {
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        // a rewrite that deletes the user's words is worse
                        // than no rewrite
                        warn!("Empty rewrite from {} backend, using raw text", backend.name());
                        break;
                    }
                    debug!("Cleanup succeeded via {} on attempt {}", backend.name(), attempt);
                    return (text, true);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = e.retry_after().unwrap_or_else(|| self.retry.delay_for(attempt));
                    warn!(
                        "Cleanup attempt {}/{} via {} failed ({}), retrying in {:?}",
                        attempt,
                        self.retry.max_attempts,
                        backend.name(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("Cleanup via {} failed ({}), using raw text", backend.name(), e);
                    break;
                }
            }
        }

        (raw.clone(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::DictionaryEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBackend {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CleanupBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn rewrite(&self, _job: &RewriteJob) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Backend { status: self.status, message: "simulated".to_string() })
        }
    }

    struct FlakyBackend {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CleanupBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn rewrite(&self, job: &RewriteJob) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Backend { status: 503, message: "warming up".to_string() });
            }
            Ok(format!("Cleaned: {}", job.text))
        }
    }

    /// Honors the literal replacements rendered into the instruction
    struct SubstitutingBackend;

    #[async_trait]
    impl CleanupBackend for SubstitutingBackend {
        fn name(&self) -> &'static str {
            "substituting"
        }

        async fn rewrite(&self, job: &RewriteJob) -> Result<String> {
            let mut text = job.text.clone();
            for line in job.system.lines() {
                if let Some(rest) = line.strip_prefix("- replace \"") {
                    if let Some((spoken, rest)) = rest.split_once("\" with \"") {
                        let replacement = rest.trim_end_matches('"');
                        text = text.replace(spoken, replacement);
                    }
                }
            }
            Ok(text)
        }
    }

    fn router_with(backend: Arc<dyn CleanupBackend>) -> TextCleanupRouter {
        TextCleanupRouter::new(backend.clone(), backend)
            .with_retry_policy(RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(10) })
    }

    fn settings() -> DictationSettings {
        DictationSettings {
            cleanup_mode: CleanupMode::Cloud,
            local_model: "llama3.2".to_string(),
            cloud_model: "gpt-4o-mini".to_string(),
            cloud_api_key: Some("sk-test".to_string()),
            handle_self_corrections: false,
            dictionary: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_off_mode_is_identity() {
        let router = router_with(Arc::new(FailingBackend { status: 500, calls: AtomicUsize::new(0) }));
        let request = CleanupRequest { raw_text: "leave me alone".to_string(), mode: CleanupMode::Off };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "leave me alone");
        assert!(!transformed);
    }

    #[tokio::test]
    async fn test_short_text_skips_backend() {
        let backend = Arc::new(FailingBackend { status: 500, calls: AtomicUsize::new(0) });
        let router = router_with(backend.clone());
        let request = CleanupRequest { raw_text: "ok".to_string(), mode: CleanupMode::Cloud };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "ok");
        assert!(!transformed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_server_failure_falls_back_after_retries() {
        let backend = Arc::new(FailingBackend { status: 500, calls: AtomicUsize::new(0) });
        let router = router_with(backend.clone());
        let request =
            CleanupRequest { raw_text: "hello world from dictation".to_string(), mode: CleanupMode::Cloud };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "hello world from dictation");
        assert!(!transformed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_gives_up_immediately() {
        let backend = Arc::new(FailingBackend { status: 401, calls: AtomicUsize::new(0) });
        let router = router_with(backend.clone());
        let request = CleanupRequest { raw_text: "hello world".to_string(), mode: CleanupMode::Local };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "hello world");
        assert!(!transformed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_within_budget() {
        let backend = Arc::new(FlakyBackend { fail_first: 2, calls: AtomicUsize::new(0) });
        let router = router_with(backend.clone());
        let request = CleanupRequest { raw_text: "um hello there".to_string(), mode: CleanupMode::Cloud };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "Cleaned: um hello there");
        assert!(transformed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    struct EmptyBackend;

    #[async_trait]
    impl CleanupBackend for EmptyBackend {
        fn name(&self) -> &'static str {
            "empty"
        }

        async fn rewrite(&self, _job: &RewriteJob) -> Result<String> {
            Ok("   ".to_string())
        }
    }

    #[tokio::test]
    async fn test_empty_rewrite_counts_as_failed_transform() {
        let router = router_with(Arc::new(EmptyBackend));
        let request = CleanupRequest { raw_text: "do not lose this".to_string(), mode: CleanupMode::Local };

        let (text, transformed) = router.process(&request, &settings()).await;

        assert_eq!(text, "do not lose this");
        assert!(!transformed);
    }

    #[tokio::test]
    async fn test_dictionary_entry_survives_to_cleaned_text() {
        let router = router_with(Arc::new(SubstitutingBackend));
        let mut settings = settings();
        settings.dictionary = vec![DictionaryEntry::new("ant row pic", "Anthropic")];
        let request = CleanupRequest {
            raw_text: "I just joined ant row pic as an engineer".to_string(),
            mode: CleanupMode::Cloud,
        };

        let (text, transformed) = router.process(&request, &settings).await;

        assert!(transformed);
        assert!(text.contains("Anthropic"));
        assert!(!text.contains("ant row pic"));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(250) };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
    }
}
