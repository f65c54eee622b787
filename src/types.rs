//! Core types used throughout sotto

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for dictation attempts
pub type AttemptId = Uuid;

/// Lifecycle state of the current dictation attempt.
///
/// Exactly one attempt may be in a non-`Idle` state at a time; this is the
/// orchestrator's central invariant. `Error` is reachable from any non-idle
/// state and clears back to `Idle` on a short timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Opening the capture stream
    Starting,
    Recording,
    Transcribing,
    /// Text cleanup in progress
    Processing,
    Injecting,
    Error(String),
}

impl SessionState {
    /// Whether a trigger press may start a new attempt from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Whether a trigger release should stop capture in this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, SessionState::Recording)
    }
}

/// Which cleanup backend rewrites the raw transcription, if any
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    #[default]
    Off,
    /// Local network service (generate endpoint)
    Local,
    /// Cloud chat-completion API (bearer credential required)
    Cloud,
}

/// A literal spoken-phrase → replacement substitution supplied by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub spoken: String,
    pub replacement: String,
}

impl DictionaryEntry {
    pub fn new(spoken: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self { spoken: spoken.into(), replacement: replacement.into() }
    }
}

/// Settings snapshot read from the external settings store at each attempt
#[derive(Debug, Clone, Default)]
pub struct DictationSettings {
    pub cleanup_mode: CleanupMode,
    /// Model name sent to the local backend
    pub local_model: String,
    /// Model identifier sent to the cloud backend
    pub cloud_model: String,
    /// Bearer credential for the cloud backend; absence degrades cleanup
    pub cloud_api_key: Option<String>,
    /// Append the self-correction addendum to the rewrite instruction
    pub handle_self_corrections: bool,
    pub dictionary: Vec<DictionaryEntry>,
}

/// Read-side seam for the external settings collaborator.
///
/// The orchestrator reads a fresh snapshot on every attempt; the core never
/// writes settings.
pub trait SettingsStore: Send + Sync {
    fn dictation_settings(&self) -> DictationSettings;
}

/// Completion event emitted once per finished attempt, consumed by the
/// external stats/history collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub id: AttemptId,
    pub raw_text: String,
    pub cleaned_text: String,
    /// Wall-clock recording duration
    pub duration: Duration,
    pub was_cleaned: bool,
    pub created_at: DateTime<Utc>,
}

impl AttemptOutcome {
    pub fn new(raw_text: String, cleaned_text: String, duration: Duration, was_cleaned: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text,
            cleaned_text,
            duration,
            was_cleaned,
            created_at: Utc::now(),
        }
    }

    /// Word count of the delivered text
    pub fn word_count(&self) -> usize {
        self.cleaned_text.split_whitespace().count()
    }
}

/// Hook invoked with the completion event of each attempt
pub type CompletionHook = std::sync::Arc<dyn Fn(AttemptOutcome) + Send + Sync>;
