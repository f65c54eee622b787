//! sotto - Hold-to-dictate session orchestration
//!
//! Hold a key, speak, release, and cleaned-up text lands at the cursor of
//! whatever application has focus. The crate orchestrates the short-lived
//! pipeline behind that: system-wide trigger-key interception, audio
//! capture, a serialized speech engine, best-effort LLM text cleanup, and
//! multi-strategy text injection with clipboard preservation.

pub mod audio;
pub mod capabilities;
pub mod cleanup;
pub mod dictionary;
pub mod error;
pub mod inject;
pub mod keys;
pub mod session;
pub mod transcribe;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Re-export the main pipeline components for convenience
pub use audio::{AudioCaptureConfig, AudioCaptureSession, CaptureBackend, CpalCaptureBackend};
pub use capabilities::{Capability, CapabilityBroker, PromptGate};
pub use cleanup::{CleanupBackend, CloudCleanupBackend, LocalCleanupBackend, TextCleanupRouter};
pub use dictionary::Dictionary;
pub use inject::TextInjector;
pub use keys::{KeyEvent, KeyEventSource, KeySourceConfig};
pub use session::{DictationSessionOrchestrator, OrchestratorConfig};
pub use transcribe::{SpeechEngine, StreamingTranscription, TranscriptionSession};
