//! Dictation session orchestrator
//!
//! The top-level state machine wiring key events, audio capture, the
//! transcription session, the cleanup router, and the injector into one
//! user-visible attempt. One coordination loop consumes the key-event
//! channel; the post-release pipeline runs as a spawned task so the loop
//! keeps draining events (which the re-entrancy guards then ignore).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::{ActiveCapture, CaptureBackend, ChunkCallback};
use crate::capabilities::{Capability, PromptGate};
use crate::cleanup::{CleanupRequest, TextCleanupRouter};
use crate::error::Error;
use crate::inject::TextInjector;
use crate::keys::KeyEvent;
use crate::transcribe::{StreamingJob, TranscriptionSession};
use crate::types::{AttemptOutcome, CompletionHook, SessionState, SettingsStore};

/// Orchestrator tuning knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long an `Error` state stays visible before clearing to `Idle`
    pub error_clear_delay: Duration,
    /// Capacity of the capture → streaming-transcription chunk channel
    pub chunk_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            error_clear_delay: Duration::from_secs(2),
            chunk_channel_capacity: 64,
        }
    }
}

/// The dictation session orchestrator.
///
/// Construct with all collaborators injected, subscribe to state via
/// [`state_watch`](Self::state_watch), then hand the key-event receiver to
/// [`run`](Self::run).
pub struct DictationSessionOrchestrator {
    capture: Arc<dyn CaptureBackend>,
    transcription: Arc<TranscriptionSession>,
    cleanup: Arc<TextCleanupRouter>,
    injector: Arc<TextInjector>,
    settings: Arc<dyn SettingsStore>,
    permissions: Arc<PromptGate>,
    completion: Option<CompletionHook>,
    config: OrchestratorConfig,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
}

impl DictationSessionOrchestrator {
    pub fn new(
        capture: Arc<dyn CaptureBackend>,
        transcription: Arc<TranscriptionSession>,
        cleanup: Arc<TextCleanupRouter>,
        injector: Arc<TextInjector>,
        settings: Arc<dyn SettingsStore>,
        permissions: Arc<PromptGate>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            capture,
            transcription,
            cleanup,
            injector,
            settings,
            permissions,
            completion: None,
            config: OrchestratorConfig::default(),
            state_tx,
            state_rx,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the per-attempt completion hook for stats/history consumers
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.completion = Some(hook);
        self
    }

    /// Observable session state for status-indicator UI
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Consume key events until the channel closes. Triggers engine
    /// preparation on entry.
    pub async fn run(self, mut events: mpsc::Receiver<KeyEvent>) {
        let shared = Arc::new(Shared {
            transcription: Arc::clone(&self.transcription),
            cleanup: self.cleanup,
            injector: self.injector,
            settings: self.settings,
            completion: self.completion,
            config: self.config,
            state_tx: self.state_tx,
            error_epoch: Arc::new(AtomicU64::new(0)),
        });

        let mut runner = Runner {
            shared,
            capture: self.capture,
            permissions: self.permissions,
            active: None,
        };

        runner.shared.transcription.spawn_prepare();
        info!("Dictation orchestrator running");

        while let Some(event) = events.recv().await {
            match event {
                KeyEvent::Pressed => runner.handle_pressed(),
                KeyEvent::Released => runner.handle_released(),
                KeyEvent::Cancelled => runner.handle_cancelled(),
            }
        }

        info!("Key event channel closed, orchestrator stopping");
    }
}

/// Services the post-release pipeline task needs
struct Shared {
    transcription: Arc<TranscriptionSession>,
    cleanup: Arc<TextCleanupRouter>,
    injector: Arc<TextInjector>,
    settings: Arc<dyn SettingsStore>,
    completion: Option<CompletionHook>,
    config: OrchestratorConfig,
    state_tx: watch::Sender<SessionState>,
    error_epoch: Arc<AtomicU64>,
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    /// Enter the `Error` state and schedule the auto-clear back to `Idle`.
    /// The epoch guards against a newer error's timer clearing this one.
    fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Attempt failed: {}", message);
        let epoch = self.error_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(SessionState::Error(message));

        let epochs = Arc::clone(&self.error_epoch);
        let state_tx = self.state_tx.clone();
        let delay = self.config.error_clear_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if epochs.load(Ordering::SeqCst) == epoch
                && matches!(&*state_tx.borrow(), SessionState::Error(_))
            {
                let _ = state_tx.send(SessionState::Idle);
            }
        });
    }

    /// Transcribe → cleanup → inject for one attempt's audio
    async fn run_pipeline(
        self: Arc<Self>,
        samples: Vec<f32>,
        duration: Duration,
        streaming: Option<StreamingJob>,
    ) {
        let raw_text = match streaming {
            Some(job) => job.finish().await,
            None => self.transcription.transcribe(&samples).await,
        };

        let raw_text = match raw_text {
            Ok(text) => text,
            Err(Error::Cancelled) => {
                debug!("Transcription superseded");
                self.set_state(SessionState::Idle);
                return;
            }
            Err(e) => {
                self.fail(format!("transcription failed: {e}"));
                return;
            }
        };

        if raw_text.trim().is_empty() {
            debug!("Empty transcription, nothing to deliver");
            self.set_state(SessionState::Idle);
            return;
        }

        self.set_state(SessionState::Processing);
        let settings = self.settings.dictation_settings();
        let request = CleanupRequest { raw_text: raw_text.clone(), mode: settings.cleanup_mode };
        let (cleaned, was_cleaned) = self.cleanup.process(&request, &settings).await;

        self.set_state(SessionState::Injecting);
        match self.injector.inject(&cleaned).await {
            Ok(true) => debug!("Text delivered"),
            Ok(false) => warn!("Text transcribed but not delivered"),
            Err(e) => warn!("Injection rejected: {}", e),
        }

        self.set_state(SessionState::Idle);
        if let Some(hook) = &self.completion {
            hook(AttemptOutcome::new(raw_text, cleaned, duration, was_cleaned));
        }
        info!("Attempt complete ({:?} of audio)", duration);
    }
}

/// One attempt's live resources
struct ActiveAttempt {
    capture: Box<dyn ActiveCapture>,
    streaming: Option<StreamingJob>,
}

struct Runner {
    shared: Arc<Shared>,
    capture: Arc<dyn CaptureBackend>,
    permissions: Arc<PromptGate>,
    active: Option<ActiveAttempt>,
}

impl Runner {
    fn handle_pressed(&mut self) {
        let state = self.shared.state();
        if !state.can_start() {
            debug!("Ignoring Pressed in {:?}", state);
            return;
        }

        if !self.permissions.check_or_prompt(Capability::Microphone) {
            self.shared.fail("microphone permission required");
            return;
        }

        self.shared.set_state(SessionState::Starting);

        // Streaming wiring: chunks flow from the capture callback through a
        // bounded channel into the feed task. The sender lives inside the
        // capture session; closing the stream closes the channel.
        let (streaming, on_chunk): (Option<StreamingJob>, Option<ChunkCallback>) =
            if self.shared.transcription.supports_streaming() {
                let (tx, rx) =
                    mpsc::channel::<Vec<f32>>(self.shared.config.chunk_channel_capacity);
                let job = Arc::clone(&self.shared.transcription).spawn_streaming(rx);
                let callback: ChunkCallback = Arc::new(move |chunk: &[f32]| {
                    if tx.try_send(chunk.to_vec()).is_err() {
                        warn!("Streaming chunk channel full, dropping chunk");
                    }
                });
                (Some(job), Some(callback))
            } else {
                (None, None)
            };

        match self.capture.begin(on_chunk) {
            Ok(capture) => {
                self.active = Some(ActiveAttempt { capture, streaming });
                self.shared.set_state(SessionState::Recording);
                info!("Recording started");
            }
            Err(e) => {
                if let Some(job) = streaming {
                    job.cancel();
                }
                match e {
                    Error::Permission(what) => {
                        self.shared.fail(format!("{what} permission required"))
                    }
                    other => self.shared.fail(format!("could not start capture: {other}")),
                }
            }
        }
    }

    fn handle_released(&mut self) {
        let state = self.shared.state();
        if !state.can_stop() {
            debug!("Ignoring Released in {:?}", state);
            return;
        }

        let Some(attempt) = self.active.take() else {
            debug!("Released with no active capture");
            self.shared.set_state(SessionState::Idle);
            return;
        };

        // closing the stream also drops the chunk sender, which lets the
        // streaming feed task run to finish
        let stopped = attempt.capture.finish();
        self.shared.set_state(SessionState::Transcribing);

        let Some((samples, duration)) = stopped else {
            if let Some(job) = attempt.streaming {
                job.cancel();
            }
            self.shared.fail("capture was never started");
            return;
        };

        info!("Recording stopped ({} samples, {:?})", samples.len(), duration);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(shared.run_pipeline(samples, duration, attempt.streaming));
    }

    fn handle_cancelled(&mut self) {
        let state = self.shared.state();
        if !matches!(state, SessionState::Recording | SessionState::Starting) {
            debug!("Ignoring Cancelled in {:?}", state);
            return;
        }

        if let Some(attempt) = self.active.take() {
            if let Some(job) = attempt.streaming {
                job.cancel();
            }
            // audio is discarded; the engine is never invoked
            let _ = attempt.capture.finish();
        }

        info!("Attempt cancelled, audio discarded");
        self.shared.set_state(SessionState::Idle);
    }
}
