//! Transcription session wrapping the opaque speech engine
//!
//! The engine cannot tolerate concurrent invocations, so every call goes
//! through a single-flight gate: starting a new streaming or batch call
//! cancels any still-active prior call, then serializes on the engine mutex.
//! Model preparation is asynchronous; attempts that arrive early block on it
//! instead of failing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Audio shorter than this never reaches the engine
pub const MIN_AUDIO_DURATION: Duration = Duration::from_millis(100);

/// Opaque speech engine: given audio, produce text
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load model resources. Invoked once; attempts await completion.
    async fn prepare(&self) -> Result<()>;

    /// Batch transcription of a complete utterance
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Open an incremental session fed while the user is still speaking
    async fn begin_streaming(&self, _sample_rate: u32) -> Result<Box<dyn StreamingTranscription>> {
        Err(Error::Transcription("streaming not supported by this engine".to_string()))
    }
}

/// One in-flight incremental engine session
#[async_trait]
pub trait StreamingTranscription: Send {
    async fn feed(&mut self, chunk: &[f32]) -> Result<()>;

    /// Close the session and return the final text. Expected to be fast
    /// because most acoustic work already happened during feeding.
    async fn finish(self: Box<Self>) -> Result<String>;
}

#[derive(Debug, Clone)]
enum PrepareState {
    Pending,
    Ready,
    Failed(String),
}

/// Serializing wrapper around the speech engine
pub struct TranscriptionSession {
    engine: Arc<dyn SpeechEngine>,
    sample_rate: u32,
    min_samples: usize,
    gate: Arc<AsyncMutex<()>>,
    active: Mutex<Option<CancellationToken>>,
    prepare_started: AtomicBool,
    ready_tx: watch::Sender<PrepareState>,
    ready_rx: watch::Receiver<PrepareState>,
}

impl TranscriptionSession {
    pub fn new(engine: Arc<dyn SpeechEngine>, sample_rate: u32) -> Self {
        let (ready_tx, ready_rx) = watch::channel(PrepareState::Pending);
        let min_samples =
            (sample_rate as u128 * MIN_AUDIO_DURATION.as_millis() / 1000) as usize;
        Self {
            engine,
            sample_rate,
            min_samples,
            gate: Arc::new(AsyncMutex::new(())),
            active: Mutex::new(None),
            prepare_started: AtomicBool::new(false),
            ready_tx,
            ready_rx,
        }
    }

    pub fn supports_streaming(&self) -> bool {
        self.engine.supports_streaming()
    }

    /// Kick off model preparation in the background. Idempotent; also
    /// triggered lazily by the first attempt that needs the engine.
    pub fn spawn_prepare(&self) {
        if self.prepare_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            info!("Preparing speech engine ({})", engine.name());
            let state = match engine.prepare().await {
                Ok(()) => {
                    info!("Speech engine ready");
                    PrepareState::Ready
                }
                Err(e) => {
                    warn!("Speech engine preparation failed: {}", e);
                    PrepareState::Failed(e.to_string())
                }
            };
            let _ = ready_tx.send(state);
        });
    }

    /// Cancel the active call (if any) and install a fresh token for the
    /// caller, enforcing the at-most-one-invocation invariant.
    fn supersede(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(prev) = self.active.lock().replace(token.clone()) {
            prev.cancel();
        }
        token
    }

    /// Block until the engine is prepared (triggering preparation lazily).
    /// A failed preparation fails this attempt and re-arms for the next one.
    async fn ensure_prepared(&self, token: &CancellationToken) -> Result<()> {
        self.spawn_prepare();
        let mut rx = self.ready_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                PrepareState::Ready => return Ok(()),
                PrepareState::Failed(msg) => {
                    let _ = self.ready_tx.send(PrepareState::Pending);
                    self.prepare_started.store(false, Ordering::SeqCst);
                    return Err(Error::Transcription(format!("model preparation failed: {msg}")));
                }
                PrepareState::Pending => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Err(Error::Transcription("preparation channel closed".to_string()));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Batch mode: one engine call after recording stops
    pub async fn transcribe(&self, samples: &[f32]) -> Result<String> {
        if samples.len() < self.min_samples {
            debug!("Audio too short ({} samples), skipping engine", samples.len());
            return Ok(String::new());
        }

        let token = self.supersede();
        let _guard = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            guard = self.gate.lock() => guard,
        };

        self.ensure_prepared(&token).await?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.engine.transcribe(samples, self.sample_rate) => result,
        }
    }

    /// Streaming mode: spawn a task that feeds captured chunks to the engine
    /// as they arrive. The engine session is opened lazily once the minimum
    /// audio duration has accumulated, so a too-short hold never touches the
    /// engine. The job resolves once the chunk channel closes and `finish`
    /// returns, or it is cancelled/superseded.
    pub fn spawn_streaming(self: Arc<Self>, mut chunks: mpsc::Receiver<Vec<f32>>) -> StreamingJob {
        let token = self.supersede();
        let job_token = token.clone();

        let handle = tokio::spawn(async move {
            let _guard = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                guard = self.gate.lock() => guard,
            };

            self.ensure_prepared(&token).await?;

            let mut stream: Option<Box<dyn StreamingTranscription>> = None;
            let mut pending: Vec<Vec<f32>> = Vec::new();
            let mut fed = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    chunk = chunks.recv() => match chunk {
                        Some(chunk) => {
                            fed += chunk.len();
                            match stream.as_mut() {
                                Some(stream) => stream.feed(&chunk).await?,
                                None => {
                                    pending.push(chunk);
                                    if fed >= self.min_samples {
                                        let mut opened = tokio::select! {
                                            biased;
                                            _ = token.cancelled() => return Err(Error::Cancelled),
                                            opened = self.engine.begin_streaming(self.sample_rate) => opened?,
                                        };
                                        for buffered in pending.drain(..) {
                                            opened.feed(&buffered).await?;
                                        }
                                        stream = Some(opened);
                                    }
                                }
                            }
                        }
                        None => break,
                    }
                }
            }

            let Some(stream) = stream else {
                debug!("Streamed audio too short ({} samples), skipping engine", fed);
                return Ok(String::new());
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                text = stream.finish() => text,
            }
        });

        StreamingJob { handle, token: job_token }
    }
}

/// Handle on an in-flight streaming transcription
pub struct StreamingJob {
    handle: tokio::task::JoinHandle<Result<String>>,
    token: CancellationToken,
}

impl StreamingJob {
    /// Abort the session; the engine call is torn down without finishing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the final text
    pub async fn finish(self) -> Result<String> {
        self.handle
            .await
            .map_err(|e| Error::Transcription(format!("streaming task failed: {e}")))?
    }
}
