//! Text injection into the focused application
//!
//! Three delivery strategies are attempted in order: synthetic keystrokes,
//! accessibility-tree insertion at the caret, and a clipboard paste
//! fallback. The clipboard path snapshots the user's clipboard before
//! writing and restores it unconditionally afterwards.
//!
//! The clipboard is a system-wide shared resource with no way to exclude
//! other writers; if something else overwrites it mid-attempt, restoration
//! loses that race. This is an accepted residual risk, not a bug.

use enigo::{Direction, Enigo, Key, Keyboard, Settings as EnigoSettings};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::{Capability, PromptGate};
use crate::error::{Error, Result};

/// Synthetic input seam
pub trait InputSynthesizer: Send + Sync {
    /// Type the literal text into the currently focused element
    fn type_text(&self, text: &str) -> Result<()>;

    /// Send the platform paste chord to the frontmost application
    fn send_paste(&self) -> Result<()>;
}

/// Snapshot of the focused editable field from the accessibility tree
#[derive(Debug, Clone)]
pub struct FocusedField {
    /// Process that owns the focused element, when reported
    pub pid: Option<u32>,
    pub value: String,
    /// Caret offset in characters, when the element reports one
    pub caret: Option<usize>,
}

/// Accessibility seam: read and write the focused text field.
///
/// Platform-bound; the default [`UnsupportedFocusAccess`] makes strategy 2 a
/// structured failure on hosts that haven't wired it up.
pub trait FocusedFieldAccess: Send + Sync {
    fn capture(&self) -> Result<FocusedField>;

    /// Insert text at a character offset in the focused field
    fn insert_at(&self, offset: usize, text: &str) -> Result<()>;

    /// Replace the focused field's entire value
    fn replace_value(&self, value: &str) -> Result<()>;
}

/// Best-effort copy of the clipboard contents around one paste
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub text: Option<String>,
}

/// Clipboard seam
pub trait Clipboard: Send + Sync {
    fn read(&self) -> ClipboardSnapshot;
    fn write(&self, text: &str) -> Result<()>;
    fn restore(&self, snapshot: &ClipboardSnapshot) -> Result<()>;
}

/// enigo-backed synthesizer used in production
pub struct EnigoSynthesizer;

impl InputSynthesizer for EnigoSynthesizer {
    fn type_text(&self, text: &str) -> Result<()> {
        let mut enigo = Enigo::new(&EnigoSettings::default())
            .map_err(|e| Error::Injection(format!("failed to init enigo: {e}")))?;
        enigo
            .text(text)
            .map_err(|e| Error::Injection(format!("failed to type text: {e}")))
    }

    fn send_paste(&self) -> Result<()> {
        let mut enigo = Enigo::new(&EnigoSettings::default())
            .map_err(|e| Error::Injection(format!("failed to init enigo: {e}")))?;

        #[cfg(target_os = "macos")]
        let modifier = Key::Meta;
        #[cfg(not(target_os = "macos"))]
        let modifier = Key::Control;

        enigo
            .key(modifier, Direction::Press)
            .and_then(|_| enigo.key(Key::Unicode('v'), Direction::Click))
            .and_then(|_| enigo.key(modifier, Direction::Release))
            .map_err(|e| Error::Injection(format!("failed to send paste chord: {e}")))
    }
}

/// arboard-backed clipboard used in production
pub struct SystemClipboard;

impl Clipboard for SystemClipboard {
    fn read(&self) -> ClipboardSnapshot {
        match arboard::Clipboard::new() {
            Ok(mut clipboard) => ClipboardSnapshot { text: clipboard.get_text().ok() },
            Err(e) => {
                debug!("Clipboard unavailable for snapshot: {}", e);
                ClipboardSnapshot::default()
            }
        }
    }

    fn write(&self, text: &str) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|e| Error::Injection(format!("clipboard unavailable: {e}")))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|e| Error::Injection(format!("clipboard write failed: {e}")))
    }

    fn restore(&self, snapshot: &ClipboardSnapshot) -> Result<()> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|e| Error::Injection(format!("clipboard unavailable: {e}")))?;
        match &snapshot.text {
            Some(text) => clipboard.set_text(text.clone()),
            None => clipboard.clear(),
        }
        .map_err(|e| Error::Injection(format!("clipboard restore failed: {e}")))
    }
}

/// Placeholder focus access for hosts without an accessibility bridge
pub struct UnsupportedFocusAccess;

impl FocusedFieldAccess for UnsupportedFocusAccess {
    fn capture(&self) -> Result<FocusedField> {
        Err(Error::Injection("accessibility focus capture not available".to_string()))
    }

    fn insert_at(&self, _offset: usize, _text: &str) -> Result<()> {
        Err(Error::Injection("accessibility insert not available".to_string()))
    }

    fn replace_value(&self, _value: &str) -> Result<()> {
        Err(Error::Injection("accessibility replace not available".to_string()))
    }
}

/// Injection timing knobs
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Wait after writing the clipboard before sending the paste chord
    pub clipboard_settle: Duration,
    /// Wait after the paste chord for the paste to land
    pub paste_settle: Duration,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            clipboard_settle: Duration::from_millis(50),
            paste_settle: Duration::from_millis(150),
        }
    }
}

/// Delivers final text into the focused UI target
pub struct TextInjector {
    synth: Arc<dyn InputSynthesizer>,
    focus: Arc<dyn FocusedFieldAccess>,
    clipboard: Arc<dyn Clipboard>,
    permissions: Arc<PromptGate>,
    config: InjectorConfig,
    in_flight: AtomicBool,
}

impl TextInjector {
    pub fn new(
        synth: Arc<dyn InputSynthesizer>,
        focus: Arc<dyn FocusedFieldAccess>,
        clipboard: Arc<dyn Clipboard>,
        permissions: Arc<PromptGate>,
    ) -> Self {
        Self {
            synth,
            focus,
            clipboard,
            permissions,
            config: InjectorConfig::default(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Production wiring: enigo keystrokes + arboard clipboard
    pub fn system(permissions: Arc<PromptGate>) -> Self {
        Self::new(
            Arc::new(EnigoSynthesizer),
            Arc::new(UnsupportedFocusAccess),
            Arc::new(SystemClipboard),
            permissions,
        )
    }

    pub fn with_config(mut self, config: InjectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Attempt delivery; `Ok(true)` on success, `Ok(false)` when every
    /// strategy failed or the permission is missing. A concurrent call while
    /// one is active is rejected with [`Error::InjectionBusy`].
    pub async fn inject(&self, text: &str) -> Result<bool> {
        if text.is_empty() {
            return Ok(true);
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::InjectionBusy);
        }
        let _guard = InFlightGuard(&self.in_flight);

        if !self.permissions.check_or_prompt(Capability::AssistiveControl) {
            warn!("Assistive control permission missing; cannot inject");
            return Ok(false);
        }

        match self.synth.type_text(text) {
            Ok(()) => {
                info!("Injected {} chars via keystrokes", text.chars().count());
                return Ok(true);
            }
            Err(e) => debug!("Keystroke strategy failed: {}", e),
        }

        match self.inject_via_accessibility(text) {
            Ok(()) => {
                info!("Injected {} chars via accessibility", text.chars().count());
                return Ok(true);
            }
            Err(e) => debug!("Accessibility strategy failed: {}", e),
        }

        match self.inject_via_clipboard(text).await {
            Ok(()) => {
                info!("Injected {} chars via clipboard paste", text.chars().count());
                Ok(true)
            }
            Err(e) => {
                warn!("All injection strategies failed: {}", e);
                Ok(false)
            }
        }
    }

    fn inject_via_accessibility(&self, text: &str) -> Result<()> {
        let field = self.focus.capture()?;
        let value_chars = field.value.chars().count();

        match field.caret {
            Some(offset) => {
                let offset = offset.min(value_chars);
                if self.focus.insert_at(offset, text).is_ok() {
                    return Ok(());
                }
                // cursor-relative insertion unsupported: rewrite the whole
                // value with the text spliced in at the caret
                let mut value = field.value;
                let at = byte_offset(&value, offset);
                value.insert_str(at, text);
                self.focus.replace_value(&value)
            }
            None => {
                let mut value = field.value;
                value.push_str(text);
                self.focus.replace_value(&value)
            }
        }
    }

    async fn inject_via_clipboard(&self, text: &str) -> Result<()> {
        let snapshot = self.clipboard.read();

        let result = async {
            self.clipboard.write(text)?;
            tokio::time::sleep(self.config.clipboard_settle).await;
            self.synth.send_paste()?;
            tokio::time::sleep(self.config.paste_settle).await;
            Ok(())
        }
        .await;

        // restoration is unconditional, even when the paste itself failed
        if let Err(e) = self.clipboard.restore(&snapshot) {
            warn!("Failed to restore clipboard: {}", e);
        }

        result
    }
}

/// Clears the in-flight flag when an injection attempt ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Byte index of the `chars`-th character in `s`, clamped to the end
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}
