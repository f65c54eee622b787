//! Trigger-key interception
//!
//! Listens system-wide for a designated hold-to-dictate key and translates
//! raw press/release traffic into the three logical events the orchestrator
//! consumes. The listener only observes the event stream: the trigger key's
//! cancel gesture (another key pressed mid-hold) suppresses our own
//! `Released` signal for that hold-cycle, but the interleaving key's normal
//! effect is never blocked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rdev::{Event, EventType, Key};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::capabilities::{Capability, PromptGate};

/// Logical events emitted by the key source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// Trigger key went down
    Pressed,
    /// Trigger key lifted without an intervening cancel
    Released,
    /// Another key was pressed while the trigger was held
    Cancelled,
}

/// Parse a trigger key name into an rdev key.
///
/// Accepts the modifier-style keys that make sense as a hold-to-dictate
/// trigger plus the function row.
pub fn parse_trigger_key(name: &str) -> Option<Key> {
    match name.to_lowercase().as_str() {
        "function" | "fn" => Some(Key::Function),
        "capslock" => Some(Key::CapsLock),
        "controlleft" | "ctrl" => Some(Key::ControlLeft),
        "controlright" => Some(Key::ControlRight),
        "altleft" | "alt" => Some(Key::Alt),
        "altright" | "altgr" => Some(Key::AltGr),
        "metaleft" | "cmd" | "command" => Some(Key::MetaLeft),
        "metaright" => Some(Key::MetaRight),
        "shiftleft" | "shift" => Some(Key::ShiftLeft),
        "shiftright" => Some(Key::ShiftRight),
        "f1" => Some(Key::F1),
        "f2" => Some(Key::F2),
        "f3" => Some(Key::F3),
        "f4" => Some(Key::F4),
        "f5" => Some(Key::F5),
        "f6" => Some(Key::F6),
        "f7" => Some(Key::F7),
        "f8" => Some(Key::F8),
        "f9" => Some(Key::F9),
        "f10" => Some(Key::F10),
        "f11" => Some(Key::F11),
        "f12" => Some(Key::F12),
        _ => None,
    }
}

/// Hold-cycle state machine, kept separate from the OS hook so the
/// press/cancel/debounce rules are testable without one.
#[derive(Debug)]
pub struct HoldTracker {
    trigger: Key,
    held: bool,
    cancelled: bool,
}

impl HoldTracker {
    pub fn new(trigger: Key) -> Self {
        Self { trigger, held: false, cancelled: false }
    }

    /// Feed a raw key press; returns the logical event it produces, if any.
    pub fn on_key_press(&mut self, key: Key) -> Option<KeyEvent> {
        if key == self.trigger {
            if self.held {
                // repeat events while held are ignored
                return None;
            }
            self.held = true;
            self.cancelled = false;
            return Some(KeyEvent::Pressed);
        }

        if self.held && !self.cancelled {
            self.cancelled = true;
            return Some(KeyEvent::Cancelled);
        }

        None
    }

    /// Feed a raw key release; returns the logical event it produces, if any.
    pub fn on_key_release(&mut self, key: Key) -> Option<KeyEvent> {
        if key != self.trigger || !self.held {
            return None;
        }
        self.held = false;
        if self.cancelled {
            // Released is suppressed for a cancelled hold-cycle
            self.cancelled = false;
            return None;
        }
        Some(KeyEvent::Released)
    }
}

/// Key source configuration
#[derive(Debug, Clone)]
pub struct KeySourceConfig {
    pub trigger: Key,
    /// Capacity of the event channel into the orchestrator
    pub channel_capacity: usize,
    /// How often the watchdog checks that the OS hook is still alive
    pub health_poll_interval: Duration,
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self {
            trigger: Key::Function,
            channel_capacity: 32,
            health_poll_interval: Duration::from_secs(30),
        }
    }
}

/// One spawned OS hook thread. `rdev::listen` cannot be unhooked portably,
/// so a retired listener is flagged inert via its own `enabled` flag and the
/// thread is left to idle; a fresh listener gets a fresh flag.
struct Listener {
    thread: std::thread::JoinHandle<()>,
    enabled: Arc<AtomicBool>,
}

impl Listener {
    fn retire(self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

type ListenerSlot = Arc<Mutex<Option<Listener>>>;

/// System-wide trigger-key source.
///
/// `start()` spawns the OS listener thread and a watchdog that re-enables it
/// if the OS tears the hook down (timeout, event-volume kill). Without the
/// input-monitoring permission, `start()` is a no-op that fires a one-time
/// permission prompt through the capability broker.
pub struct KeyEventSource {
    config: KeySourceConfig,
    permissions: Arc<PromptGate>,
    active: Arc<AtomicBool>,
    listener: ListenerSlot,
    tx: mpsc::Sender<KeyEvent>,
}

impl KeyEventSource {
    /// Create the source and the event channel the orchestrator consumes.
    pub fn new(
        config: KeySourceConfig,
        permissions: Arc<PromptGate>,
    ) -> (Self, mpsc::Receiver<KeyEvent>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let source = Self {
            config,
            permissions,
            active: Arc::new(AtomicBool::new(false)),
            listener: Arc::new(Mutex::new(None)),
            tx,
        };
        (source, rx)
    }

    /// Begin intercepting the trigger key. Must be called within a tokio
    /// runtime (the watchdog is a spawned task). Idempotent.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("Key source already running");
            return;
        }

        if !self.permissions.check_or_prompt(Capability::InputMonitoring) {
            warn!("Input monitoring permission missing; key source not started");
            self.active.store(false, Ordering::SeqCst);
            return;
        }

        *self.listener.lock() = Some(spawn_listener(self.config.trigger, self.tx.clone()));
        info!("Trigger key listener started ({:?})", self.config.trigger);

        let active = Arc::clone(&self.active);
        let listener = Arc::clone(&self.listener);
        let tx = self.tx.clone();
        let trigger = self.config.trigger;
        let interval = self.config.health_poll_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                let down =
                    listener.lock().as_ref().map(|l| l.thread.is_finished()).unwrap_or(true);
                if down {
                    warn!("Key listener hook went down, re-enabling");
                    let mut slot = listener.lock();
                    if let Some(old) = slot.take() {
                        old.retire();
                    }
                    *slot = Some(spawn_listener(trigger, tx.clone()));
                }
            }
        });
    }

    /// Release the interception channel. The hook thread itself cannot be
    /// unhooked portably; it is flagged inert and ignores further events.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener.lock().take() {
                listener.retire();
            }
            info!("Trigger key listener stopped");
        }
    }
}

fn spawn_listener(trigger: Key, tx: mpsc::Sender<KeyEvent>) -> Listener {
    let enabled = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&enabled);
    let thread = std::thread::spawn(move || {
        let mut tracker = HoldTracker::new(trigger);
        let result = rdev::listen(move |event: Event| {
            if !flag.load(Ordering::SeqCst) {
                return;
            }
            let logical = match event.event_type {
                EventType::KeyPress(key) => tracker.on_key_press(key),
                EventType::KeyRelease(key) => tracker.on_key_release(key),
                _ => None,
            };
            if let Some(ev) = logical {
                if tx.try_send(ev).is_err() {
                    warn!("Key event channel full, dropping {:?}", ev);
                }
            }
        });
        if let Err(e) = result {
            error!("Key listener exited: {:?}", e);
        }
    });

    Listener { thread, enabled }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_then_release_emits_both() {
        let mut tracker = HoldTracker::new(Key::Function);

        assert_eq!(tracker.on_key_press(Key::Function), Some(KeyEvent::Pressed));
        assert_eq!(tracker.on_key_release(Key::Function), Some(KeyEvent::Released));
    }

    #[test]
    fn test_interleaving_key_cancels_and_suppresses_release() {
        let mut tracker = HoldTracker::new(Key::Function);

        assert_eq!(tracker.on_key_press(Key::Function), Some(KeyEvent::Pressed));
        assert_eq!(tracker.on_key_press(Key::KeyA), Some(KeyEvent::Cancelled));
        // further interleaving keys don't re-cancel
        assert_eq!(tracker.on_key_press(Key::KeyB), None);
        // the release for this hold-cycle is suppressed
        assert_eq!(tracker.on_key_release(Key::Function), None);
        // next hold-cycle is clean
        assert_eq!(tracker.on_key_press(Key::Function), Some(KeyEvent::Pressed));
        assert_eq!(tracker.on_key_release(Key::Function), Some(KeyEvent::Released));
    }

    #[test]
    fn test_repeat_press_is_debounced() {
        let mut tracker = HoldTracker::new(Key::Function);

        assert_eq!(tracker.on_key_press(Key::Function), Some(KeyEvent::Pressed));
        assert_eq!(tracker.on_key_press(Key::Function), None);
        assert_eq!(tracker.on_key_press(Key::Function), None);
        assert_eq!(tracker.on_key_release(Key::Function), Some(KeyEvent::Released));
    }

    #[test]
    fn test_other_keys_while_not_held_are_ignored() {
        let mut tracker = HoldTracker::new(Key::Function);

        assert_eq!(tracker.on_key_press(Key::KeyA), None);
        assert_eq!(tracker.on_key_release(Key::KeyA), None);
        assert_eq!(tracker.on_key_release(Key::Function), None);
    }

    #[test]
    fn test_parse_known_trigger_keys() {
        assert_eq!(parse_trigger_key("fn"), Some(Key::Function));
        assert_eq!(parse_trigger_key("F12"), Some(Key::F12));
        assert_eq!(parse_trigger_key("altright"), Some(Key::AltGr));
        assert_eq!(parse_trigger_key("banana"), None);
    }
}
