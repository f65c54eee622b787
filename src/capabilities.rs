//! Platform permission capabilities
//!
//! The concrete permission dialogs are platform-bound and owned by the host;
//! the core only asks "is this authorized?" and fires a one-time prompt
//! request through the broker when it is not.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Elevated permissions the pipeline depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Microphone,
    /// "Control other applications' UI" (synthetic input, accessibility writes)
    AssistiveControl,
    /// System-wide key event interception
    InputMonitoring,
}

/// Seam to the host's permission layer
pub trait CapabilityBroker: Send + Sync {
    fn is_authorized(&self, capability: Capability) -> bool;

    /// Ask the host to show its permission prompt for `capability`.
    fn request(&self, capability: Capability);
}

/// Deduplicates permission prompts: each capability is requested at most
/// once per process, no matter how many attempts trip over it.
pub struct PromptGate {
    broker: Arc<dyn CapabilityBroker>,
    prompted: Mutex<HashSet<Capability>>,
}

impl PromptGate {
    pub fn new(broker: Arc<dyn CapabilityBroker>) -> Self {
        Self { broker, prompted: Mutex::new(HashSet::new()) }
    }

    pub fn is_authorized(&self, capability: Capability) -> bool {
        self.broker.is_authorized(capability)
    }

    /// Check authorization, prompting once on first denial.
    ///
    /// Returns `true` when the capability is already granted.
    pub fn check_or_prompt(&self, capability: Capability) -> bool {
        if self.broker.is_authorized(capability) {
            return true;
        }
        if self.prompted.lock().insert(capability) {
            info!("Requesting {:?} permission", capability);
            self.broker.request(capability);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DenyAll {
        requests: AtomicUsize,
    }

    impl CapabilityBroker for DenyAll {
        fn is_authorized(&self, _capability: Capability) -> bool {
            false
        }
        fn request(&self, _capability: Capability) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_prompts_once_per_capability() {
        let broker = Arc::new(DenyAll { requests: AtomicUsize::new(0) });
        let gate = PromptGate::new(broker.clone());

        assert!(!gate.check_or_prompt(Capability::Microphone));
        assert!(!gate.check_or_prompt(Capability::Microphone));
        assert!(!gate.check_or_prompt(Capability::Microphone));
        assert_eq!(broker.requests.load(Ordering::SeqCst), 1);

        assert!(!gate.check_or_prompt(Capability::AssistiveControl));
        assert_eq!(broker.requests.load(Ordering::SeqCst), 2);
    }

    struct AllowAll;

    impl CapabilityBroker for AllowAll {
        fn is_authorized(&self, _capability: Capability) -> bool {
            true
        }
        fn request(&self, _capability: Capability) {
            panic!("must not prompt when authorized");
        }
    }

    #[test]
    fn test_authorized_capability_never_prompts() {
        let gate = PromptGate::new(Arc::new(AllowAll));
        assert!(gate.check_or_prompt(Capability::InputMonitoring));
    }
}
