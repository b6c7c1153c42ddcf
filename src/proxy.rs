//! Runtime-protocol proxy (SPEC_FULL §10.6).
//!
//! Out of scope per spec.md §1 ("the runtime-protocol proxy that forwards
//! create/start/stop/update requests" is an external collaborator). This
//! module defines the lifecycle-event shape and the trait the engine uses
//! to emit a finished [`PendingRequest`] back toward the runtime, plus a
//! recording implementation for tests.

use crate::controllers::PendingRequest;
use crate::types::ContainerId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Create,
    Start,
    Update,
    Stop,
}

/// The engine's view of a runtime client: somewhere to forward the
/// controller pipeline's mutated pending request once a hook sequence
/// completes (spec §4.4 `apply`, §4.9).
pub trait RuntimeProxy: Send + Sync {
    fn submit(&self, container: &ContainerId, event: LifecycleEvent, request: PendingRequest);
}

/// Records every submission for assertions in tests; a production build
/// would forward these over the runtime's own wire protocol instead.
#[derive(Debug, Default)]
pub struct RecordingProxy {
    pub submissions: Mutex<Vec<(ContainerId, LifecycleEvent, PendingRequest)>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuntimeProxy for RecordingProxy {
    fn submit(&self, container: &ContainerId, event: LifecycleEvent, request: PendingRequest) {
        self.submissions.lock().push((container.clone(), event, request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_proxy_keeps_submission_order() {
        let proxy = RecordingProxy::new();
        proxy.submit(&ContainerId::from("c1"), LifecycleEvent::Start, PendingRequest::default());
        proxy.submit(&ContainerId::from("c2"), LifecycleEvent::Stop, PendingRequest::default());
        let submissions = proxy.submissions.lock();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].0, ContainerId::from("c1"));
    }
}
