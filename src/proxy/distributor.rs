//! Tracks the proxy currently wired into the live browser session.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::ProxyRecord;

/// Owner of the active proxy assignment.
///
/// `request_rotation` only swaps the assignment; the caller is responsible
/// for propagating the change to the live session (driver `set_proxy` plus a
/// bridge confirmation wait) when it returns true. At most one acquisition
/// attempt mutates the assignment at a time; the session lease guarantees
/// that.
pub struct ProxyDistributor {
    current: Mutex<Option<Arc<ProxyRecord>>>,
}

impl ProxyDistributor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub fn current_proxy(&self) -> Option<Arc<ProxyRecord>> {
        self.current.lock().clone()
    }

    /// Assign `candidate` as the active proxy. Returns false when the
    /// candidate is already active (no propagation needed), true when the
    /// assignment changed.
    pub fn request_rotation(&self, candidate: Arc<ProxyRecord>) -> bool {
        let mut current = self.current.lock();

        if let Some(active) = current.as_ref() {
            if active.full_url() == candidate.full_url() {
                return false;
            }
        }

        info!("Rotating active proxy to {}", candidate.url());
        *current = Some(candidate);
        true
    }
}

impl Default for ProxyDistributor {
    fn default() -> Self {
        Self::new()
    }
}
