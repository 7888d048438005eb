//! Ownership of the named OS objects for one capture process.
//!
//! `SharedResources` opens the lock and the segment together, hands the loop
//! a scoped publish, and removes both names again on teardown. Teardown is
//! explicit and idempotent; `Drop` runs it as a backstop so an early return
//! or panic still unmaps and unlinks.

use crate::capture::{FrameSink, Shutdown};
use crate::error::{RelayError, RelayResult};
use crate::gate::{LockGuard, NamedLock};
use crate::layout::FrameLayout;
use crate::store::SharedFrameStore;

/// Well-known name of the shared segment.
pub const DEFAULT_SEGMENT_NAME: &str = "/video_stream";
/// Well-known name of the lock guarding it.
pub const DEFAULT_LOCK_NAME: &str = "/live_alert_mutex";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    pub segment: String,
    pub lock: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            segment: DEFAULT_SEGMENT_NAME.to_string(),
            lock: DEFAULT_LOCK_NAME.to_string(),
        }
    }
}

pub struct SharedResources {
    names: ResourceNames,
    lock: NamedLock,
    store: SharedFrameStore,
    shutdown: Shutdown,
    torn_down: bool,
}

impl SharedResources {
    /// Create (or attach to) the lock and the segment.
    ///
    /// With `reset_stale`, objects left behind by an earlier run are unlinked
    /// first, which recovers from a lock that died held or a segment sized for
    /// another resolution.
    pub fn open(
        names: ResourceNames,
        layout: FrameLayout,
        reset_stale: bool,
    ) -> RelayResult<Self> {
        if reset_stale {
            if NamedLock::unlink(&names.lock)? {
                log::warn!("removed stale named lock {}", names.lock);
            }
            if SharedFrameStore::unlink(&names.segment)? {
                log::warn!("removed stale shared segment {}", names.segment);
            }
        }

        let lock = NamedLock::open(&names.lock)?;
        let store = SharedFrameStore::create(&names.segment, layout)?;
        log::info!(
            "shared memory initialized: segment {} ({} bytes, {}), lock {}",
            names.segment,
            layout.segment_len(),
            if store.was_created() { "created" } else { "reopened" },
            names.lock
        );
        Ok(Self {
            names,
            lock,
            store,
            shutdown: Shutdown::new(),
            torn_down: false,
        })
    }

    /// Abandon lock waits once `shutdown` is requested. Waits then fail with
    /// [`RelayError::Cancelled`] instead of blocking on a stuck reader.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn layout(&self) -> FrameLayout {
        self.store.layout()
    }

    pub fn store(&self) -> &SharedFrameStore {
        &self.store
    }

    pub fn lock(&self) -> &NamedLock {
        &self.lock
    }

    /// Sequence the next publish should carry: one past whatever a previous
    /// run left in the segment, so readers always see the counter move.
    pub fn resume_sequence(&self) -> RelayResult<u32> {
        let _held = self.hold()?;
        Ok(self.store.sequence()?.wrapping_add(1))
    }

    /// Publish under the lock. The lock is released on every path,
    /// including when the write fails.
    pub fn publish(&mut self, frame: &[u8], sequence: u32) -> RelayResult<()> {
        let held = self
            .lock
            .acquire_until(&self.shutdown)?
            .ok_or_else(|| RelayError::Cancelled(self.names.lock.clone()))?;
        let written = self.store.publish(frame, sequence);
        let released = held.release();
        written?;
        released
    }

    fn hold(&self) -> RelayResult<LockGuard<'_>> {
        self.lock
            .acquire_until(&self.shutdown)?
            .ok_or_else(|| RelayError::Cancelled(self.names.lock.clone()))
    }

    /// Unmap, close and unlink everything. Failures are logged, never
    /// returned; calling it again does nothing.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.store.close();
        match SharedFrameStore::unlink(&self.names.segment) {
            Ok(true) => log::info!("shared segment {} unlinked", self.names.segment),
            Ok(false) => log::warn!(
                "shared segment {} was already unlinked",
                self.names.segment
            ),
            Err(e) => log::warn!("failed to unlink shared segment: {}", e),
        }

        match self.lock.unlink_self() {
            Ok(true) => log::info!("named lock {} unlinked", self.names.lock),
            Ok(false) => log::warn!("named lock {} was already unlinked", self.names.lock),
            Err(e) => log::warn!("failed to unlink named lock: {}", e),
        }
        self.lock.close();
        log::info!("cleanup completed");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl FrameSink for SharedResources {
    fn publish(&mut self, frame: &[u8], sequence: u32) -> RelayResult<()> {
        SharedResources::publish(self, frame, sequence)
    }
}

impl Drop for SharedResources {
    fn drop(&mut self) {
        self.teardown();
    }
}
