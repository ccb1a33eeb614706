//! Per-user request admission and cancellation.
//!
//! At most one generation task may be in flight per user. A second request
//! is rejected with `Busy`, never queued; the user retries or cancels.
//! Slots are created lazily on first contact and never torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedMutexGuard, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A generation for this user is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

impl fmt::Display for Busy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a request for this user is already in flight")
    }
}

impl std::error::Error for Busy {}

#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    inflight: Option<InFlight>,
}

struct InFlight {
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

/// Process-wide admission state, constructed once at startup.
#[derive(Default)]
pub struct RequestSerializer {
    slots: Mutex<HashMap<i64, Slot>>,
}

/// Exclusive right to run a generation for one user. Held for the whole
/// generation; dropping it re-opens admission.
pub struct AdmissionPermit {
    user_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl AdmissionPermit {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }
}

/// Registration of a cancellable in-flight generation. Dropping it clears
/// the registry slot and signals completion to any waiting canceller.
pub struct InFlightGuard {
    serializer: Arc<RequestSerializer>,
    user_id: i64,
    _done_tx: oneshot::Sender<()>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slots = self.serializer.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&self.user_id) {
            slot.inflight = None;
        }
        // The done sender drops with self, waking cancel().
    }
}

impl RequestSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new generation request for this user, or fail with `Busy`
    /// while one is in flight. Callers must not queue on failure.
    pub fn admit(&self, user_id: i64) -> Result<AdmissionPermit, Busy> {
        let lock = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(user_id).or_default().lock.clone()
        };
        let guard = lock.try_lock_owned().map_err(|_| Busy)?;
        Ok(AdmissionPermit {
            user_id,
            _guard: guard,
        })
    }

    /// Whether a generation for this user is currently in flight.
    pub fn is_busy(&self, user_id: i64) -> bool {
        let lock = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(user_id).or_default().lock.clone()
        };
        lock.try_lock().is_err()
    }

    /// Register the in-flight generation so a later `cancel` can reach it.
    pub fn register(
        self: &Arc<Self>,
        permit: &AdmissionPermit,
        cancel: CancellationToken,
    ) -> InFlightGuard {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(permit.user_id).or_default();
            slot.inflight = Some(InFlight {
                cancel,
                done: done_rx,
            });
        }
        InFlightGuard {
            serializer: self.clone(),
            user_id: permit.user_id,
            _done_tx: done_tx,
        }
    }

    /// Request cooperative cancellation of the user's in-flight generation
    /// and wait for it to terminate. Returns whether anything was cancelled.
    pub async fn cancel(&self, user_id: i64) -> bool {
        let inflight = {
            let mut slots = self.slots.lock().unwrap();
            slots.get_mut(&user_id).and_then(|slot| slot.inflight.take())
        };

        let Some(inflight) = inflight else {
            return false;
        };

        debug!("Cancelling in-flight request for user {user_id}");
        inflight.cancel.cancel();
        // Resolves once the task drops its guard, whatever the outcome.
        let _ = inflight.done.await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_admission_is_exclusive() {
        let serializer = RequestSerializer::new();
        let permit = serializer.admit(100).unwrap();
        assert!(matches!(serializer.admit(100), Err(Busy)));
        drop(permit);
        assert!(serializer.admit(100).is_ok());
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let serializer = RequestSerializer::new();
        let _permit = serializer.admit(100).unwrap();
        assert!(serializer.admit(200).is_ok());
    }

    #[tokio::test]
    async fn test_is_busy_tracks_permit() {
        let serializer = RequestSerializer::new();
        assert!(!serializer.is_busy(100));
        let permit = serializer.admit(100).unwrap();
        assert!(serializer.is_busy(100));
        drop(permit);
        assert!(!serializer.is_busy(100));
    }

    #[tokio::test]
    async fn test_cancel_without_inflight_is_false() {
        let serializer = RequestSerializer::new();
        assert!(!serializer.cancel(100).await);
    }

    #[tokio::test]
    async fn test_cancel_stops_registered_task() {
        let serializer = Arc::new(RequestSerializer::new());

        let permit = serializer.admit(100).unwrap();
        let cancel = CancellationToken::new();
        let guard = serializer.register(&permit, cancel.clone());

        let task = tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            cancel.cancelled().await;
            // Cooperative early return; guards drop here.
        });

        assert!(serializer.cancel(100).await);
        task.await.unwrap();

        // Slot is free again after cancellation.
        assert!(!serializer.is_busy(100));
        assert!(!serializer.cancel(100).await);
    }

    #[tokio::test]
    async fn test_guard_drop_clears_registry() {
        let serializer = Arc::new(RequestSerializer::new());
        {
            let permit = serializer.admit(100).unwrap();
            let _guard = serializer.register(&permit, CancellationToken::new());
        }
        // Nothing left to cancel once the guards dropped.
        assert!(!serializer.cancel(100).await);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_termination() {
        let serializer = Arc::new(RequestSerializer::new());
        let permit = serializer.admit(100).unwrap();
        let cancel = CancellationToken::new();
        let guard = serializer.register(&permit, cancel.clone());

        let (cleanup_tx, cleanup_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            cancel.cancelled().await;
            // Simulate post-cancellation accounting before unwinding.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cleanup_tx.send(());
        });

        assert!(serializer.cancel(100).await);
        // cancel() only returns after the task's cleanup ran.
        assert!(cleanup_rx.await.is_ok());
    }
}
