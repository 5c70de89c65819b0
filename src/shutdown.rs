//! Graceful shutdown and cancellation coordination.
//!
//! A [`ShutdownCoordinator`] is shared between the task that requests
//! cancellation (Ctrl+C handler, supervisor) and the workers that observe it.
//! Coordinators form a tree: cancelling a parent cancels every child created
//! from it, while cancelling a child leaves the parent and siblings running.
//! The supervisor hands each download its own child of the process-wide
//! coordinator.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

static GLOBAL_SHUTDOWN: OnceCell<SharedShutdown> = OnceCell::new();

/// Register a global shutdown handle so subsystems can discover it lazily.
pub fn set_global_shutdown(handle: SharedShutdown) {
    let _ = GLOBAL_SHUTDOWN.set(handle);
}

/// Retrieve the registered global shutdown handle, if available.
pub fn get_global_shutdown() -> Option<SharedShutdown> {
    GLOBAL_SHUTDOWN.get().cloned()
}

/// Coordinates graceful shutdown across async tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<ShutdownCoordinator>>>,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Create a child coordinator that is cancelled together with `self`.
    pub fn child(self: &Arc<Self>) -> SharedShutdown {
        let child = Self::shared();
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_shutdown_requested() {
            child.request_shutdown();
        } else {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        child
    }

    /// Request shutdown. Notifies all waiters and children exactly once.
    pub fn request_shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let children = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.request_shutdown();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent request is not missed.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}

/// Resolve once `handle` is cancelled; never resolves without a handle.
pub async fn cancelled(handle: Option<&SharedShutdown>) {
    match handle {
        Some(shutdown) => shutdown.wait_for_shutdown().await,
        None => std::future::pending::<()>().await,
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(duration: Duration, handle: Option<&SharedShutdown>) -> bool {
    if handle.is_some_and(|s| s.is_shutdown_requested()) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancelled(handle) => false,
    }
}
