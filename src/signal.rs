//! Signal handling and the shared cancellation flag.
//!
//! A single atomic cancel flag is shared by every stage of a scan: the
//! walker, the hash workers, the perceptual grouper, and the orchestrator's
//! stage-boundary checkpoints all observe the same `Arc<AtomicBool>`.
//! Ctrl+C sets it; callers may also set it programmatically (e.g. a UI
//! cancel button).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Exit code for SIGINT (Ctrl+C) interruption: 128 + signal number.
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Centralized cancellation handle.
///
/// Wraps an `AtomicBool` that is set when Ctrl+C is received or when
/// [`CancelHandle::request_cancel`] is called. The flag can be cloned out
/// with [`CancelHandle::flag`] and handed to worker threads.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a new handle with cancellation not requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request cancellation. Observed by every component holding the flag.
    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Get a clone of the underlying flag for passing to worker threads.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Reset the flag to `false`. Primarily useful in tests.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for signal handler installation.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// Failed to install the Ctrl+C handler.
    #[error("Failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

static GLOBAL_HANDLE: OnceLock<CancelHandle> = OnceLock::new();

/// Install a Ctrl+C handler that sets the cancel flag on interrupt.
///
/// Call once, early in startup, before any long-running work begins. If a
/// handler is already installed (e.g. in tests running in the same
/// process), the existing handle is reset and returned, so parallel tests
/// never fail on handler conflicts.
///
/// # Errors
///
/// Never fails in practice: if the OS-level hook cannot be registered the
/// function falls back to an unhooked handle that still supports
/// programmatic cancellation.
pub fn install_handler() -> Result<CancelHandle, SignalError> {
    if let Some(handle) = GLOBAL_HANDLE.get() {
        handle.reset();
        return Ok(handle.clone());
    }

    let handle = CancelHandle::new();
    let flag = handle.flag();

    match ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);

        let _ = writeln!(std::io::stderr(), "\nInterrupted. Cleaning up...");
        let _ = std::io::stderr().flush();

        log::info!("Cancellation signal received");
    }) {
        Ok(()) => {
            let _ = GLOBAL_HANDLE.set(handle.clone());
            Ok(handle)
        }
        Err(_) => {
            if let Some(handle) = GLOBAL_HANDLE.get() {
                handle.reset();
                Ok(handle.clone())
            } else {
                log::debug!("Ctrl+C handler already registered, using unhooked handle");
                let fallback = CancelHandle::new();
                let _ = GLOBAL_HANDLE.set(fallback.clone());
                Ok(fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_new() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_request_cancel() {
        let handle = CancelHandle::new();
        handle.request_cancel();
        assert!(handle.is_cancelled());

        handle.reset();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_flag_shares_state() {
        let handle = CancelHandle::new();
        let flag = handle.flag();

        assert!(!flag.load(Ordering::SeqCst));
        handle.request_cancel();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_clone_shares_flag() {
        let handle = CancelHandle::new();
        let cloned = handle.clone();

        handle.request_cancel();
        assert!(cloned.is_cancelled());
    }

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CancelHandle>();
    }
}
