//! The injectable "fatal handler" called on conditions the spec says the
//! store cannot cleanly recover from (disk-full during allocation or
//! snapshot writes, on-disk corruption). Grounded in the design notes'
//! explicit substitution for "ad-hoc exit on ENOSPC": production code aborts
//! the process, tests inject a handler that records the call instead.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives notice of an unrecoverable condition and decides how to respond.
/// The default implementation logs and aborts the process, matching the
/// spec's §7 error-handling policy ("the handler logs the failing operation
/// and calls the platform's abort routine").
pub trait FatalHandler: Send + Sync {
    fn fatal(&self, context: &str, error: &crate::error::QpsError) -> !;
}

/// Logs via the `log` crate and aborts. This is what every [`crate::Store`]
/// uses unless a test or embedder substitutes a [`FatalHandler`] via
/// [`crate::StoreOptions::fatal_handler`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortingFatalHandler;

impl FatalHandler for AbortingFatalHandler {
    fn fatal(&self, context: &str, error: &crate::error::QpsError) -> ! {
        log::error!("fatal store error during {context}: {error}");
        std::process::abort();
    }
}

/// A handler that records fatal calls instead of aborting, for use in tests
/// that want to exercise the disk-full / corruption paths without killing
/// the test process. Panics on `fatal`, which is caught by `catch_unwind` in
/// the tests that need it, but otherwise simply increments a counter callers
/// can inspect.
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    count: AtomicUsize,
}

impl RecordingFatalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl FatalHandler for RecordingFatalHandler {
    fn fatal(&self, context: &str, error: &crate::error::QpsError) -> ! {
        self.count.fetch_add(1, Ordering::SeqCst);
        panic!("fatal store error during {context}: {error}");
    }
}
