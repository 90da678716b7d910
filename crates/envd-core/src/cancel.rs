use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag checked by readiness polling.
///
/// Clones observe the same flag. Cancelling is sticky: once set the token
/// stays cancelled for the rest of the process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Trip `token` on Ctrl-C. A second Ctrl-C exits the process immediately.
pub fn install_signal_handler(token: CancelToken) {
    let result = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ncancellation requested, stopping after the current step...");
    });
    if let Err(e) = result {
        tracing::warn!("failed to install Ctrl-C handler: {e}");
    }
}
