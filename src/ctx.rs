//! Process-wide scan context: the quiet flag and the cooperative abort flag
//! toggled by the SIGINT handler.
//!
//! The handler is installed once per process. While a scan is running
//! (`arm()` .. `disarm()`) an interrupt only raises the abort flag and every
//! blocking wait in the pipeline notices it within one 10 ms tick; outside a
//! scan the handler terminates the process directly, so an interrupt during
//! merge is not intercepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use crate::error::EXIT_INTERRUPTED;

static INSTALL: Once = Once::new();

#[derive(Clone)]
pub struct Ctx {
    pub quiet: bool,
    abort: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
}

impl Ctx {
    pub fn new(quiet: bool) -> Self {
        let ctx = Ctx {
            quiet,
            abort: Arc::new(AtomicBool::new(false)),
            armed: Arc::new(AtomicBool::new(false)),
        };
        let abort = Arc::clone(&ctx.abort);
        let armed = Arc::clone(&ctx.armed);
        INSTALL.call_once(move || {
            let _ = ctrlc::set_handler(move || {
                if armed.load(Ordering::SeqCst) {
                    abort.store(true, Ordering::SeqCst);
                } else {
                    std::process::exit(EXIT_INTERRUPTED);
                }
            });
        });
        ctx
    }

    /// Route the next interrupt into the abort flag instead of terminating.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Restore terminate-on-interrupt behavior after a scan.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Raise the abort flag. Thread bodies use this to convert their own
    /// failures into a pipeline-wide stop instead of dropping data silently.
    pub fn raise_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_roundtrip() {
        let ctx = Ctx::new(true);
        assert!(!ctx.aborted());
        ctx.raise_abort();
        assert!(ctx.aborted());
    }

    #[test]
    fn clones_share_the_flag() {
        let ctx = Ctx::new(true);
        let other = ctx.clone();
        other.raise_abort();
        assert!(ctx.aborted());
    }
}
