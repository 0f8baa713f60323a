//! Termination signals.
//!
//! SIGINT, SIGTERM and SIGHUP are counted, not acted on. The supervisor loop
//! and the block job poll loop look at the count and return an error, so the
//! process group, the staging area and the snapshot session are all released
//! through their `Drop` impls in the usual order.
//!
//! ```text
//! 1st signal   stop archiving, commit every overlay, exit 130
//! 2nd signal   stop waiting for block jobs that are still running
//! 3rd signal   exit on the spot
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use crate::error::BackupError;

pub const SIGNALS: [libc::c_int; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Signals after which the handler calls `_exit` instead of counting.
const HARD_EXIT_AFTER: usize = 3;

/// Exit status for a run stopped by a signal.
pub const EXIT_CODE: u8 = 130;

/// Shared count of termination requests. Clones observe the same count.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    count: Arc<AtomicUsize>,
}

impl Interrupt {
    /// A count that only [`raise`](Self::raise) moves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count [`SIGNALS`] delivered to this process from now on.
    pub fn install() -> io::Result<Self> {
        let interrupt = Self::new();
        for signal in SIGNALS {
            let count = Arc::clone(&interrupt.count);
            // SAFETY: the handler does one atomic add and maybe `_exit`, both
            // async-signal-safe.
            unsafe {
                signal_hook::low_level::register(signal, move || {
                    if count.fetch_add(1, Ordering::SeqCst) + 1 >= HARD_EXIT_AFTER {
                        signal_hook::low_level::exit(EXIT_CODE as libc::c_int);
                    }
                })?;
            }
        }
        Ok(interrupt)
    }

    /// Record a termination request, as a signal would.
    pub fn raise(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.count() > 0
    }

    /// Whether another request arrived after `mark` was taken with [`count`](Self::count).
    pub fn raised_since(&self, mark: usize) -> bool {
        self.count() > mark
    }

    pub fn check(&self) -> Result<(), BackupError> {
        if self.is_raised() {
            Err(BackupError::Interrupted)
        } else {
            Ok(())
        }
    }
}
