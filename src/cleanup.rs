//! Process-wide cleanup on interrupt, termination, and normal exit.
use std::{
    process,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::{debug, warn};

use crate::supervisor::ProcessSupervisor;

/// Exit code used when the run is interrupted by a signal.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Whether an interrupt or termination signal has been received.
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Installs the SIGINT/SIGTERM handler for `supervisor` and returns a guard that
/// cleans up on normal exit.
///
/// The first signal terminates every registered process and exits with
/// [`INTERRUPTED_EXIT_CODE`]. A second signal while cleanup is still running exits
/// immediately. Only one handler can be installed per process.
pub fn install(supervisor: &ProcessSupervisor) -> Result<CleanupGuard, ctrlc::Error> {
    let handler_supervisor = supervisor.clone();
    ctrlc::set_handler(move || {
        if SHUTTING_DOWN.swap(true, Ordering::SeqCst) {
            warn!("Second interrupt received, exiting without waiting for cleanup");
            process::exit(INTERRUPTED_EXIT_CODE);
        }

        warn!("Interrupted, stopping managed processes...");
        handler_supervisor.terminate_all();
        process::exit(INTERRUPTED_EXIT_CODE);
    })?;

    Ok(CleanupGuard::new(supervisor.clone()))
}

/// Terminates every process still registered with the supervisor when dropped.
pub struct CleanupGuard {
    supervisor: ProcessSupervisor,
}

impl CleanupGuard {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        debug!("Running exit cleanup");
        self.supervisor.terminate_all();
    }
}
