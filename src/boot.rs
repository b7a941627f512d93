//! Device boot entry point.
//!
//! Invoked by the OS once the device has finished booting. Re-arms the
//! tracking task when the persisted run-state says tracking was active and
//! background location access is granted. Without that permission nothing
//! may run, so any open session is closed and run-state is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use crate::platform::TaskLauncher;
use crate::run_state::RunState;
use crate::services::{resolve_services, Services};
use crate::tracker::Command;
use crate::{Session, TrackerResult};

/// What the boot reactor decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    NotIntended,
    /// The tracking task was asked to start with `from_boot` set.
    Relaunched { interval_ms: i64 },
    ResumeDenied { closed: Option<Session> },
    /// A second boot signal in the same process lifetime.
    AlreadyHandled,
}

pub struct BootReactor {
    services: Services,
    launcher: Arc<dyn TaskLauncher>,
    handled: AtomicBool,
}

impl BootReactor {
    pub fn new(services: Services, launcher: Arc<dyn TaskLauncher>) -> Self {
        Self {
            services,
            launcher,
            handled: AtomicBool::new(false),
        }
    }

    /// Construct from the process-wide registry.
    pub fn from_registry(launcher: Arc<dyn TaskLauncher>) -> TrackerResult<Self> {
        Ok(Self::new(resolve_services()?, launcher))
    }

    pub fn on_boot_completed(&self) -> TrackerResult<BootOutcome> {
        if self.handled.swap(true, Ordering::SeqCst) {
            info!("[BootReactor] Boot signal already handled");
            return Ok(BootOutcome::AlreadyHandled);
        }

        let state = match self.services.run_state.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("[BootReactor] Unreadable run-state, not resuming: {}", e);
                RunState::default()
            }
        };
        if !state.is_tracking_intended {
            info!("[BootReactor] Tracking not intended, nothing to do");
            return Ok(BootOutcome::NotIntended);
        }

        if !self.services.access.has_background_location_permission() {
            info!("[BootReactor] Background location permission missing, closing out");
            let now = self.services.clock.now_ms();
            let closed = match self.services.store.close_active_session(now) {
                Ok(closed) => closed,
                Err(e) => {
                    error!("[BootReactor] Failed to close open session: {}", e);
                    None
                }
            };
            if let Err(e) = self.services.run_state.clear() {
                error!("[BootReactor] Failed to clear run-state: {}", e);
            }
            return Ok(BootOutcome::ResumeDenied { closed });
        }

        let interval_ms = self.services.config.effective_interval_ms(state.interval_ms);
        self.launcher.launch(Command::Start {
            interval_ms,
            from_boot: true,
        })?;
        info!("[BootReactor] Relaunching tracking at {} ms", interval_ms);

        Ok(BootOutcome::Relaunched { interval_ms })
    }
}
