//! Process-wide service registry.
//!
//! The OS instantiates the tracking task and the boot reactor itself, so they
//! cannot receive collaborators through constructors. The host installs a
//! [`Services`] bundle once at startup and every entry point resolves it here.

use std::sync::{Arc, RwLock};

use log::info;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::geocode::{Geocoder, ReverseGeocoder};
use crate::platform::{AccessChecker, Clock, StatusNotifier, SystemClock};
use crate::run_state::RunStateStore;
use crate::source::LocationSource;
use crate::store::SessionStore;
use crate::tracker::LivenessFlag;
use crate::{TrackerConfig, TrackerError, TrackerResult};

/// Capacity of the UI event channel. Slow listeners miss old events.
const EVENT_CAPACITY: usize = 64;

/// Events surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TrackerEvent {
    Started { session_id: i64, interval_ms: i64 },
    Stopped { session_id: Option<i64> },
    /// Location permission was revoked while tracking
    PermissionLost,
    /// The location provider was switched off while tracking
    ProviderDisabled,
    /// Ad-hoc message for the user
    Message { text: String },
}

/// Everything the tracking engine needs from its environment.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn SessionStore>,
    pub run_state: Arc<dyn RunStateStore>,
    pub geocoder: ReverseGeocoder,
    pub source: Arc<dyn LocationSource>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub access: Arc<dyn AccessChecker>,
    pub clock: Arc<dyn Clock>,
    /// Same-process double-start guard. Never persisted.
    pub liveness: Arc<LivenessFlag>,
    pub events: broadcast::Sender<TrackerEvent>,
    pub config: TrackerConfig,
}

impl Services {
    /// Bundle with a system clock, no geocoder and a fresh liveness flag.
    pub fn new(
        store: Arc<dyn SessionStore>,
        run_state: Arc<dyn RunStateStore>,
        source: Arc<dyn LocationSource>,
        notifier: Arc<dyn StatusNotifier>,
        access: Arc<dyn AccessChecker>,
        config: TrackerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            run_state,
            geocoder: ReverseGeocoder::disabled(),
            source,
            notifier,
            access,
            clock: Arc::new(SystemClock),
            liveness: Arc::new(LivenessFlag::default()),
            events,
            config,
        }
    }

    /// Use `geocoder` for address lookups, bounded by the configured timeout.
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = ReverseGeocoder::new(geocoder, self.config.geocode_timeout());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event; having no listeners is not an error.
    pub fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Global registry
// ============================================================================

static SERVICES: Lazy<RwLock<Option<Services>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide services.
///
/// Re-installing keeps the existing liveness flag so a running task is still
/// seen as running by entry points resolved afterwards.
pub fn install_services(mut services: Services) {
    let mut slot = SERVICES.write().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = slot.as_ref() {
        services.liveness = Arc::clone(&existing.liveness);
    }
    *slot = Some(services);
    info!("[Services] Tracker services installed");
}

/// Resolve the process-wide services installed by the host.
pub fn resolve_services() -> TrackerResult<Services> {
    SERVICES
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(TrackerError::NotInstalled)
}

/// Whether [`install_services`] has been called.
pub fn services_installed() -> bool {
    SERVICES
        .read()
        .map(|slot| slot.is_some())
        .unwrap_or(false)
}
