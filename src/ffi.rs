//! FFI bindings for mobile platforms (iOS/Android).
//!
//! The host implements [`PlatformBridge`] once and hands it to
//! [`tracker_init`] at app startup. Every OS entry point (service start,
//! service respawn, boot receiver, notification action, UI lifecycle) then
//! maps onto one `tracker_*` function. A process-wide tokio runtime drives
//! the tracking task between calls.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};

use crate::access::AccessReactor;
use crate::boot::{BootOutcome, BootReactor};
use crate::geocode::Geocoder;
use crate::platform::{AccessChecker, StatusNotifier, StatusUpdate, TaskLauncher};
use crate::services::{install_services, Services};
use crate::source::{ChannelLocationSource, LocationSource, SampleStream};
use crate::store::SessionStore;
use crate::summary;
use crate::tracker::{Command, TrackingTask};
use crate::{
    init_logging, FileRunStateStore, GeocodeError, LocationSample, SourceError,
    SqliteSessionStore, TrackerConfig, TrackerResult,
};

// ============================================================================
// Host callback interface
// ============================================================================

/// Everything the engine needs from the host OS.
/// Implement this in Kotlin/Swift.
#[uniffi::export(callback_interface)]
pub trait PlatformBridge: Send + Sync {
    fn has_location_permission(&self) -> bool;
    fn has_background_location_permission(&self) -> bool;
    fn is_location_provider_enabled(&self) -> bool;

    /// Show or refresh the persistent tracking notification.
    /// `foreground` is true when the service must be promoted to foreground.
    fn show_status(&self, title: String, text: String, foreground: bool);
    fn dismiss_status(&self);

    /// Begin delivering fixes through [`tracker_push_location`].
    fn request_sampling(&self, interval_ms: i64);
    fn stop_sampling(&self);

    /// Ask the OS to start the tracking service, which then calls
    /// [`tracker_start`] with these arguments.
    fn launch_tracking_service(&self, interval_ms: i64, from_boot: bool);

    /// Blocking reverse geocode. Called off the async workers.
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<String>;

    /// JSON-encoded tracker event for user-visible messaging.
    fn on_tracker_event(&self, event_json: String);
}

struct BridgeAdapter {
    bridge: Box<dyn PlatformBridge>,
}

impl AccessChecker for BridgeAdapter {
    fn has_location_permission(&self) -> bool {
        self.bridge.has_location_permission()
    }

    fn has_background_location_permission(&self) -> bool {
        self.bridge.has_background_location_permission()
    }

    fn is_location_provider_enabled(&self) -> bool {
        self.bridge.is_location_provider_enabled()
    }
}

impl StatusNotifier for BridgeAdapter {
    fn promote(&self, status: &StatusUpdate) {
        self.bridge
            .show_status(StatusUpdate::TITLE.to_string(), status.text(), true);
    }

    fn update(&self, status: &StatusUpdate) {
        self.bridge
            .show_status(StatusUpdate::TITLE.to_string(), status.text(), false);
    }

    fn dismiss(&self) {
        self.bridge.dismiss_status();
    }
}

impl TaskLauncher for BridgeAdapter {
    fn launch(&self, command: Command) -> TrackerResult<()> {
        match command {
            Command::Start {
                interval_ms,
                from_boot,
            } => self.bridge.launch_tracking_service(interval_ms, from_boot),
            // Stop and cold entry arrive through the service itself
            other => warn!("[TrackerFFI] Ignoring launch of {:?}", other),
        }
        Ok(())
    }
}

struct BridgeGeocoder(Arc<BridgeAdapter>);

impl Geocoder for BridgeGeocoder {
    fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> BoxFuture<'_, Result<Option<String>, GeocodeError>> {
        let adapter = Arc::clone(&self.0);
        async move {
            tokio::task::spawn_blocking(move || adapter.bridge.reverse_geocode(latitude, longitude))
                .await
                .map_err(|e| GeocodeError::Lookup(e.to_string()))
        }
        .boxed()
    }
}

/// Channel-fed source that tells the host when to sample.
struct BridgeSource {
    channel: ChannelLocationSource,
    adapter: Arc<BridgeAdapter>,
}

/// Stops host sampling when the subscription is dropped.
struct SamplingGuard(Arc<BridgeAdapter>);

impl Drop for SamplingGuard {
    fn drop(&mut self) {
        self.0.bridge.stop_sampling();
    }
}

impl LocationSource for BridgeSource {
    fn subscribe(&self, interval: Duration) -> SampleStream {
        let stream = self.channel.subscribe(interval);
        self.adapter.bridge.request_sampling(interval.as_millis() as i64);

        let guard = SamplingGuard(Arc::clone(&self.adapter));
        stream
            .map(move |item| {
                let _sampling = &guard;
                item
            })
            .boxed()
    }
}

// ============================================================================
// Global state
// ============================================================================

static RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("location-tracker")
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            error!("[TrackerFFI] Failed to create runtime: {}", e);
            None
        }
    }
});

#[derive(Clone)]
struct Tracker {
    task: Arc<TrackingTask>,
    access: Arc<AccessReactor>,
    boot: Arc<BootReactor>,
    source: Arc<BridgeSource>,
}

static TRACKER: Lazy<RwLock<Option<Tracker>>> = Lazy::new(|| RwLock::new(None));

fn tracker() -> Option<Tracker> {
    let tracker = TRACKER.read().ok()?.clone();
    if tracker.is_none() {
        warn!("[TrackerFFI] Called before tracker_init");
    }
    tracker
}

fn block_on<F: Future>(future: F) -> Option<F::Output> {
    RUNTIME.as_ref().map(|runtime| runtime.block_on(future))
}

/// Run a tracking command, logging failures. Returns liveness afterwards.
fn run_command(command: Command) -> bool {
    let Some(tracker) = tracker() else {
        return false;
    };
    match block_on(tracker.task.handle(command)) {
        Some(Ok(outcome)) => info!("[TrackerFFI] {:?} -> {:?}", command, outcome),
        Some(Err(e)) => error!("[TrackerFFI] {:?} failed: {}", command, e),
        None => {}
    }
    tracker.task.is_running()
}

// ============================================================================
// Exports
// ============================================================================

/// Initialize the tracker. Call once at app (or service process) startup.
///
/// `config_json` is an optional partial `TrackerConfig` document.
#[uniffi::export]
pub fn tracker_init(
    db_path: String,
    run_state_path: String,
    config_json: Option<String>,
    bridge: Box<dyn PlatformBridge>,
) -> bool {
    init_logging();
    info!("[TrackerFFI] Initializing with db: {}", db_path);

    let config = match config_json.as_deref().map(TrackerConfig::from_json) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            warn!("[TrackerFFI] Invalid config, using defaults: {}", e);
            TrackerConfig::default()
        }
        None => TrackerConfig::default(),
    };

    let store = match SqliteSessionStore::new(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!("[TrackerFFI] Failed to open session store: {}", e);
            return false;
        }
    };

    let Some(runtime) = RUNTIME.as_ref() else {
        return false;
    };

    let adapter = Arc::new(BridgeAdapter { bridge });
    let source = Arc::new(BridgeSource {
        channel: ChannelLocationSource::new(),
        adapter: Arc::clone(&adapter),
    });

    install_services(
        Services::new(
            Arc::new(store),
            Arc::new(FileRunStateStore::new(run_state_path)),
            source.clone(),
            adapter.clone(),
            adapter.clone(),
            config,
        )
        .with_geocoder(Arc::new(BridgeGeocoder(Arc::clone(&adapter)))),
    );

    let task = match TrackingTask::from_registry() {
        Ok(task) => Arc::new(task),
        Err(e) => {
            error!("[TrackerFFI] {}", e);
            return false;
        }
    };
    let boot = match BootReactor::from_registry(adapter.clone()) {
        Ok(boot) => Arc::new(boot),
        Err(e) => {
            error!("[TrackerFFI] {}", e);
            return false;
        }
    };

    // Forward events to the host for user-visible messaging
    let mut events = task.services().subscribe_events();
    let events_adapter = Arc::clone(&adapter);
    runtime.spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => events_adapter.bridge.on_tracker_event(json),
                    Err(e) => warn!("[TrackerFFI] Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!("[TrackerFFI] Event listener lagged, {} events missed", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let tracker = Tracker {
        access: Arc::new(AccessReactor::new(task.clone())),
        task,
        boot,
        source,
    };
    match TRACKER.write() {
        Ok(mut slot) => {
            if slot.replace(tracker).is_some() {
                warn!("[TrackerFFI] Re-initialized, previous run released for resume");
            }
        }
        Err(e) => {
            error!("[TrackerFFI] Tracker slot poisoned: {}", e);
            return false;
        }
    }

    info!("[TrackerFFI] Initialized successfully");
    true
}

/// START command. Returns whether tracking is running afterwards.
#[uniffi::export]
pub fn tracker_start(interval_ms: i64, from_boot: bool) -> bool {
    run_command(Command::Start {
        interval_ms,
        from_boot,
    })
}

/// STOP command. Returns whether tracking is still running (normally false).
#[uniffi::export]
pub fn tracker_stop() -> bool {
    run_command(Command::Stop)
}

/// Service respawned by the OS without a command.
#[uniffi::export]
pub fn tracker_cold_entry() -> bool {
    run_command(Command::ColdEntry)
}

/// Device finished booting. Returns true if the tracking service was relaunched.
#[uniffi::export]
pub fn tracker_boot_completed() -> bool {
    let Some(tracker) = tracker() else {
        return false;
    };
    match tracker.boot.on_boot_completed() {
        Ok(outcome) => {
            info!("[TrackerFFI] Boot -> {:?}", outcome);
            matches!(outcome, BootOutcome::Relaunched { .. })
        }
        Err(e) => {
            error!("[TrackerFFI] Boot handling failed: {}", e);
            false
        }
    }
}

fn check_access(on_permission_result: bool) -> bool {
    let Some(tracker) = tracker() else {
        return false;
    };
    let result = if on_permission_result {
        block_on(tracker.access.on_permission_result())
    } else {
        block_on(tracker.access.on_resume())
    };
    match result {
        Some(Ok(loss)) => loss.is_some(),
        Some(Err(e)) => {
            error!("[TrackerFFI] Access check failed: {}", e);
            false
        }
        None => false,
    }
}

/// UI returned to the foreground. Returns true if tracking was stopped.
#[uniffi::export]
pub fn tracker_on_resume() -> bool {
    check_access(false)
}

/// A permission dialog completed. Returns true if tracking was stopped.
#[uniffi::export]
pub fn tracker_on_permission_result() -> bool {
    check_access(true)
}

/// Deliver a fix from the platform location callback.
#[uniffi::export]
pub fn tracker_push_location(sample: LocationSample) -> bool {
    tracker()
        .map(|t| t.source.channel.push(sample))
        .unwrap_or(false)
}

/// Report a platform sampling failure.
#[uniffi::export]
pub fn tracker_push_location_error(message: String) -> bool {
    tracker()
        .map(|t| t.source.channel.push_error(SourceError::Unavailable(message)))
        .unwrap_or(false)
}

/// Notification action tapped. Returns true if the action was recognized.
#[uniffi::export]
pub fn tracker_notification_action(action: String) -> bool {
    match Command::from_action(&action) {
        Some(command) => {
            run_command(command);
            true
        }
        None => {
            warn!("[TrackerFFI] Unknown notification action: {}", action);
            false
        }
    }
}

#[uniffi::export]
pub fn tracker_is_running() -> bool {
    tracker().map(|t| t.task.is_running()).unwrap_or(false)
}

/// All sessions as a JSON array of overviews, most recent first.
///
/// `utc_offset_secs` sets the zone for formatted times; `None` uses the
/// device's current offset.
#[uniffi::export]
pub fn tracker_get_sessions_json(utc_offset_secs: Option<i32>) -> String {
    let Some(tracker) = tracker() else {
        return "[]".to_string();
    };
    let offset = utc_offset_secs
        .and_then(chrono::FixedOffset::east_opt)
        .unwrap_or_else(summary::local_offset);

    summary::overviews(tracker.task.services().store.as_ref(), offset)
        .map_err(|e| e.to_string())
        .and_then(|list| serde_json::to_string(&list).map_err(|e| e.to_string()))
        .unwrap_or_else(|e| {
            error!("[TrackerFFI] Failed to load sessions: {}", e);
            "[]".to_string()
        })
}

/// Refused while tracking is live.
#[uniffi::export]
pub fn tracker_delete_all_sessions() -> bool {
    let Some(tracker) = tracker() else {
        return false;
    };
    match block_on(tracker.task.delete_all_sessions()) {
        Some(Ok(())) => {
            info!("[TrackerFFI] All sessions deleted");
            true
        }
        Some(Err(e)) => {
            error!("[TrackerFFI] Failed to delete sessions: {}", e);
            false
        }
        None => false,
    }
}
