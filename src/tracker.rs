//! # Tracking Task
//!
//! The long-running background unit that owns the sampling loop.
//!
//! ## Commands
//!
//! - **`Start`**: no-op if already live. Otherwise checks permission, resolves
//!   or creates the open session, marks itself live, persists the run-state
//!   and subscribes to the location source.
//! - **`Stop`**: clears liveness and run-state, cancels the subscription and
//!   closes the open session.
//! - **`ColdEntry`**: invocation without a command after an OS respawn. The
//!   durable run-state decides whether to resume or to clean up.
//!
//! ## Two liveness signals
//!
//! The in-memory [`LivenessFlag`] only guards against double starts inside
//! one process. The persisted [`RunState`] is authoritative across process
//! boundaries. They are never merged.
//!
//! ## Failure policy
//!
//! Sampling-source errors and single-sample persistence errors are logged and
//! skipped. The task itself never dies from them. A source whose stream ends
//! without a `Stop` takes the run down the stop path, so liveness never
//! outlives the subscription.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::geo_utils;
use crate::platform::{StatusUpdate, TaskLauncher};
use crate::run_state::RunState;
use crate::services::{resolve_services, Services, TrackerEvent};
use crate::source::SampleStream;
use crate::{LocationPoint, LocationSample, Session, SourceError, TrackerError, TrackerResult};

// ============================================================================
// Commands and outcomes
// ============================================================================

/// Entry points of the tracking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `from_boot` marks a launch by the boot reactor; the stronger
    /// background permission is then required before going foreground.
    Start { interval_ms: i64, from_boot: bool },
    Stop,
    /// OS respawn with no payload.
    ColdEntry,
}

impl Command {
    /// A user-initiated start.
    pub fn start(interval_ms: i64) -> Self {
        Command::Start {
            interval_ms,
            from_boot: false,
        }
    }

    /// Map a status indicator action id to its command.
    pub fn from_action(action: &str) -> Option<Self> {
        (action == StatusUpdate::STOP_ACTION).then_some(Command::Stop)
    }
}

/// What a command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Sampling began. `resumed_session` is true when an already open
    /// session was picked up instead of creating one.
    Started {
        session_id: i64,
        interval_ms: i64,
        resumed_session: bool,
    },
    /// A cold entry resumed sampling from the persisted run-state.
    Resumed { session_id: i64, interval_ms: i64 },
    AlreadyRunning,
    /// Start refused for lack of permission; run-state corrected.
    PermissionDenied,
    Stopped { session: Option<Session> },
    /// Cold entry with nothing to resume.
    Idle,
    /// Cold entry could not legally resume; session closed, run-state cleared.
    ResumeDenied { closed: Option<Session> },
}

// ============================================================================
// Liveness flag
// ============================================================================

/// Process-lifetime marker of whether the task is executing.
///
/// Not durable: after a process restart it always starts out false,
/// whatever the persisted run-state says.
#[derive(Debug, Default)]
pub struct LivenessFlag(AtomicBool);

impl LivenessFlag {
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip false -> true. Returns false if it was already live.
    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Status throttle
// ============================================================================

/// Rate limit for status indicator updates.
///
/// An update is allowed once at least `ratio * interval` has elapsed since the
/// previous one. Storage is not throttled; every sample is still appended.
#[derive(Debug, Clone)]
pub struct StatusThrottle {
    min_gap_ms: i64,
    last_update_ms: Option<i64>,
}

impl StatusThrottle {
    pub fn new(interval_ms: i64, ratio: f64) -> Self {
        Self {
            min_gap_ms: (interval_ms as f64 * ratio).round() as i64,
            last_update_ms: None,
        }
    }

    pub fn min_gap_ms(&self) -> i64 {
        self.min_gap_ms
    }

    /// Whether an update at `now_ms` is allowed; records it if so.
    pub fn should_update(&mut self, now_ms: i64) -> bool {
        match self.last_update_ms {
            Some(last) if now_ms - last < self.min_gap_ms => false,
            _ => {
                self.last_update_ms = Some(now_ms);
                true
            }
        }
    }
}

// ============================================================================
// Tracking task
// ============================================================================

struct ActiveRun {
    run_id: u64,
    session_id: i64,
    interval_ms: i64,
    handle: JoinHandle<()>,
}

type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

/// The background tracking unit. One per process.
pub struct TrackingTask {
    services: Services,
    /// Also serializes command handling. Shared with the sampling loop so a
    /// run whose source ends can retire itself.
    run: RunSlot,
    next_run_id: AtomicU64,
}

impl TrackingTask {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            run: Arc::new(Mutex::new(None)),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Construct from the process-wide registry, as the OS-instantiated
    /// entry point does.
    pub fn from_registry() -> TrackerResult<Self> {
        Ok(Self::new(resolve_services()?))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.services.liveness.is_live()
    }

    /// Session and interval of the current run, if any.
    pub async fn current_run(&self) -> Option<(i64, i64)> {
        self.run
            .lock()
            .await
            .as_ref()
            .map(|run| (run.session_id, run.interval_ms))
    }

    pub async fn start(&self, interval_ms: i64) -> TrackerResult<Outcome> {
        self.handle(Command::start(interval_ms)).await
    }

    pub async fn stop(&self) -> TrackerResult<Outcome> {
        self.handle(Command::Stop).await
    }

    pub async fn cold_entry(&self) -> TrackerResult<Outcome> {
        self.handle(Command::ColdEntry).await
    }

    /// Handle one command. Commands are processed one at a time.
    pub async fn handle(&self, command: Command) -> TrackerResult<Outcome> {
        let mut run = self.run.lock().await;
        match command {
            Command::Start {
                interval_ms,
                from_boot,
            } => self.start_locked(&mut run, interval_ms, from_boot).await,
            Command::Stop => self.stop_locked(&mut run).await,
            Command::ColdEntry => self.cold_entry_locked(&mut run).await,
        }
    }

    /// Process commands from a queue until every sender is gone.
    pub async fn serve(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match self.handle(command).await {
                Ok(outcome) => debug!("[Tracker] {:?} -> {:?}", command, outcome),
                Err(e) => error!("[Tracker] {:?} failed: {}", command, e),
            }
        }
        debug!("[Tracker] Command queue closed");
    }

    /// Delete every stored session. Refused while a run is live because the
    /// open session belongs to it.
    pub async fn delete_all_sessions(&self) -> TrackerResult<()> {
        let _run = self.run.lock().await;
        if self.services.liveness.is_live() {
            info!("[Tracker] Delete-all refused while tracking");
            return Err(TrackerError::TrackingActive);
        }
        self.services.store.delete_all_sessions()?;
        Ok(())
    }

    async fn start_locked(
        &self,
        run: &mut Option<ActiveRun>,
        requested_interval_ms: i64,
        from_boot: bool,
    ) -> TrackerResult<Outcome> {
        let services = &self.services;
        if services.liveness.is_live() {
            debug!("[Tracker] Start ignored, already running");
            return Ok(Outcome::AlreadyRunning);
        }

        let interval_ms = services
            .config
            .effective_interval_ms(Some(requested_interval_ms));

        let access = &services.access;
        let permitted = access.has_location_permission()
            && (!from_boot || access.has_background_location_permission());
        if !permitted {
            info!(
                "[Tracker] Start refused: missing {} permission",
                if from_boot { "background location" } else { "location" }
            );
            self.persist(RunState::stopped(Some(interval_ms)));
            if from_boot {
                // Nothing can legally run, so nothing may claim to be open
                close_open_session(services);
            }
            return Ok(Outcome::PermissionDenied);
        }

        if let Some(stale) = run.take() {
            warn!("[Tracker] Discarding stale run for session {}", stale.session_id);
            stale.handle.abort();
        }

        let (session, created) = services
            .store
            .open_or_create_session(services.clock.now_ms())?;

        if !services.liveness.try_acquire() {
            return Ok(Outcome::AlreadyRunning);
        }
        self.persist(RunState::tracking(interval_ms));

        services
            .notifier
            .promote(&StatusUpdate::waiting(session.session_id, session.point_count));

        let stream = services
            .source
            .subscribe(Duration::from_millis(interval_ms as u64));
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        // The loop cannot take the slot before we fill it: we hold the lock.
        let handle = tokio::spawn(supervise_run(
            services.clone(),
            Arc::clone(&self.run),
            run_id,
            session,
            interval_ms,
            stream,
        ));

        *run = Some(ActiveRun {
            run_id,
            session_id: session.session_id,
            interval_ms,
            handle,
        });

        info!(
            "[Tracker] Tracking {} session {} every {} ms",
            if created { "new" } else { "resumed" },
            session.session_id,
            interval_ms
        );
        services.emit(TrackerEvent::Started {
            session_id: session.session_id,
            interval_ms,
        });

        Ok(Outcome::Started {
            session_id: session.session_id,
            interval_ms,
            resumed_session: !created,
        })
    }

    async fn stop_locked(&self, run: &mut Option<ActiveRun>) -> TrackerResult<Outcome> {
        // Cancel first and let the loop unwind so no point lands after end_time.
        // An in-flight geocode lookup is dropped with it.
        if let Some(active) = run.take() {
            active.handle.abort();
            if let Err(e) = active.handle.await {
                if !e.is_cancelled() {
                    error!("[Tracker] Sampling loop failed: {}", e);
                }
            }
        }

        let closed = wind_down(&self.services);
        Ok(Outcome::Stopped { session: closed })
    }

    async fn cold_entry_locked(&self, run: &mut Option<ActiveRun>) -> TrackerResult<Outcome> {
        let services = &self.services;
        let state = match services.run_state.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("[Tracker] Unreadable run-state, treating as stopped: {}", e);
                RunState::default()
            }
        };

        if !state.is_tracking_intended {
            debug!("[Tracker] Cold entry: tracking not intended");
            return Ok(Outcome::Idle);
        }
        if services.liveness.is_live() {
            return Ok(Outcome::AlreadyRunning);
        }

        let access = &services.access;
        if access.has_location_permission() && access.is_location_provider_enabled() {
            let interval_ms = services.config.effective_interval_ms(state.interval_ms);
            info!("[Tracker] Cold entry: resuming at {} ms", interval_ms);
            return match self.start_locked(run, interval_ms, false).await? {
                Outcome::Started {
                    session_id,
                    interval_ms,
                    ..
                } => Ok(Outcome::Resumed {
                    session_id,
                    interval_ms,
                }),
                other => Ok(other),
            };
        }

        info!("[Tracker] Cold entry: permission or provider missing, closing out");
        let closed = close_open_session(services);
        if let Err(e) = services.run_state.clear() {
            error!("[Tracker] Failed to clear run-state: {}", e);
        }
        Ok(Outcome::ResumeDenied { closed })
    }

    fn persist(&self, state: RunState) {
        if let Err(e) = self.services.run_state.save(&state) {
            error!("[Tracker] Failed to persist run-state: {}", e);
        }
    }
}

impl Drop for TrackingTask {
    fn drop(&mut self) {
        // Run-state and the open session stay as they are so a successor
        // can resume; only the in-process claim goes.
        let Ok(mut run) = self.run.try_lock() else {
            return;
        };
        if let Some(active) = run.take() {
            active.handle.abort();
            self.services.liveness.release();
            debug!("[Tracker] Task dropped during run for session {}", active.session_id);
        }
    }
}

/// Clear liveness and run-state, close the open session and retire the
/// status indicator.
fn wind_down(services: &Services) -> Option<Session> {
    services.liveness.release();
    if let Err(e) = services.run_state.clear() {
        error!("[Tracker] Failed to persist stopped run-state: {}", e);
    }

    let closed = close_open_session(services);
    services.notifier.dismiss();

    info!(
        "[Tracker] Stopped{}",
        closed
            .map(|s| format!(" session {} with {} points", s.session_id, s.point_count))
            .unwrap_or_default()
    );
    services.emit(TrackerEvent::Stopped {
        session_id: closed.map(|s| s.session_id),
    });
    closed
}

fn close_open_session(services: &Services) -> Option<Session> {
    let now = services.clock.now_ms();
    match services.store.close_active_session(now) {
        Ok(closed) => closed,
        Err(e) => {
            error!("[Tracker] Failed to close open session: {}", e);
            None
        }
    }
}

// ============================================================================
// Sampling loop
// ============================================================================

/// Run the sampling loop. A source that ends on its own takes the run down
/// the stop path, unless a command already replaced or ended this run.
async fn supervise_run(
    services: Services,
    slot: RunSlot,
    run_id: u64,
    session: Session,
    interval_ms: i64,
    stream: SampleStream,
) {
    sampling_loop(&services, session, interval_ms, stream).await;

    let mut run = slot.lock().await;
    if run.as_ref().map(|active| active.run_id) != Some(run_id) {
        return;
    }
    // Dropping our own handle only detaches it
    run.take();
    warn!(
        "[Tracker] Location stream ended, stopping session {}",
        session.session_id
    );
    wind_down(&services);
}

/// Reject fixes outside WGS84 bounds.
fn validate_fix(sample: LocationSample) -> Result<LocationSample, SourceError> {
    if sample.position().is_valid() {
        Ok(sample)
    } else {
        Err(SourceError::InvalidFix {
            latitude: sample.latitude,
            longitude: sample.longitude,
        })
    }
}

async fn sampling_loop(
    services: &Services,
    session: Session,
    interval_ms: i64,
    mut stream: SampleStream,
) {
    let session_id = session.session_id;
    let mut throttle = StatusThrottle::new(interval_ms, services.config.status_throttle_ratio);
    let mut point_count = session.point_count;

    // A resumed session continues after its last stored point
    let store = Arc::clone(&services.store);
    let mut last: Option<LocationPoint> =
        match tokio::task::spawn_blocking(move || store.get_session(session_id)).await {
            Ok(Ok(stored)) => stored.and_then(|s| s.points.last().cloned()),
            Ok(Err(e)) => {
                warn!("[Tracker] Could not load last point of session {}: {}", session_id, e);
                None
            }
            Err(e) => {
                warn!("[Tracker] Last point lookup failed: {}", e);
                None
            }
        };

    while let Some(item) = stream.next().await {
        let sample = match item.and_then(validate_fix) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("[Tracker] Sampling error: {}", e);
                continue;
            }
        };

        let now = services.clock.now_ms();
        let timestamp = last.as_ref().map_or(now, |prev| now.max(prev.timestamp));

        let address = services
            .geocoder
            .resolve(sample.latitude, sample.longitude)
            .await;

        let point = stamp_sample(
            &sample,
            session_id,
            timestamp,
            address,
            last.as_ref(),
            services.config.derive_motion,
        );

        // If the loop is cancelled mid-write the insert still finishes; the
        // store rejects it once the session is closed.
        let store = Arc::clone(&services.store);
        let stored = point.clone();
        match tokio::task::spawn_blocking(move || {
            store.add_location_to_session(session_id, &stored)
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[Tracker] Dropping sample for session {}: {}", session_id, e);
                continue;
            }
            Err(e) => {
                warn!("[Tracker] Append for session {} failed: {}", session_id, e);
                continue;
            }
        }
        point_count += 1;

        if throttle.should_update(timestamp) {
            services.notifier.update(&StatusUpdate {
                session_id,
                latitude: Some(point.latitude),
                longitude: Some(point.longitude),
                address: point.address.clone(),
                point_count,
            });
        }

        last = Some(point);
    }

    info!("[Tracker] Location stream ended for session {}", session_id);
}

/// Turn a raw fix into a stored point.
fn stamp_sample(
    sample: &LocationSample,
    session_id: i64,
    timestamp: i64,
    address: Option<String>,
    previous: Option<&LocationPoint>,
    derive_motion: bool,
) -> LocationPoint {
    let mut speed = sample.speed;
    let mut bearing = sample.bearing;

    if derive_motion && (speed.is_none() || bearing.is_none()) {
        let derived = previous.and_then(|prev| {
            geo_utils::motion_between(
                &prev.position(),
                &sample.position(),
                timestamp - prev.timestamp,
            )
        });
        if let Some((derived_speed, derived_bearing)) = derived {
            speed = speed.or(Some(derived_speed));
            // Heading is undefined when standing still
            if derived_speed > 0.0 {
                bearing = bearing.or(Some(derived_bearing));
            }
        }
    }

    LocationPoint {
        session_id,
        latitude: sample.latitude,
        longitude: sample.longitude,
        timestamp,
        accuracy: sample.accuracy,
        altitude: sample.altitude,
        speed,
        bearing,
        address,
    }
}

// ============================================================================
// Command queue
// ============================================================================

/// Queue of OS-delivered commands, drained by [`TrackingTask::serve`].
#[derive(Clone)]
pub struct CommandQueue {
    sender: mpsc::UnboundedSender<Command>,
}

impl CommandQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn send(&self, command: Command) -> TrackerResult<()> {
        self.sender
            .send(command)
            .map_err(|e| TrackerError::Launch(format!("Tracking task is gone: {:?}", e.0)))
    }
}

impl TaskLauncher for CommandQueue {
    fn launch(&self, command: Command) -> TrackerResult<()> {
        self.send(command)
    }
}
