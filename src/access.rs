//! Permission and provider loss detection.
//!
//! The UI layer calls [`AccessReactor::on_resume`] whenever it returns to the
//! foreground and [`AccessReactor::on_permission_result`] after every
//! permission dialog. If tracking is live but location permission or the
//! location provider is gone, the tracking task is stopped and an event is
//! raised for user-visible messaging.

use std::sync::Arc;

use log::info;

use crate::services::TrackerEvent;
use crate::tracker::TrackingTask;
use crate::TrackerResult;

/// Why tracking can no longer continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLoss {
    PermissionRevoked,
    ProviderDisabled,
}

impl AccessLoss {
    fn event(self) -> TrackerEvent {
        match self {
            AccessLoss::PermissionRevoked => TrackerEvent::PermissionLost,
            AccessLoss::ProviderDisabled => TrackerEvent::ProviderDisabled,
        }
    }
}

pub struct AccessReactor {
    task: Arc<TrackingTask>,
}

impl AccessReactor {
    pub fn new(task: Arc<TrackingTask>) -> Self {
        Self { task }
    }

    /// Current access state, `None` if everything required is available.
    pub fn evaluate(&self) -> Option<AccessLoss> {
        let access = &self.task.services().access;
        if !access.has_location_permission() {
            Some(AccessLoss::PermissionRevoked)
        } else if !access.is_location_provider_enabled() {
            Some(AccessLoss::ProviderDisabled)
        } else {
            None
        }
    }

    pub async fn on_resume(&self) -> TrackerResult<Option<AccessLoss>> {
        self.check().await
    }

    pub async fn on_permission_result(&self) -> TrackerResult<Option<AccessLoss>> {
        self.check().await
    }

    /// Stop the task if it is live and access was lost. Returns the loss that
    /// caused a stop.
    async fn check(&self) -> TrackerResult<Option<AccessLoss>> {
        if !self.task.is_running() {
            return Ok(None);
        }
        let Some(loss) = self.evaluate() else {
            return Ok(None);
        };

        info!("[AccessReactor] Stopping tracking: {:?}", loss);
        self.task.stop().await?;
        self.task.services().emit(loss.event());
        Ok(Some(loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::platform::{AccessChecker, StatusNotifier, StatusUpdate};
    use crate::source::ChannelLocationSource;
    use crate::store::SessionStore;
    use crate::{FileRunStateStore, Services, SqliteSessionStore, TrackerConfig};

    struct Toggle {
        permission: AtomicBool,
        provider: AtomicBool,
    }

    impl AccessChecker for Toggle {
        fn has_location_permission(&self) -> bool {
            self.permission.load(Ordering::SeqCst)
        }
        fn has_background_location_permission(&self) -> bool {
            self.has_location_permission()
        }
        fn is_location_provider_enabled(&self) -> bool {
            self.provider.load(Ordering::SeqCst)
        }
    }

    struct SilentNotifier;

    impl StatusNotifier for SilentNotifier {
        fn promote(&self, _: &StatusUpdate) {}
        fn update(&self, _: &StatusUpdate) {}
        fn dismiss(&self) {}
    }

    fn setup(dir: &tempfile::TempDir) -> (AccessReactor, Arc<TrackingTask>, Arc<Toggle>) {
        let access = Arc::new(Toggle {
            permission: AtomicBool::new(true),
            provider: AtomicBool::new(true),
        });
        let services = Services::new(
            Arc::new(SqliteSessionStore::in_memory().unwrap()),
            Arc::new(FileRunStateStore::new(dir.path().join("run_state.json"))),
            Arc::new(ChannelLocationSource::new()),
            Arc::new(SilentNotifier),
            access.clone(),
            TrackerConfig::default(),
        );
        let task = Arc::new(TrackingTask::new(services));
        (AccessReactor::new(task.clone()), task, access)
    }

    #[tokio::test]
    async fn test_idle_task_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (reactor, _, access) = setup(&dir);
        access.permission.store(false, Ordering::SeqCst);

        assert_eq!(reactor.evaluate(), Some(AccessLoss::PermissionRevoked));
        assert_eq!(reactor.on_resume().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_provider_loss_stops_live_task() {
        let dir = tempfile::tempdir().unwrap();
        let (reactor, task, access) = setup(&dir);
        let mut events = task.services().subscribe_events();

        task.start(1_000).await.unwrap();
        assert_eq!(reactor.on_resume().await.unwrap(), None);
        assert!(task.is_running());

        access.provider.store(false, Ordering::SeqCst);
        assert_eq!(
            reactor.on_permission_result().await.unwrap(),
            Some(AccessLoss::ProviderDisabled)
        );
        assert!(!task.is_running());
        assert!(task.services().store.get_active_session().unwrap().is_none());

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.last(), Some(&TrackerEvent::ProviderDisabled));
    }
}
