//! Location sampling sources.
//!
//! A source hands out one cancellable subscription per tracking run. The
//! tracking task consumes it serially, so fixes are processed in delivery
//! order; dropping the stream cancels the subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use log::debug;

use crate::{LocationSample, SourceError};

/// Stream of fixes (or sampling errors) at roughly the requested cadence.
pub type SampleStream = BoxStream<'static, Result<LocationSample, SourceError>>;

/// Produces location fixes.
pub trait LocationSource: Send + Sync {
    /// Start an unbounded subscription at `interval`. Dropping the returned
    /// stream ends it.
    fn subscribe(&self, interval: Duration) -> SampleStream;
}

type SampleSender = mpsc::UnboundedSender<Result<LocationSample, SourceError>>;

/// Source fed by the host pushing fixes in (e.g. from a platform location
/// callback). A new subscription replaces the previous one.
#[derive(Default)]
pub struct ChannelLocationSource {
    sender: Mutex<Option<SampleSender>>,
    interval: Mutex<Option<Duration>>,
    subscriptions: AtomicU64,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChannelLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a fix to the current subscriber. Returns false if nobody is
    /// listening (no run active, or the run was cancelled).
    pub fn push(&self, sample: LocationSample) -> bool {
        self.send(Ok(sample))
    }

    /// Deliver a sampling failure to the current subscriber.
    pub fn push_error(&self, error: SourceError) -> bool {
        self.send(Err(error))
    }

    fn send(&self, item: Result<LocationSample, SourceError>) -> bool {
        let mut sender = relock(&self.sender);
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        if tx.unbounded_send(item).is_ok() {
            return true;
        }
        debug!("[LocationSource] Subscriber gone, dropping fix");
        *sender = None;
        false
    }

    pub fn is_subscribed(&self) -> bool {
        relock(&self.sender)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Interval requested by the most recent subscription.
    pub fn requested_interval(&self) -> Option<Duration> {
        *relock(&self.interval)
    }

    /// Number of subscriptions handed out so far.
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// End the current subscription from the producer side.
    pub fn close(&self) {
        relock(&self.sender).take();
    }
}

impl LocationSource for ChannelLocationSource {
    fn subscribe(&self, interval: Duration) -> SampleStream {
        let (tx, rx) = mpsc::unbounded();
        *relock(&self.sender) = Some(tx);
        *relock(&self.interval) = Some(interval);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        debug!(
            "[LocationSource] New subscription at {} ms",
            interval.as_millis()
        );
        rx.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_reaches_subscriber() {
        let source = ChannelLocationSource::new();
        assert!(!source.push(LocationSample::at(1.0, 2.0)));

        let mut stream = source.subscribe(Duration::from_millis(1_000));
        assert!(source.is_subscribed());
        assert_eq!(source.requested_interval(), Some(Duration::from_millis(1_000)));

        assert!(source.push(LocationSample::at(1.0, 2.0)));
        assert!(source.push_error(SourceError::Unavailable("no fix".into())));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.latitude, 1.0);
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dropped_stream_unsubscribes() {
        let source = ChannelLocationSource::new();
        let stream = source.subscribe(Duration::from_millis(500));
        drop(stream);

        assert!(!source.is_subscribed());
        assert!(!source.push(LocationSample::at(0.0, 0.0)));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let source = ChannelLocationSource::new();
        let mut stream = source.subscribe(Duration::from_millis(500));
        source.close();
        assert!(stream.next().await.is_none());
        assert_eq!(source.subscription_count(), 1);
    }
}
