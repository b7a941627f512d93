//! Reverse geocoding behind a hard timeout.
//!
//! Address enrichment is strictly best-effort: [`ReverseGeocoder::resolve`]
//! never returns an error and never waits longer than its timeout. A lookup
//! that fails or times out yields `None` and the sample is stored without an
//! address. When the caller is cancelled mid-lookup the pending lookup is
//! dropped with it, so a late answer is discarded.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use log::debug;

use crate::GeocodeError;

/// An external address lookup service.
pub trait Geocoder: Send + Sync {
    /// Human-readable address for a coordinate, `Ok(None)` if there is none.
    fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> BoxFuture<'_, Result<Option<String>, GeocodeError>>;
}

/// Geocoder for hosts without an address backend.
pub struct NoopGeocoder;

impl Geocoder for NoopGeocoder {
    fn reverse_geocode(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> BoxFuture<'_, Result<Option<String>, GeocodeError>> {
        future::ready(Ok(None)).boxed()
    }
}

/// Timeout-boxed adapter over any [`Geocoder`].
#[derive(Clone)]
pub struct ReverseGeocoder {
    inner: Arc<dyn Geocoder>,
    timeout: Duration,
}

impl ReverseGeocoder {
    /// Timeout applied when none is configured.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(inner: Arc<dyn Geocoder>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopGeocoder), Self::DEFAULT_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve an address, or `None` on failure, timeout or a blank answer.
    pub async fn resolve(&self, latitude: f64, longitude: f64) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.inner.reverse_geocode(latitude, longitude))
            .await
        {
            Ok(Ok(address)) => address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            Ok(Err(e)) => {
                debug!("[Geocoder] Lookup failed for ({:.5}, {:.5}): {}", latitude, longitude, e);
                None
            }
            Err(_) => {
                debug!(
                    "[Geocoder] Lookup timed out after {} ms for ({:.5}, {:.5})",
                    self.timeout.as_millis(),
                    latitude,
                    longitude
                );
                None
            }
        }
    }
}

// ============================================================================
// Nominatim (OpenStreetMap) geocoder
// ============================================================================

#[cfg(feature = "http")]
mod nominatim {
    use super::*;
    use reqwest::Client;
    use serde::Deserialize;

    const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/reverse";

    #[derive(Debug, Deserialize)]
    struct ReverseResponse {
        display_name: Option<String>,
    }

    /// Reverse geocoder backed by the OpenStreetMap Nominatim API.
    pub struct NominatimGeocoder {
        client: Client,
        endpoint: String,
    }

    impl NominatimGeocoder {
        /// Nominatim's usage policy requires an identifying user agent.
        pub fn new(user_agent: &str) -> Result<Self, GeocodeError> {
            Self::with_endpoint(user_agent, DEFAULT_ENDPOINT)
        }

        pub fn with_endpoint(user_agent: &str, endpoint: &str) -> Result<Self, GeocodeError> {
            let client = Client::builder()
                .user_agent(user_agent)
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| GeocodeError::Http {
                    message: format!("Failed to create HTTP client: {}", e),
                    status_code: None,
                })?;

            Ok(Self {
                client,
                endpoint: endpoint.to_string(),
            })
        }

        async fn lookup(&self, latitude: f64, longitude: f64) -> Result<Option<String>, GeocodeError> {
            let response = self
                .client
                .get(&self.endpoint)
                .query(&[
                    ("format", "jsonv2".to_string()),
                    ("lat", latitude.to_string()),
                    ("lon", longitude.to_string()),
                ])
                .send()
                .await
                .map_err(|e| GeocodeError::Http {
                    message: e.to_string(),
                    status_code: e.status().map(|s| s.as_u16()),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(GeocodeError::Http {
                    message: format!("Reverse lookup returned {}", status),
                    status_code: Some(status.as_u16()),
                });
            }

            let body: ReverseResponse = response.json().await.map_err(|e| GeocodeError::Http {
                message: format!("Invalid response body: {}", e),
                status_code: Some(status.as_u16()),
            })?;

            Ok(body.display_name)
        }
    }

    impl Geocoder for NominatimGeocoder {
        fn reverse_geocode(
            &self,
            latitude: f64,
            longitude: f64,
        ) -> BoxFuture<'_, Result<Option<String>, GeocodeError>> {
            self.lookup(latitude, longitude).boxed()
        }
    }
}

#[cfg(feature = "http")]
pub use nominatim::NominatimGeocoder;

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGeocoder(Result<Option<String>, GeocodeError>);

    impl Geocoder for FixedGeocoder {
        fn reverse_geocode(&self, _: f64, _: f64) -> BoxFuture<'_, Result<Option<String>, GeocodeError>> {
            future::ready(self.0.clone()).boxed()
        }
    }

    struct SlowGeocoder(Duration);

    impl Geocoder for SlowGeocoder {
        fn reverse_geocode(&self, _: f64, _: f64) -> BoxFuture<'_, Result<Option<String>, GeocodeError>> {
            let delay = self.0;
            async move {
                tokio::time::sleep(delay).await;
                Ok(Some("10 Downing Street".to_string()))
            }
            .boxed()
        }
    }

    fn adapter(inner: impl Geocoder + 'static) -> ReverseGeocoder {
        ReverseGeocoder::new(Arc::new(inner), ReverseGeocoder::DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn test_resolves_address() {
        let geocoder = adapter(FixedGeocoder(Ok(Some("  Baker Street  ".to_string()))));
        assert_eq!(
            geocoder.resolve(51.52, -0.15).await.as_deref(),
            Some("Baker Street")
        );
    }

    #[tokio::test]
    async fn test_failure_and_blank_become_none() {
        let failing = adapter(FixedGeocoder(Err(GeocodeError::Lookup("offline".into()))));
        assert_eq!(failing.resolve(0.0, 0.0).await, None);

        let blank = adapter(FixedGeocoder(Ok(Some("   ".to_string()))));
        assert_eq!(blank.resolve(0.0, 0.0).await, None);

        assert_eq!(ReverseGeocoder::disabled().resolve(0.0, 0.0).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_times_out() {
        let geocoder = adapter(SlowGeocoder(Duration::from_secs(30)));
        let started = tokio::time::Instant::now();

        assert_eq!(geocoder.resolve(51.5, -0.1).await, None);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_within_timeout_succeeds() {
        let geocoder = adapter(SlowGeocoder(Duration::from_millis(1_500)));
        assert_eq!(
            geocoder.resolve(51.5, -0.1).await.as_deref(),
            Some("10 Downing Street")
        );
    }
}
