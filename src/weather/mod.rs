//! Weather snapshots for observation context.
//!
//! A provider trait with one HTTP implementation against a
//! locationforecast-compatible endpoint. Snapshots are cached for the
//! configured interval so detection bursts cost at most one fetch; fetch
//! failures degrade to the stale snapshot or `None`, never to an error on
//! the detection path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::httpclient::HttpClient;
use crate::types::WeatherSnapshot;

#[async_trait]
pub trait WeatherProvider: Send + Sync + 'static {
    /// The freshest available snapshot, or `None` when unavailable.
    async fn current(&self) -> Option<WeatherSnapshot>;
}

/// Locationforecast response, reduced to the fields we consume.
#[derive(Debug, Deserialize)]
struct ForecastDocument {
    properties: ForecastProperties,
}

#[derive(Debug, Deserialize)]
struct ForecastProperties {
    timeseries: Vec<ForecastEntry>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    data: ForecastData,
}

#[derive(Debug, Deserialize)]
struct ForecastData {
    instant: ForecastInstant,
}

#[derive(Debug, Deserialize)]
struct ForecastInstant {
    details: ForecastDetails,
}

#[derive(Debug, Deserialize)]
struct ForecastDetails {
    #[serde(default)]
    air_temperature: f64,
    #[serde(default)]
    wind_speed: f64,
    #[serde(default)]
    relative_humidity: f64,
    #[serde(default)]
    cloud_area_fraction: f64,
}

/// HTTP-backed provider with a TTL cache.
pub struct HttpWeatherProvider {
    client: HttpClient,
    url: String,
    latitude: f64,
    longitude: f64,
    interval: Duration,
    cached: tokio::sync::Mutex<Option<WeatherSnapshot>>,
    cancel: CancellationToken,
}

impl HttpWeatherProvider {
    pub fn new(
        url: String,
        latitude: f64,
        longitude: f64,
        interval_minutes: u64,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: HttpClient::new(),
            url,
            latitude,
            longitude,
            interval: Duration::from_secs(interval_minutes.max(1) * 60),
            cached: tokio::sync::Mutex::new(None),
            cancel,
        })
    }

    async fn fetch(&self) -> Option<WeatherSnapshot> {
        let query = [
            ("lat", format!("{:.4}", self.latitude)),
            ("lon", format!("{:.4}", self.longitude)),
        ];
        let document: ForecastDocument = match self
            .client
            .get_json(&self.url, &query, None, &self.cancel)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!(error = %e, "weather fetch failed");
                return None;
            }
        };

        let details = &document.properties.timeseries.first()?.data.instant.details;
        Some(WeatherSnapshot {
            temperature_c: details.air_temperature,
            wind_speed_ms: details.wind_speed,
            humidity_percent: details.relative_humidity,
            cloud_cover_percent: details.cloud_area_fraction,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    async fn current(&self) -> Option<WeatherSnapshot> {
        let mut cached = self.cached.lock().await;
        let fresh = cached.as_ref().is_some_and(|snapshot| {
            (Utc::now() - snapshot.fetched_at).to_std().unwrap_or_default() < self.interval
        });
        if fresh {
            return cached.clone();
        }

        match self.fetch().await {
            Some(snapshot) => {
                *cached = Some(snapshot.clone());
                Some(snapshot)
            }
            // Degrade to the stale snapshot rather than dropping context.
            None => cached.clone(),
        }
    }
}
