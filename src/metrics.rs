//! Metrics Store (C6): sliding per-provider performance statistics.
//!
//! Every observation nudges an exponential moving average; readers always
//! see one provider's coherent snapshot because each provider's counters
//! live behind their own lock, distinct from the outer map lock that only
//! guards provider creation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::database::{DbError, DbPool};
use crate::error::AppError;

const EMA_ALPHA: f64 = 0.1;
const DEFAULT_AVAILABILITY: f64 = 1.0;
const DEFAULT_SPEED_SCORE: f64 = 0.7;

/// Sliding performance statistics for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// EMA-smoothed dispatch latency.
    #[serde(with = "duration_millis")]
    pub avg_latency: Duration,
    /// `successful / total`, in `[0, 1]`.
    pub success_rate: f64,
    /// EMA-smoothed self-reported output quality, in `[0, 1]`.
    pub quality_ema: f64,
    /// Total observations recorded.
    pub total: u64,
    /// Observations that succeeded.
    pub successful: u64,
    /// When the last observation was applied.
    pub last_updated: DateTime<Utc>,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(value.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            avg_latency: Duration::from_millis(0),
            success_rate: DEFAULT_AVAILABILITY,
            quality_ema: 0.0,
            total: 0,
            successful: 0,
            last_updated: Utc::now(),
        }
    }
}

impl ProviderMetrics {
    fn observe(&mut self, latency: Duration, success: bool, quality: f64) {
        let latency_ms = if self.total == 0 {
            latency.as_secs_f64() * 1000.0
        } else {
            (1.0 - EMA_ALPHA) * self.avg_latency.as_secs_f64() * 1000.0 + EMA_ALPHA * latency.as_secs_f64() * 1000.0
        };
        self.avg_latency = Duration::from_secs_f64((latency_ms / 1000.0).max(0.0));

        self.total += 1;
        if success {
            self.successful += 1;
        }
        self.success_rate = (self.successful as f64 / self.total as f64).clamp(0.0, 1.0);

        self.quality_ema = if self.total == 1 {
            quality
        } else {
            (1.0 - EMA_ALPHA) * self.quality_ema + EMA_ALPHA * quality
        };

        self.last_updated = Utc::now();
    }
}

/// An external sink metrics snapshots may be periodically flushed to. The
/// concrete backend (time-series DB, etc.) is out of scope; [`NoOpSink`]
/// is the default.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Receives a full snapshot of all providers' metrics.
    async fn flush(&self, snapshot: &HashMap<String, ProviderMetrics>);
}

/// The default sink: discards every flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

#[async_trait]
impl MetricsSink for NoOpSink {
    async fn flush(&self, _snapshot: &HashMap<String, ProviderMetrics>) {}
}

/// Persists each flush to `provider_metrics`, so the live EMAs a fresh
/// process starts with come from `MetricsStore::hydrate` rather than cold
/// defaults.
pub struct DbMetricsSink {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for DbMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbMetricsSink").finish()
    }
}

impl DbMetricsSink {
    /// Builds a sink over `pool`.
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsSink for DbMetricsSink {
    async fn flush(&self, snapshot: &HashMap<String, ProviderMetrics>) {
        for (provider, metrics) in snapshot {
            let result = sqlx::query(
                r"INSERT INTO provider_metrics
                    (provider, avg_latency_ms, success_rate, quality_ema, total, successful, last_updated)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(provider) DO UPDATE SET
                       avg_latency_ms = excluded.avg_latency_ms, success_rate = excluded.success_rate,
                       quality_ema = excluded.quality_ema, total = excluded.total,
                       successful = excluded.successful, last_updated = excluded.last_updated",
            )
            .bind(provider)
            .bind(metrics.avg_latency.as_millis() as i64)
            .bind(metrics.success_rate)
            .bind(metrics.quality_ema)
            .bind(metrics.total as i64)
            .bind(metrics.successful as i64)
            .bind(metrics.last_updated.to_rfc3339())
            .execute(&*self.pool)
            .await;

            if let Err(err) = result {
                tracing::warn!(provider, error = %err, "failed to persist provider metrics");
            }
        }
    }
}

/// Keyed-by-provider store of sliding performance statistics.
#[derive(Debug, Default)]
pub struct MetricsStore {
    providers: RwLock<HashMap<String, Arc<Mutex<ProviderMetrics>>>>,
}

impl MetricsStore {
    /// Builds an empty store; metrics are created lazily on first observation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Repopulates this store from the last snapshot persisted to
    /// `provider_metrics` by a [`DbMetricsSink`] flush, so averages
    /// survive a restart instead of resetting to the cold defaults.
    pub async fn hydrate(&self, pool: &DbPool) -> Result<(), AppError> {
        let rows = sqlx::query(
            "SELECT provider, avg_latency_ms, success_rate, quality_ema, total, successful, last_updated FROM provider_metrics",
        )
        .fetch_all(pool)
        .await
        .map_err(|err| AppError::DatabaseError(DbError::QueryFailed(err)))?;

        let mut providers = self.providers.write();
        for row in rows {
            let name: String = row.get(0);
            let metrics = ProviderMetrics {
                avg_latency: Duration::from_millis(row.get::<i64, _>(1) as u64),
                success_rate: row.get(2),
                quality_ema: row.get(3),
                total: row.get::<i64, _>(4) as u64,
                successful: row.get::<i64, _>(5) as u64,
                last_updated: chrono::DateTime::parse_from_rfc3339(&row.get::<String, _>(6))
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            };
            providers.insert(name, Arc::new(Mutex::new(metrics)));
        }
        Ok(())
    }

    fn entry(&self, provider_name: &str) -> Arc<Mutex<ProviderMetrics>> {
        if let Some(existing) = self.providers.read().get(provider_name) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.providers
                .write()
                .entry(provider_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProviderMetrics::default()))),
        )
    }

    /// Records one dispatch observation for `provider_name`.
    pub fn record(&self, provider_name: &str, latency: Duration, success: bool, quality: f64) {
        let entry = self.entry(provider_name);
        entry.lock().observe(latency, success, quality);
    }

    /// A coherent snapshot of one provider's metrics, if any have been
    /// recorded yet.
    pub fn snapshot(&self, provider_name: &str) -> Option<ProviderMetrics> {
        self.providers
            .read()
            .get(provider_name)
            .map(|entry| entry.lock().clone())
    }

    /// Live success-rate, defaulting to 1.0 until a provider has been
    /// observed at all.
    pub fn availability(&self, provider_name: &str) -> f64 {
        self.snapshot(provider_name)
            .map_or(DEFAULT_AVAILABILITY, |m| m.success_rate)
    }

    /// Piecewise-linear speed score from average latency: `1.0` at or
    /// below 500ms, `0.1` at or above 5s, linear in between; `0.7` default
    /// before any observation.
    pub fn speed_score(&self, provider_name: &str) -> f64 {
        let Some(metrics) = self.snapshot(provider_name) else {
            return DEFAULT_SPEED_SCORE;
        };
        speed_score_from_latency(metrics.avg_latency)
    }

    /// A full snapshot of every tracked provider's metrics.
    pub fn snapshot_all(&self) -> HashMap<String, ProviderMetrics> {
        self.providers
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.lock().clone()))
            .collect()
    }

    /// Spawns a long-lived task that periodically flushes a full snapshot
    /// to `sink`, stopping at the next tick after `cancellation` fires.
    pub fn spawn_flush_loop(
        self: Arc<Self>,
        sink: Arc<dyn MetricsSink>,
        period: Duration,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = self.snapshot_all();
                        sink.flush(&snapshot).await;
                    }
                }
            }
        })
    }
}

fn speed_score_from_latency(avg_latency: Duration) -> f64 {
    let ms = avg_latency.as_secs_f64() * 1000.0;
    if ms <= 500.0 {
        1.0
    } else if ms >= 5000.0 {
        0.1
    } else {
        1.0 + (ms - 500.0) * (0.1 - 1.0) / (5000.0 - 500.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_seeds_latency_and_quality_directly() {
        let store = MetricsStore::new();
        store.record("openai", Duration::from_millis(300), true, 0.9);
        let snapshot = store.snapshot("openai").unwrap();
        assert_eq!(snapshot.avg_latency, Duration::from_millis(300));
        assert!((snapshot.quality_ema - 0.9).abs() < 1e-9);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.successful, 1);
    }

    #[test]
    fn success_rate_never_exceeds_bounds() {
        let store = MetricsStore::new();
        store.record("p", Duration::from_millis(100), true, 0.8);
        store.record("p", Duration::from_millis(100), false, 0.2);
        let snapshot = store.snapshot("p").unwrap();
        assert!(snapshot.success_rate >= 0.0 && snapshot.success_rate <= 1.0);
        assert!(snapshot.total >= snapshot.successful);
    }

    #[test]
    fn availability_defaults_to_one_until_observed() {
        let store = MetricsStore::new();
        assert!((store.availability("unseen") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn speed_score_defaults_and_bounds() {
        let store = MetricsStore::new();
        assert!((store.speed_score("unseen") - 0.7).abs() < f64::EPSILON);

        store.record("fast", Duration::from_millis(100), true, 0.9);
        assert!((store.speed_score("fast") - 1.0).abs() < f64::EPSILON);

        store.record("slow", Duration::from_millis(8000), true, 0.9);
        assert!((store.speed_score("slow") - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn db_sink_flush_round_trips_through_hydrate() {
        let pool = Arc::new(crate::database::init_db("sqlite::memory:").await.unwrap());
        crate::database::ensure_schema(&pool).await.unwrap();

        let store = MetricsStore::new();
        store.record("openai", Duration::from_millis(250), true, 0.8);
        let sink = DbMetricsSink::new(Arc::clone(&pool));
        sink.flush(&store.snapshot_all()).await;

        let rehydrated = MetricsStore::new();
        rehydrated.hydrate(&pool).await.unwrap();
        let snapshot = rehydrated.snapshot("openai").unwrap();
        assert_eq!(snapshot.total, 1);
        assert!((snapshot.quality_ema - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flush_loop_invokes_sink_and_stops_on_cancellation() {
        #[derive(Default)]
        struct CountingSink(Mutex<u32>);

        #[async_trait::async_trait]
        impl MetricsSink for CountingSink {
            async fn flush(&self, _snapshot: &HashMap<String, ProviderMetrics>) {
                *self.0.lock() += 1;
            }
        }

        let store = Arc::new(MetricsStore::new());
        store.record("p", Duration::from_millis(100), true, 0.9);
        let sink = Arc::new(CountingSink::default());
        let token = CancellationToken::new();

        let handle = Arc::clone(&store).spawn_flush_loop(
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
            Duration::from_millis(10),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(*sink.0.lock() >= 1);
    }
}
