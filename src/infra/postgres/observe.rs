use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::Instrument;

use crate::app::{IndexError, MatchError};

/// Which store a metric or span belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Subsystem {
    Indexer,
    Matcher,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Indexer => "indexer",
            Subsystem::Matcher => "matcher",
        }
    }
}

/// Internal error carried between the query sites and the method harness.
/// The harness stamps the method name on before it crosses the store
/// boundary.
#[derive(Debug)]
pub(crate) enum MethodError {
    Sql(sqlx::Error),
    Validation(String),
    NotIndexed,
    Internal(String),
}

impl From<sqlx::Error> for MethodError {
    fn from(value: sqlx::Error) -> Self {
        MethodError::Sql(value)
    }
}

impl MethodError {
    pub(crate) fn into_index_error(self, method: &'static str) -> IndexError {
        match self {
            MethodError::Sql(source) => IndexError::Store { method, source },
            MethodError::Validation(message) => IndexError::Validation(message),
            MethodError::NotIndexed => IndexError::NotIndexed,
            MethodError::Internal(message) => IndexError::Internal { method, message },
        }
    }

    pub(crate) fn into_match_error(self, method: &'static str) -> MatchError {
        match self {
            MethodError::Sql(source) => MatchError::Store { method, source },
            MethodError::Validation(message) => MatchError::Validation(message),
            MethodError::NotIndexed => {
                MatchError::Internal { method, message: "not indexed".to_string() }
            }
            MethodError::Internal(message) => MatchError::Internal { method, message },
        }
    }
}

/// Per-method call counters and latency histograms, shared by both stores.
pub struct StoreMetrics {
    calls: IntCounterVec,
    call_time: HistogramVec,
    skipped: IntCounterVec,
}

impl StoreMetrics {
    pub fn new() -> Self {
        let calls = IntCounterVec::new(
            Opts::new("vulnstore_method_calls", "Store method invocations"),
            &["subsystem", "method", "status"],
        )
        .expect("static metric description");
        let call_time = HistogramVec::new(
            HistogramOpts::new(
                "vulnstore_method_call_time",
                "Store method latency in seconds",
            ),
            &["subsystem", "method"],
        )
        .expect("static metric description");
        let skipped = IntCounterVec::new(
            Opts::new(
                "vulnstore_ingest_skipped",
                "Records dropped during ingest for failing validation",
            ),
            &["subsystem", "method"],
        )
        .expect("static metric description");
        Self {
            calls,
            call_time,
            skipped,
        }
    }

    /// Bumps the ingest-skip counter; used when an updater hands over
    /// records that cannot be stored (e.g. a vulnerability without a
    /// package name).
    pub fn add_skipped(&self, subsystem: Subsystem, method: &'static str, count: u64) {
        if count > 0 {
            self.skipped
                .with_label_values(&[subsystem.as_str(), method])
                .inc_by(count);
        }
    }

    /// Registration is best-effort: a collision (two stores sharing one
    /// registry) keeps the first collector and is logged, not fatal.
    pub fn register(&self, registry: &Registry) {
        for collector in [
            Box::new(self.calls.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(self.call_time.clone()),
            Box::new(self.skipped.clone()),
        ] {
            if let Err(error) = registry.register(collector) {
                tracing::warn!(%error, "metric registration skipped");
            }
        }
    }

    fn observe(&self, subsystem: Subsystem, method: &'static str, ok: bool, started: Instant) {
        let status = if ok { "ok" } else { "error" };
        self.calls
            .with_label_values(&[subsystem.as_str(), method, status])
            .inc();
        self.call_time
            .with_label_values(&[subsystem.as_str(), method])
            .observe(started.elapsed().as_secs_f64());
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The method harness: stamps the method into a span, times the call,
/// bumps the counters and fails the span on error. Every public store
/// method runs inside exactly one of these.
pub(crate) async fn observed<T, Fut>(
    metrics: &StoreMetrics,
    subsystem: Subsystem,
    method: &'static str,
    fut: Fut,
) -> Result<T, MethodError>
where
    Fut: Future<Output = Result<T, MethodError>>,
{
    let span = tracing::info_span!(
        "store_method",
        db.system = "postgresql",
        subsystem = subsystem.as_str(),
        method,
    );
    let started = Instant::now();
    let result = fut.instrument(span).await;
    metrics.observe(subsystem, method, result.is_ok(), started);
    if let Err(error) = &result {
        tracing::debug!(subsystem = subsystem.as_str(), method, ?error, "store method failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observed_counts_successes_and_failures() {
        let metrics = StoreMetrics::new();

        let ok: Result<i32, MethodError> =
            observed(&metrics, Subsystem::Indexer, "persist_manifest", async { Ok(1) }).await;
        assert!(ok.is_ok());

        let err: Result<i32, MethodError> = observed(
            &metrics,
            Subsystem::Indexer,
            "persist_manifest",
            async { Err(MethodError::Internal("boom".to_string())) },
        )
        .await;
        assert!(err.is_err());

        let ok_count = metrics
            .calls
            .with_label_values(&["indexer", "persist_manifest", "ok"])
            .get();
        let err_count = metrics
            .calls
            .with_label_values(&["indexer", "persist_manifest", "error"])
            .get();
        assert_eq!((ok_count, err_count), (1, 1));
    }

    #[test]
    fn registration_collisions_are_not_fatal() {
        let registry = Registry::new();
        let a = StoreMetrics::new();
        let b = StoreMetrics::new();
        a.register(&registry);
        b.register(&registry);
    }

    #[test]
    fn method_error_stamps_the_method_name() {
        let err = MethodError::Internal("lost".to_string()).into_index_error("index_packages");
        assert_eq!(err.to_string(), "index_packages: lost");
    }
}
