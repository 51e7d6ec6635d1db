//! External fetcher contracts.
//!
//! The engine consumes these as opaque async callables; it never
//! implements the wire protocol, auth, or transport behind them. Grounded
//! on the `#[async_trait::async_trait]` external-collaborator trait
//! pattern used for `RemoteQuerySubscriber` in the pack's
//! `ankurah` live-query reference file.

use async_trait::async_trait;
use serde_json::Value;

/// Error returned by an external fetcher. Carries only a message: the
/// engine doesn't interpret fetch failures beyond "this sync failed."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError(pub String);

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FetchError {}

impl From<&str> for FetchError {
    fn from(s: &str) -> Self {
        FetchError(s.to_string())
    }
}

impl From<String> for FetchError {
    fn from(s: String) -> Self {
        FetchError(s)
    }
}

/// Supplies the authoritative record sequence for a Model Store.
#[async_trait]
pub trait GroundTruthFetcher: Send + Sync {
    async fn fetch_ground_truth(&self) -> Result<Vec<Value>, FetchError>;
}

/// Supplies the authoritative identifier sequence for a Queryset Store.
#[async_trait]
pub trait QuerySetFetcher: Send + Sync {
    async fn fetch_query_set(&self) -> Result<Vec<Value>, FetchError>;
}

/// Supplies a Metric's ground-truth aggregate value.
#[async_trait]
pub trait MetricFetcher: Send + Sync {
    async fn fetch_metric_value(&self) -> Result<Option<Value>, FetchError>;
}
