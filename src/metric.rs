//! Metric + Metric Engine: optimistic aggregate computation over a
//! Model Store.
//!
//! Each aggregate is a small `Strategy` trait object with per-variant
//! dispatch (`Count`, `Sum`, `Min`, `Max`), combining the server-supplied
//! base value with the pending operations' effect on it rather than
//! recomputing the aggregate from scratch on every render.

use crate::event::EventKind;
use crate::fetch::MetricFetcher;
use crate::render::{RenderEngine, RenderParams};
use crate::store_model::ModelStore;
use crate::{Error, Version};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

fn numeric_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn field_value(record: &Value, field: &str) -> Option<f64> {
    record.get(field).and_then(numeric_value)
}

/// Computes an aggregate function over a record sequence, combining
/// incremental changes against a ground-truth base.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn requires_field(&self) -> bool;
    fn compute(
        &self,
        base: Option<f64>,
        ground_truth: &[Value],
        optimistic: &[Value],
        field: Option<&str>,
    ) -> Result<Option<f64>, Error>;
}

pub struct Count;

impl Strategy for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn requires_field(&self) -> bool {
        false
    }

    fn compute(
        &self,
        base: Option<f64>,
        ground_truth: &[Value],
        optimistic: &[Value],
        field: Option<&str>,
    ) -> Result<Option<f64>, Error> {
        let (gt_n, opt_n) = match field {
            Some(f) => (
                ground_truth.iter().filter(|r| field_value(r, f).is_some()).count() as f64,
                optimistic.iter().filter(|r| field_value(r, f).is_some()).count() as f64,
            ),
            None => (ground_truth.len() as f64, optimistic.len() as f64),
        };
        let result = base.unwrap_or(0.0) + (opt_n - gt_n);
        Ok(Some(result.max(0.0)))
    }
}

pub struct Sum;

impl Strategy for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn requires_field(&self) -> bool {
        true
    }

    fn compute(
        &self,
        base: Option<f64>,
        ground_truth: &[Value],
        optimistic: &[Value],
        field: Option<&str>,
    ) -> Result<Option<f64>, Error> {
        let field = field.ok_or(Error::MetricFieldRequired { strategy: "sum" })?;
        let gt_sum: f64 = ground_truth.iter().filter_map(|r| field_value(r, field)).sum();
        let opt_sum: f64 = optimistic.iter().filter_map(|r| field_value(r, field)).sum();
        Ok(Some(base.unwrap_or(0.0) + (opt_sum - gt_sum)))
    }
}

pub struct Min;

impl Strategy for Min {
    fn name(&self) -> &'static str {
        "min"
    }

    fn requires_field(&self) -> bool {
        true
    }

    fn compute(
        &self,
        base: Option<f64>,
        _ground_truth: &[Value],
        optimistic: &[Value],
        field: Option<&str>,
    ) -> Result<Option<f64>, Error> {
        let field = field.ok_or(Error::MetricFieldRequired { strategy: "min" })?;
        let opt_min = optimistic
            .iter()
            .filter_map(|r| field_value(r, field))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
        // Deletion of the extreme cannot be optimistically resolved
        // without scanning history - when the optimistic slice still has
        // a smaller value than base, trust it; otherwise fall back to
        // base rather than risk surfacing a value too low.
        Ok(match (opt_min, base) {
            (None, b) => b,
            (Some(om), None) => Some(om),
            (Some(om), Some(b)) => Some(if om < b { om } else { b }),
        })
    }
}

pub struct Max;

impl Strategy for Max {
    fn name(&self) -> &'static str {
        "max"
    }

    fn requires_field(&self) -> bool {
        true
    }

    fn compute(
        &self,
        base: Option<f64>,
        _ground_truth: &[Value],
        optimistic: &[Value],
        field: Option<&str>,
    ) -> Result<Option<f64>, Error> {
        let field = field.ok_or(Error::MetricFieldRequired { strategy: "max" })?;
        let opt_max = optimistic
            .iter()
            .filter_map(|r| field_value(r, field))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        Ok(match (opt_max, base) {
            (None, b) => b,
            (Some(om), None) => Some(om),
            (Some(om), Some(b)) => Some(if om > b { om } else { b }),
        })
    }
}

/// The last-known ground-truth aggregate value for a Model Store.
pub struct Metric {
    pub value: Option<Value>,
    pub last_sync_error: Option<String>,
}

impl Metric {
    pub fn new(initial: Option<Value>) -> Self {
        Self { value: initial, last_sync_error: None }
    }
}

type MemoKey = (Option<String>, Version);

/// Combines a `Metric`, a `Strategy`, and a Model Store's render engine
/// into an optimistically-computed aggregate.
pub struct MetricEngine {
    store: Arc<ModelStore>,
    render_engine: Arc<RenderEngine>,
    strategy: Box<dyn Strategy>,
    metric: Mutex<Metric>,
    cache: Mutex<HashMap<MemoKey, Option<f64>>>,
    subscription: std::sync::Mutex<Option<crate::event::SubscriptionId>>,
}

impl MetricEngine {
    pub fn new(
        store: Arc<ModelStore>,
        render_engine: Arc<RenderEngine>,
        strategy: Box<dyn Strategy>,
        initial_value: Option<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            render_engine,
            strategy,
            metric: Mutex::new(Metric::new(initial_value)),
            cache: Mutex::new(HashMap::new()),
            subscription: std::sync::Mutex::new(None),
        })
    }

    /// Compute the optimistic aggregate for `field` (`None` for
    /// field-less strategies such as a bare `count`). Memoized by
    /// (field, store version); cleared whenever the metric's base value
    /// changes.
    pub async fn render(&self, field: Option<&str>) -> Result<Option<f64>, Error> {
        if self.strategy.requires_field() && field.is_none() {
            return Err(Error::MetricFieldRequired { strategy: self.strategy.name() });
        }
        let version = self.store.current_version().await;
        let key = (field.map(|s| s.to_string()), version);

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                return Ok(*cached);
            }
        }

        let base = self.metric.lock().await.value.as_ref().and_then(numeric_value);
        let ground_truth = self.store.ground_truth().await;
        let optimistic = self.render_engine.render(RenderParams::new()).await;
        let result = self.strategy.compute(base, &ground_truth, &optimistic, field)?;

        self.cache.lock().await.insert(key, result);
        Ok(result)
    }

    /// Subscribe to the store's `SyncStarted` event and fire `fetcher`
    /// concurrently with each store sync.
    pub async fn attach_fetcher(self: &Arc<Self>, fetcher: Arc<dyn MetricFetcher>) {
        let engine = Arc::clone(self);
        let mut kinds = std::collections::HashSet::new();
        kinds.insert(EventKind::SyncStarted);
        let id = self
            .store
            .subscribe(
                Some(kinds),
                Box::new(move |_event| {
                    let engine = Arc::clone(&engine);
                    let fetcher = Arc::clone(&fetcher);
                    tokio::spawn(async move {
                        match fetcher.fetch_metric_value().await {
                            Ok(value) => {
                                engine.metric.lock().await.value = value;
                                engine.cache.lock().await.clear();
                            }
                            Err(e) => {
                                engine.metric.lock().await.last_sync_error = Some(e.to_string());
                            }
                        }
                    });
                }),
            )
            .await;
        *self.subscription.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    pub async fn last_sync_error(&self) -> Option<String> {
        self.metric.lock().await.last_sync_error.clone()
    }

    /// Unsubscribe and drop the memoization table.
    pub async fn destroy(&self) {
        if let Some(id) = self.subscription.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.store.unsubscribe(id).await;
        }
        self.cache.lock().await.clear();
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_records() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(-1000i64..1000, 0..10).prop_map(|values| {
            values.into_iter().enumerate().map(|(id, v)| json!({"id": id, "salary": v})).collect()
        })
    }

    fn arb_base() -> impl Strategy<Value = Option<f64>> {
        prop::option::of((-1000i64..1000).prop_map(|v| v as f64))
    }

    proptest! {
        // Invariant 7: a numeric-field Min never exceeds any of the base
        // value or the optimistic slice's own field values.
        #[test]
        fn prop_min_never_exceeds_any_observed_value(base in arb_base(), optimistic in arb_records()) {
            let result = Min.compute(base, &[], &optimistic, Some("salary")).unwrap();
            if let Some(min) = result {
                if let Some(b) = base {
                    prop_assert!(min <= b);
                }
                for record in &optimistic {
                    let value = record["salary"].as_i64().unwrap() as f64;
                    prop_assert!(min <= value);
                }
            }
        }

        // Invariant 7: a numeric-field Max never falls below the base
        // value or any of the optimistic slice's own field values.
        #[test]
        fn prop_max_never_falls_below_any_observed_value(base in arb_base(), optimistic in arb_records()) {
            let result = Max.compute(base, &[], &optimistic, Some("salary")).unwrap();
            if let Some(max) = result {
                if let Some(b) = base {
                    prop_assert!(max >= b);
                }
                for record in &optimistic {
                    let value = record["salary"].as_i64().unwrap() as f64;
                    prop_assert!(max >= value);
                }
            }
        }
    }
}
