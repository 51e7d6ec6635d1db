//! Store configuration.
//!
//! Loading configuration from files/env/CLI flags is out of scope; this
//! is a plain builder over the options table.

use crate::record::RecordFactory;

/// Configuration for a Model Store.
#[derive(Clone)]
pub struct ModelStoreConfig {
    pub primary_key: String,
    pub record_factory: Option<RecordFactory>,
    /// Milliseconds between periodic syncs; `0` disables periodic sync.
    pub sync_interval_ms: u64,
    /// Non-inflight operations older than this (ms) are trimmed at sync.
    pub max_operation_age_ms: i64,
    pub enable_cache: bool,
    pub cache_db_name: String,
    pub cache_store_name: String,
    /// If set, a successful cache load schedules a follow-up `sync()`
    /// after `cache_sync_delay_ms` rather than leaving the store on
    /// stale cached data until something else triggers a sync.
    pub cache_auto_sync: bool,
    pub cache_sync_delay_ms: u64,
}

impl ModelStoreConfig {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            record_factory: None,
            sync_interval_ms: 0,
            max_operation_age_ms: 5 * 60 * 1000,
            enable_cache: false,
            cache_db_name: "ripple".to_string(),
            cache_store_name: "default".to_string(),
            cache_auto_sync: false,
            cache_sync_delay_ms: 0,
        }
    }

    pub fn with_record_factory(mut self, factory: RecordFactory) -> Self {
        self.record_factory = Some(factory);
        self
    }

    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.sync_interval_ms = ms;
        self
    }

    pub fn with_max_operation_age_ms(mut self, ms: i64) -> Self {
        self.max_operation_age_ms = ms;
        self
    }

    pub fn with_cache(mut self, db_name: impl Into<String>, store_name: impl Into<String>) -> Self {
        self.enable_cache = true;
        self.cache_db_name = db_name.into();
        self.cache_store_name = store_name.into();
        self
    }

    pub fn with_cache_auto_sync(mut self, delay_ms: u64) -> Self {
        self.cache_auto_sync = true;
        self.cache_sync_delay_ms = delay_ms;
        self
    }

    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.cache_db_name, self.cache_store_name)
    }
}

/// Configuration for a Queryset Store. Shares the sync/cache knobs of a
/// Model Store but has no primary key or record factory, since it
/// replicates an identifier sequence rather than records.
#[derive(Clone)]
pub struct QuerySetStoreConfig {
    pub sync_interval_ms: u64,
    pub max_operation_age_ms: i64,
    pub enable_cache: bool,
    pub cache_db_name: String,
    pub cache_store_name: String,
    pub cache_auto_sync: bool,
    pub cache_sync_delay_ms: u64,
}

impl QuerySetStoreConfig {
    pub fn new() -> Self {
        Self {
            sync_interval_ms: 0,
            max_operation_age_ms: 5 * 60 * 1000,
            enable_cache: false,
            cache_db_name: "ripple".to_string(),
            cache_store_name: "default".to_string(),
            cache_auto_sync: false,
            cache_sync_delay_ms: 0,
        }
    }

    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.sync_interval_ms = ms;
        self
    }

    pub fn with_max_operation_age_ms(mut self, ms: i64) -> Self {
        self.max_operation_age_ms = ms;
        self
    }

    pub fn with_cache(mut self, db_name: impl Into<String>, store_name: impl Into<String>) -> Self {
        self.enable_cache = true;
        self.cache_db_name = db_name.into();
        self.cache_store_name = store_name.into();
        self
    }

    pub fn with_cache_auto_sync(mut self, delay_ms: u64) -> Self {
        self.cache_auto_sync = true;
        self.cache_sync_delay_ms = delay_ms;
        self
    }

    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.cache_db_name, self.cache_store_name)
    }
}

impl Default for QuerySetStoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_cache_and_periodic_sync() {
        let cfg = ModelStoreConfig::new("id");
        assert!(!cfg.enable_cache);
        assert_eq!(cfg.sync_interval_ms, 0);
    }

    #[test]
    fn cache_key_combines_db_and_store_name() {
        let cfg = ModelStoreConfig::new("id").with_cache("app", "users");
        assert_eq!(cfg.cache_key(), "app/users");
    }
}
