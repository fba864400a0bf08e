use dashmap::DashMap;
use serde_json::{Map, Value};

use std::sync::Arc;

/// A named reading sampled on demand
pub type Gauge = Arc<dyn Fn() -> Value + Send + Sync>;

/// Registry of health gauges
///
/// Gauges are closures over live state, so a snapshot always reflects the
/// moment it was taken.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    gauges: Arc<DashMap<String, Gauge>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    /// Registers a gauge, replacing any gauge with the same name
    pub fn register<F>(&self, name: &str, gauge: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.gauges.insert(name.to_string(), Arc::new(gauge));
    }

    /// Samples one gauge
    pub fn read(&self, name: &str) -> Option<Value> {
        let gauge = self.gauges.get(name).map(|entry| entry.value().clone())?;
        Some(gauge())
    }

    /// Samples every gauge into a JSON object
    pub fn snapshot(&self) -> Value {
        // Clone out first so gauges never run while a shard lock is held
        let mut gauges: Vec<(String, Gauge)> = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));

        let readings: Map<String, Value> = gauges
            .into_iter()
            .map(|(name, gauge)| (name, gauge()))
            .collect();
        Value::Object(readings)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gauges.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
