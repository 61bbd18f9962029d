use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::bucket::Resolution;
use crate::models::MetricPolicy;
use crate::resources::ResourceDescriptor;
use crate::tasks::EngineSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    /// Statically declared resources, registered in the index at startup.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_pool_size: u32,
    /// Raw samples and aggregate records expire after this many days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    56
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_collection_expiration_mins")]
    pub expiration_mins: u64,
    /// Used only for resources that declare support for it.
    #[serde(default)]
    pub adapter_override: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_collection_interval_secs(),
            page_size: default_page_size(),
            expiration_mins: default_collection_expiration_mins(),
            adapter_override: None,
        }
    }
}

fn default_collection_interval_secs() -> u64 {
    60
}

fn default_page_size() -> usize {
    50
}

fn default_collection_expiration_mins() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_aggregation_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<Resolution>,
    #[serde(default = "default_raw_result_limit")]
    pub raw_result_limit: u32,
    #[serde(default = "default_resource_query_page_size")]
    pub resource_query_page_size: usize,
    #[serde(default = "default_aggregation_expiration_mins")]
    pub expiration_mins: u64,
    #[serde(default)]
    pub metrics: Vec<MetricPolicy>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_aggregation_interval_secs(),
            resolutions: default_resolutions(),
            raw_result_limit: default_raw_result_limit(),
            resource_query_page_size: default_resource_query_page_size(),
            expiration_mins: default_aggregation_expiration_mins(),
            metrics: Vec::new(),
        }
    }
}

fn default_aggregation_interval_secs() -> u64 {
    300
}

fn default_resolutions() -> Vec<Resolution> {
    vec![Resolution::Hourly]
}

fn default_raw_result_limit() -> u32 {
    10_000
}

fn default_resource_query_page_size() -> usize {
    25
}

fn default_aggregation_expiration_mins() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bins kept per in-memory time series.
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            series_capacity: default_series_capacity(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_series_capacity() -> usize {
    48
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Optional cron expression for VACUUM (e.g. "0 0 3 * * *" = 03:00 daily). Uses local time.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
    /// Run VACUUM every N seconds when vacuum_schedule is not set.
    #[serde(default = "default_vacuum_interval_secs")]
    pub vacuum_interval_secs: u64,
    #[serde(default = "default_orchestration_expiration_hours")]
    pub orchestration_expiration_hours: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: default_prune_interval_secs(),
            vacuum_schedule: None,
            vacuum_interval_secs: default_vacuum_interval_secs(),
            orchestration_expiration_hours: default_orchestration_expiration_hours(),
        }
    }
}

fn default_prune_interval_secs() -> u64 {
    3600
}

fn default_vacuum_interval_secs() -> u64 {
    86_400
}

fn default_orchestration_expiration_hours() -> u64 {
    12
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// How often to log app stats (jobs run, records pruned) at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

fn default_stats_log_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_interval_secs: default_discovery_interval_secs(),
        }
    }
}

fn default_discovery_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub id: String,
    #[serde(default)]
    pub stats_adapter: Option<String>,
    #[serde(default)]
    pub supported_adapters: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceConfig {
    pub fn descriptor(&self) -> ResourceDescriptor {
        let mut resource = ResourceDescriptor::new(self.id.clone(), self.stats_adapter.as_deref());
        resource
            .supported_adapters
            .extend(self.supported_adapters.iter().cloned());
        resource.labels = self.labels.clone();
        resource
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            page_size: self.collection.page_size,
            resource_query_page_size: self.aggregation.resource_query_page_size,
            publish_batch_size: self.publishing.batch_size,
            raw_result_limit: self.aggregation.raw_result_limit,
            collection_expiration: Duration::from_secs(self.collection.expiration_mins * 60),
            aggregation_expiration: Duration::from_secs(self.aggregation.expiration_mins * 60),
            orchestration_expiration: Duration::from_secs(
                self.maintenance.orchestration_expiration_hours * 3600,
            ),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.database.retention_days > 0,
            "database.retention_days must be > 0, got {}",
            self.database.retention_days
        );
        anyhow::ensure!(
            self.collection.interval_secs > 0,
            "collection.interval_secs must be > 0, got {}",
            self.collection.interval_secs
        );
        anyhow::ensure!(
            self.collection.page_size > 0,
            "collection.page_size must be > 0, got {}",
            self.collection.page_size
        );
        anyhow::ensure!(
            self.collection.expiration_mins > 0,
            "collection.expiration_mins must be > 0, got {}",
            self.collection.expiration_mins
        );
        anyhow::ensure!(
            self.aggregation.interval_secs > 0,
            "aggregation.interval_secs must be > 0, got {}",
            self.aggregation.interval_secs
        );
        anyhow::ensure!(
            !self.aggregation.resolutions.is_empty(),
            "aggregation.resolutions must be non-empty"
        );
        anyhow::ensure!(
            self.aggregation.raw_result_limit > 0,
            "aggregation.raw_result_limit must be > 0, got {}",
            self.aggregation.raw_result_limit
        );
        anyhow::ensure!(
            self.aggregation.resource_query_page_size > 0,
            "aggregation.resource_query_page_size must be > 0, got {}",
            self.aggregation.resource_query_page_size
        );
        anyhow::ensure!(
            self.aggregation.expiration_mins > 0,
            "aggregation.expiration_mins must be > 0, got {}",
            self.aggregation.expiration_mins
        );
        for metric in &self.aggregation.metrics {
            anyhow::ensure!(
                !metric.name.is_empty() && !metric.name.contains('/'),
                "aggregation.metrics name must be non-empty without '/', got {:?}",
                metric.name
            );
            anyhow::ensure!(
                !metric.aggregations.is_empty(),
                "aggregation.metrics.{}.aggregations must be non-empty",
                metric.name
            );
        }
        anyhow::ensure!(
            self.publishing.batch_size > 0,
            "publishing.batch_size must be > 0, got {}",
            self.publishing.batch_size
        );
        anyhow::ensure!(
            self.publishing.series_capacity > 0,
            "publishing.series_capacity must be > 0, got {}",
            self.publishing.series_capacity
        );
        anyhow::ensure!(
            self.maintenance.prune_interval_secs > 0,
            "maintenance.prune_interval_secs must be > 0, got {}",
            self.maintenance.prune_interval_secs
        );
        anyhow::ensure!(
            self.maintenance.vacuum_interval_secs > 0,
            "maintenance.vacuum_interval_secs must be > 0, got {}",
            self.maintenance.vacuum_interval_secs
        );
        anyhow::ensure!(
            self.maintenance.orchestration_expiration_hours > 0,
            "maintenance.orchestration_expiration_hours must be > 0, got {}",
            self.maintenance.orchestration_expiration_hours
        );
        if let Some(expr) = &self.maintenance.vacuum_schedule {
            <cron::Schedule as std::str::FromStr>::from_str(expr).map_err(|e| {
                anyhow::anyhow!("maintenance.vacuum_schedule is not a valid cron expression: {}", e)
            })?;
        }
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        anyhow::ensure!(
            !self.docker.enabled || self.docker.discovery_interval_secs > 0,
            "docker.discovery_interval_secs must be > 0, got {}",
            self.docker.discovery_interval_secs
        );
        for resource in &self.resources {
            anyhow::ensure!(!resource.id.is_empty(), "resources.id must be non-empty");
        }
        Ok(())
    }
}
