//! Pipeline configuration. The full settings object is passed base64-encoded in the
//! `WEIR_PIPELINE_SPEC` environment variable as JSON; every recognized option has a
//! default so a partial (or absent) spec yields a runnable local pipeline.

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::error::{Error, Result};

const ENV_PIPELINE_SPEC: &str = "WEIR_PIPELINE_SPEC";

pub fn config() -> &'static Settings {
    static CONF: OnceLock<Settings> = OnceLock::new();
    CONF.get_or_init(|| match Settings::load() {
        Ok(v) => v,
        Err(e) => {
            panic!("Failed to load configuration: {e:?}");
        }
    })
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub group_id: GroupId,
    pub partitions: Partitions,
    pub source: SourceConfig,
    pub window: WindowConfig,
    pub fetch: FetchConfig,
    pub backpressure: BackpressureConfig,
    pub commit: CommitConfig,
    pub raw_sink: RawSinkConfig,
    pub coordinator: CoordinatorConfig,
    pub object_store_root: ObjectStoreRoot,
    pub metrics_listen_port: MetricsPort,
}

// Newtype wrappers so the top-level defaults stay next to their fields.

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GroupId(pub String);

impl Default for GroupId {
    fn default() -> Self {
        GroupId("weir".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Partitions(pub Vec<u16>);

impl Default for Partitions {
    fn default() -> Self {
        Partitions(vec![0, 1, 2, 3])
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ObjectStoreRoot(pub PathBuf);

impl Default for ObjectStoreRoot {
    fn default() -> Self {
        ObjectStoreRoot(PathBuf::from("/tmp/weir/objects"))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MetricsPort(pub u16);

impl Default for MetricsPort {
    fn default() -> Self {
        MetricsPort(2469)
    }
}

/// Which built-in partition log backs the pipeline when it runs standalone.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Generator(GeneratorConfig),
    Memory,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Generator(GeneratorConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Upper bound on synthesized events per fetch call.
    pub events_per_fetch: usize,
    /// Distinct user ids to draw from.
    pub users: i64,
    /// Actions to draw from; also the aggregation keys.
    pub actions: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            events_per_fetch: 100,
            users: 1000,
            actions: vec![
                "view".to_string(),
                "click".to_string(),
                "purchase".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Fixed,
    Sliding,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub window_size_ms: u64,
    /// Slide between window starts; required for (and only meaningful with) sliding
    /// windows.
    pub slide_ms: Option<u64>,
    pub allowed_lateness_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            kind: WindowKind::Fixed,
            window_size_ms: 60_000,
            slide_ms: None,
            allowed_lateness_ms: 2_000,
            grace_period_ms: 5_000,
        }
    }
}

impl WindowConfig {
    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    pub fn slide(&self) -> Option<Duration> {
        self.slide_ms.map(Duration::from_millis)
    }

    pub fn allowed_lateness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.allowed_lateness_ms as i64)
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.grace_period_ms as i64)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub max_batch_size: usize,
    /// Floor the backpressure controller may never shrink the batch below.
    pub min_batch_size: usize,
    /// How long a worker sleeps when a fetch returns nothing.
    pub idle_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_batch_size: 500,
            min_batch_size: 50,
            idle_delay_ms: 100,
        }
    }
}

impl FetchConfig {
    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// p99 write latency above this marks the sinks degraded.
    pub latency_threshold_ms: u64,
    /// How many recent latency samples feed the percentile.
    pub sample_capacity: usize,
    /// Consecutive healthy intervals required before the batch size ramps back up.
    pub recovery_intervals: u32,
    /// Additive increase applied per healthy interval once recovered.
    pub increase_step: usize,
    /// Inter-fetch delay while degraded.
    pub degraded_fetch_delay_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            latency_threshold_ms: 500,
            sample_capacity: 256,
            recovery_intervals: 5,
            increase_step: 25,
            degraded_fetch_delay_ms: 50,
        }
    }
}

impl BackpressureConfig {
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    pub fn degraded_fetch_delay(&self) -> Duration {
        Duration::from_millis(self.degraded_fetch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommitConfig {
    pub retry_max_attempts: u16,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig {
            retry_max_attempts: 5,
            retry_base_ms: 50,
            retry_max_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawSinkConfig {
    /// Raw batch objects are split so no single object exceeds this.
    pub max_object_bytes: usize,
}

impl Default for RawSinkConfig {
    fn default() -> Self {
        RawSinkConfig {
            max_object_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub heartbeat_interval_ms: u64,
    /// A worker missing heartbeats for this long is declared dead; this is the sole
    /// liveness signal.
    pub heartbeat_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Settings {
    fn load() -> Result<Self> {
        match env::var(ENV_PIPELINE_SPEC) {
            Ok(encoded) => Self::from_encoded(&encoded),
            Err(_) => {
                let settings = Settings::default();
                settings.validate()?;
                Ok(settings)
            }
        }
    }

    /// Decodes a base64-encoded JSON settings object.
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("decoding {ENV_PIPELINE_SPEC}: {e}")))?;
        let settings: Settings = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("parsing {ENV_PIPELINE_SPEC}: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    #[cfg(test)]
    pub(crate) fn from_json(json: &str) -> Result<Self> {
        let settings: Settings =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("parsing spec: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions.0.is_empty() {
            return Err(Error::Config("at least one partition is required".into()));
        }
        if self.fetch.min_batch_size == 0 || self.fetch.min_batch_size > self.fetch.max_batch_size {
            return Err(Error::Config(format!(
                "min_batch_size must be in [1, max_batch_size]; got min={} max={}",
                self.fetch.min_batch_size, self.fetch.max_batch_size
            )));
        }
        if self.window.window_size_ms == 0 {
            return Err(Error::Config("window_size_ms must be non-zero".into()));
        }
        match self.window.kind {
            WindowKind::Sliding => match self.window.slide_ms {
                None | Some(0) => {
                    return Err(Error::Config(
                        "sliding windows require a non-zero slide_ms".into(),
                    ));
                }
                Some(_) => {}
            },
            WindowKind::Fixed => {}
        }
        if let SourceConfig::Generator(generator) = &self.source
            && (generator.actions.is_empty() || generator.events_per_fetch == 0)
        {
            return Err(Error::Config(
                "generator source requires actions and a non-zero events_per_fetch".into(),
            ));
        }
        Ok(())
    }
}
