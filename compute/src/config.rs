//! Runtime configuration: defaults, JSON files and `OCTOFLOW_COMPUTE_*` overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, Result};

/// Which device implementation a [`Manager`](crate::Manager) brings up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Vulkan if a GPU is reachable, otherwise the host device.
    #[default]
    Auto,
    Vulkan,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Stderr,
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    pub sink: LogSink,
    /// env_logger directives applied over `level`, e.g.
    /// `"warn,octoflow_compute::sequence=trace"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into(), sink: LogSink::Stderr, filters: None }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        parse_level(&self.level)
    }
}

fn parse_level(s: &str) -> Result<log::LevelFilter> {
    s.trim()
        .parse::<log::LevelFilter>()
        .map_err(|_| ComputeError::Config(format!("unknown log level {s:?}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub backend: BackendKind,
    /// Physical device index; `None` prefers a discrete GPU.
    pub device_index: Option<usize>,
    /// One queue per entry; a repeated family gets its next queue index.
    pub queue_families: Vec<u32>,
    /// Queue count for the host device when `queue_families` is empty.
    pub host_queues: usize,
    pub validation_layers: Vec<String>,
    pub device_extensions: Vec<String>,
    /// Register created resources so `Manager::destroy` can tear them down.
    pub manage_resources: bool,
    pub log: LogConfig,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            device_index: None,
            queue_families: Vec::new(),
            host_queues: 1,
            validation_layers: Vec::new(),
            device_extensions: Vec::new(),
            manage_resources: true,
            log: LogConfig::default(),
        }
    }
}

pub const ENV_BACKEND: &str = "OCTOFLOW_COMPUTE_BACKEND";
pub const ENV_DEVICE: &str = "OCTOFLOW_COMPUTE_DEVICE";
pub const ENV_QUEUES: &str = "OCTOFLOW_COMPUTE_QUEUES";
pub const ENV_LAYERS: &str = "OCTOFLOW_COMPUTE_LAYERS";
pub const ENV_LOG: &str = "OCTOFLOW_COMPUTE_LOG";

impl ComputeConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: ComputeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `OCTOFLOW_COMPUTE_*` values fetched through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_BACKEND) {
            self.backend = match v.trim().to_ascii_lowercase().as_str() {
                "auto" => BackendKind::Auto,
                "vulkan" => BackendKind::Vulkan,
                "host" | "cpu" => BackendKind::Host,
                other => {
                    return Err(ComputeError::Config(format!("{ENV_BACKEND}: unknown backend {other:?}")))
                }
            };
        }
        if let Some(v) = lookup(ENV_DEVICE) {
            let index = v
                .trim()
                .parse::<usize>()
                .map_err(|_| ComputeError::Config(format!("{ENV_DEVICE}: not an index: {v:?}")))?;
            self.device_index = Some(index);
        }
        if let Some(v) = lookup(ENV_QUEUES) {
            self.queue_families = split_list(&v)
                .map(|s| {
                    s.parse::<u32>().map_err(|_| {
                        ComputeError::Config(format!("{ENV_QUEUES}: not a family index: {s:?}"))
                    })
                })
                .collect::<Result<_>>()?;
        }
        if let Some(v) = lookup(ENV_LAYERS) {
            self.validation_layers = split_list(&v).map(str::to_string).collect();
        }
        if let Some(v) = lookup(ENV_LOG) {
            self.log.filters = Some(v);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.log.level_filter()?;
        if self.queue_families.is_empty() && self.host_queues == 0 {
            return Err(ComputeError::Config("host_queues must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of queues the host device should expose.
    pub fn host_queue_count(&self) -> usize {
        if self.queue_families.is_empty() {
            self.host_queues
        } else {
            self.queue_families.len()
        }
    }

    pub(crate) fn vulkan_options(&self) -> octoflow_vulkan::VulkanOptions {
        octoflow_vulkan::VulkanOptions {
            device_index: self.device_index,
            queue_families: self.queue_families.clone(),
            layers: self.validation_layers.clone(),
            extensions: self.device_extensions.clone(),
        }
    }
}

fn split_list(v: &str) -> impl Iterator<Item = &str> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty())
}
