//! Layered configuration (SPEC_FULL.md 10.1): an optional YAML file source,
//! overridden by `CATALYST_`-prefixed environment variables, with
//! accumulate-all-errors startup validation.

use std::collections::HashMap;
use std::path::Path;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub redirect: RedirectConfig,
    pub cdn: CdnConfig,
    pub timeouts: TimeoutConfig,
    pub cluster: ClusterBusConfig,
    pub logging: LoggingConfig,
    pub media_server: MediaServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Advertise host. Falls back to `POD_IP`, then the system hostname,
    /// exactly as the rest of this workspace resolves its advertise host.
    pub host: String,
    pub lat: f64,
    pub lon: f64,
    pub region: String,
    /// Adjusts `region` used for pull arbitration without changing the
    /// node's advertised tag — a deployment escape hatch for shared-region
    /// fleets that want finer pull-routing granularity.
    pub region_tag_adjust: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            lat: 0.0,
            lon: 0.0,
            region: String::new(),
            region_tag_adjust: None,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn resolved_host(&self) -> String {
        if !self.host.is_empty() {
            return self.host.clone();
        }
        if let Ok(pod_ip) = std::env::var("POD_IP") {
            if !pod_ip.is_empty() {
                return pod_ip;
            }
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    #[must_use]
    pub fn effective_region(&self) -> &str {
        self.region_tag_adjust.as_deref().unwrap_or(&self.region)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub prefixes: Vec<String>,
    pub fallback_prefix: String,
    pub mist_base_stream_name: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!["video".to_string()],
            fallback_prefix: "video".to_string(),
            mist_base_stream_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    pub redirect_prefix_host: String,
    pub redirect_prefix_path: String,
    pub subdomain: bool,
    pub playback_pct: HashMap<String, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub metric_timeout_secs: u64,
    pub ingest_stream_timeout_secs: u64,
    pub update_node_stats_every_secs: u64,
    pub update_streams_every_secs: u64,
    pub stream_source_retries: u32,
    pub stream_source_retry_interval_secs: u64,
    pub stream_source_max_wrong_region_retries: u32,
    pub directory_lookup_rate_limit_secs: u64,
    pub pull_lease_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metric_timeout_secs: 16,
            ingest_stream_timeout_secs: 16,
            update_node_stats_every_secs: 5,
            update_streams_every_secs: 5,
            stream_source_retries: 20,
            stream_source_retry_interval_secs: 1,
            stream_source_max_wrong_region_retries: 3,
            directory_lookup_rate_limit_secs: 5,
            pull_lease_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterBusConfig {
    /// Empty means local-only mode (in-memory bus, single node).
    pub redis_url: String,
    pub heartbeat_ttl_secs: u64,
}

/// Where the local media server's HTTP control surface (SPEC_FULL.md 6)
/// lives, for the streams-collector telemetry loop. Not the cluster's own
/// HTTP listener — that's `ServerConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaServerConfig {
    pub base_url: String,
    pub streams_path: String,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4242".to_string(),
            streams_path: "/streams".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars (highest) > config file >
    /// defaults (lowest), matching this workspace's existing convention.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CATALYST")
                .separator("_")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Accumulate-all-errors startup validation, fail fast before any task
    /// is spawned.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be between 1 and 65535, got 0".to_string());
        }
        if self.node.name.is_empty() {
            errors.push("node.name must not be empty".to_string());
        }
        if !(-90.0..=90.0).contains(&self.node.lat) {
            errors.push(format!("node.lat must be in [-90, 90], got {}", self.node.lat));
        }
        if !(-180.0..=180.0).contains(&self.node.lon) {
            errors.push(format!("node.lon must be in [-180, 180], got {}", self.node.lon));
        }
        if self.redirect.prefixes.is_empty() {
            errors.push("redirect.prefixes must not be empty".to_string());
        }
        for (playback_id, pct) in &self.cdn.playback_pct {
            if *pct > 100 {
                errors.push(format!(
                    "cdn.playback_pct[{playback_id}] must be in [0, 100], got {pct}"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
