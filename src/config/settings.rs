use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;

/// Top-level configuration for the bastion gate.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_storage_config")]
    pub storage: StorageConfig,

    #[serde(default = "defaults::default_geoip_config")]
    pub geoip: GeoipConfig,

    #[serde(default = "defaults::default_alerting_config")]
    pub alerting: AlertingConfig,

    #[serde(default = "defaults::default_retention_config")]
    pub retention: RetentionConfig,

    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_bandwidth_config")]
    pub bandwidth: BandwidthConfig,

    #[serde(default = "defaults::default_tcp_config")]
    pub tcp: ProtocolConfig,

    #[serde(default = "defaults::default_ssh_config")]
    pub ssh: ProtocolConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: defaults::default_logging_config(),
            storage: defaults::default_storage_config(),
            geoip: defaults::default_geoip_config(),
            alerting: defaults::default_alerting_config(),
            retention: defaults::default_retention_config(),
            server: defaults::default_server_config(),
            bandwidth: defaults::default_bandwidth_config(),
            tcp: defaults::default_tcp_config(),
            ssh: defaults::default_ssh_config(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,

    #[serde(default)]
    pub json: bool,
}

/// Persistent storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,
}

/// GeoIP database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoipConfig {
    #[serde(default = "defaults::default_city_db")]
    pub city_db: String,

    #[serde(default = "defaults::default_asn_db")]
    pub asn_db: String,

    #[serde(default = "defaults::default_geo_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// ISP strings a lookup source uses for addresses it cannot place.
    #[serde(default = "defaults::default_unresolved_isp_markers")]
    pub unresolved_isp_markers: Vec<String>,
}

/// Webhook alerting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Suppress informational events (service start, SSH allow).
    #[serde(default)]
    pub quiet: bool,
}

/// Connection-record retention sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "defaults::default_retention_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "defaults::default_connection_record_days")]
    pub connection_record_days: u32,
}

/// Connection handling timeouts shared by every forward server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "defaults::default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "defaults::default_proxy_header_timeout_ms")]
    pub proxy_header_timeout_ms: u64,
}

/// Interface bandwidth sampling and backpressure limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BandwidthConfig {
    /// Empty disables sampling entirely.
    #[serde(default)]
    pub interface_name: String,

    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    pub sent_limit: u64,

    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    pub recv_limit: u64,

    #[serde(default = "defaults::default_data_collection_cycle_secs")]
    pub data_collection_cycle_secs: u64,

    #[serde(default = "defaults::default_statistical_period_secs")]
    pub statistical_period_secs: u64,

    #[serde(default = "defaults::default_statistical_time_span_secs")]
    pub statistical_time_span_secs: u64,

    #[serde(default = "defaults::default_stop_accept_time_limit_secs")]
    pub stop_accept_time_limit_secs: u64,
}

/// Access policy and forwards for one protocol (`[tcp]` or `[ssh]`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub default_banned: bool,

    #[serde(default)]
    pub always_allow_intranet: bool,

    #[serde(default = "defaults::default_true")]
    pub always_allow_loopback: bool,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Brute-force thresholds. Only consulted for SSH.
    #[serde(default)]
    pub count_rules: Vec<CountRuleConfig>,

    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
}

/// One access rule as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "defaults::default_rule_kind")]
    pub kind: String,

    #[serde(default)]
    pub nation: String,
    #[serde(default)]
    pub nation_vague: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub province_vague: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub city_vague: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub isp_vague: String,

    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub ipv4_cidr: String,
    #[serde(default)]
    pub ipv6_cidr: String,

    #[serde(default = "defaults::default_true")]
    pub banned: bool,
}

/// One brute-force threshold as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct CountRuleConfig {
    pub try_count: i64,
    pub memory_seconds: i64,
    #[serde(default)]
    pub banned_seconds: i64,
}

/// One port forward as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    pub listen_port: u32,

    #[serde(default)]
    pub dest: String,

    #[serde(default)]
    pub ipv4_dest: String,

    #[serde(default)]
    pub ipv6_dest: String,

    #[serde(default = "defaults::default_true")]
    pub allow_cross: bool,

    #[serde(default = "defaults::default_ipv4_bind")]
    pub ipv4_bind: String,

    #[serde(default = "defaults::default_ipv6_bind")]
    pub ipv6_bind: String,

    #[serde(default)]
    pub ipv4_src_proxy: bool,

    #[serde(default)]
    pub ipv6_src_proxy: bool,

    #[serde(default)]
    pub ipv4_dest_proxy: bool,

    #[serde(default)]
    pub ipv6_dest_proxy: bool,

    #[serde(default = "defaults::default_dest_proxy_version")]
    pub dest_proxy_version: i32,

    /// SSH only: overrides `[ssh].count_rules` for this forward.
    #[serde(default)]
    pub count_rules: Vec<CountRuleConfig>,
}
