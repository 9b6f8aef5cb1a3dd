use super::settings::{
    AlertingConfig, BandwidthConfig, GeoipConfig, LoggingConfig, ProtocolConfig, RetentionConfig,
    ServerConfig, StorageConfig,
};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: default_log_file(),
        json: false,
    }
}

pub fn default_storage_config() -> StorageConfig {
    StorageConfig {
        sqlite_path: default_sqlite_path(),
    }
}

pub fn default_geoip_config() -> GeoipConfig {
    GeoipConfig {
        city_db: default_city_db(),
        asn_db: default_asn_db(),
        cache_ttl_secs: default_geo_cache_ttl_secs(),
        unresolved_isp_markers: default_unresolved_isp_markers(),
    }
}

pub fn default_alerting_config() -> AlertingConfig {
    AlertingConfig {
        enabled: false,
        webhook_url: None,
        quiet: false,
    }
}

pub fn default_retention_config() -> RetentionConfig {
    RetentionConfig {
        interval_secs: default_retention_interval_secs(),
        connection_record_days: default_connection_record_days(),
    }
}

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        connect_timeout_ms: default_connect_timeout_ms(),
        shutdown_grace_secs: default_shutdown_grace_secs(),
        proxy_header_timeout_ms: default_proxy_header_timeout_ms(),
    }
}

pub fn default_bandwidth_config() -> BandwidthConfig {
    BandwidthConfig {
        interface_name: String::new(),
        sent_limit: 0,
        recv_limit: 0,
        data_collection_cycle_secs: default_data_collection_cycle_secs(),
        statistical_period_secs: default_statistical_period_secs(),
        statistical_time_span_secs: default_statistical_time_span_secs(),
        stop_accept_time_limit_secs: default_stop_accept_time_limit_secs(),
    }
}

pub fn default_tcp_config() -> ProtocolConfig {
    ProtocolConfig {
        default_banned: false,
        always_allow_intranet: true,
        always_allow_loopback: true,
        rules: Vec::new(),
        count_rules: Vec::new(),
        forward: Vec::new(),
    }
}

pub fn default_ssh_config() -> ProtocolConfig {
    ProtocolConfig {
        default_banned: false,
        always_allow_intranet: false,
        always_allow_loopback: true,
        rules: Vec::new(),
        count_rules: Vec::new(),
        forward: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Logging / storage field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_file() -> String {
    "/var/log/bastion-gate/bastion-gate.log".to_string()
}

pub fn default_sqlite_path() -> String {
    "/var/lib/bastion-gate/bastion-gate.db".to_string()
}

// ---------------------------------------------------------------------------
// GeoIP field defaults
// ---------------------------------------------------------------------------

pub fn default_city_db() -> String {
    "/var/lib/bastion-gate/geoip/GeoLite2-City.mmdb".to_string()
}

pub fn default_asn_db() -> String {
    "/var/lib/bastion-gate/geoip/GeoLite2-ASN.mmdb".to_string()
}

pub fn default_geo_cache_ttl_secs() -> u64 {
    3600
}

pub fn default_unresolved_isp_markers() -> Vec<String> {
    ["Private Network", "Loopback", "专用网络", "本地环回", "本地回环"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Retention field defaults
// ---------------------------------------------------------------------------

pub fn default_retention_interval_secs() -> u64 {
    6 * 3600
}

pub fn default_connection_record_days() -> u32 {
    90
}

// ---------------------------------------------------------------------------
// Server field defaults
// ---------------------------------------------------------------------------

pub fn default_connect_timeout_ms() -> u64 {
    5000
}

pub fn default_shutdown_grace_secs() -> u64 {
    10
}

pub fn default_proxy_header_timeout_ms() -> u64 {
    3000
}

// ---------------------------------------------------------------------------
// Bandwidth field defaults
// ---------------------------------------------------------------------------

pub fn default_data_collection_cycle_secs() -> u64 {
    5
}

pub fn default_statistical_period_secs() -> u64 {
    10
}

pub fn default_statistical_time_span_secs() -> u64 {
    1800
}

pub fn default_stop_accept_time_limit_secs() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Rule / forward field defaults
// ---------------------------------------------------------------------------

pub fn default_true() -> bool {
    true
}

pub fn default_rule_kind() -> String {
    "ip".to_string()
}

pub fn default_ipv4_bind() -> String {
    "0.0.0.0".to_string()
}

pub fn default_ipv6_bind() -> String {
    "::".to_string()
}

pub fn default_dest_proxy_version() -> i32 {
    1
}
