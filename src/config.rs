//! 伺服器設定（建構器或環境變數）與日誌初始化。

use std::{env, path::PathBuf, thread, time::Duration};

use log::LevelFilter;
use thiserror::Error;

use crate::{ca::RetryPolicy, challenge::ChallengeType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 宿主行程使用的前端參數。本函式庫只描述它們，不會自行開啟任何 socket。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSettings {
    pub tls_enabled: bool,
    pub tls_port: u16,
    pub http_port: u16,
    pub tls_key_file: PathBuf,
    pub tls_cert_file: PathBuf,
    pub workers: usize,
    pub request_timeout: Duration,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            tls_enabled: false,
            tls_port: 8443,
            http_port: 8080,
            tls_key_file: PathBuf::from("/etc/serles/tls/server.key"),
            tls_cert_file: PathBuf::from("/etc/serles/tls/server.crt"),
            workers: 2.min(cpus + 1),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ProcessSettings {
    pub fn bind_address(&self) -> String {
        let port = if self.tls_enabled {
            self.tls_port
        } else {
            self.http_port
        };
        format!("0.0.0.0:{}", port)
    }

    pub fn protocol(&self) -> &'static str {
        if self.tls_enabled {
            "HTTPS"
        } else {
            "HTTP"
        }
    }
}

/// EJBCA Web Service 連線設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjbcaSettings {
    pub url: String,
    pub ca_name: String,
    pub certificate_profile: String,
    pub end_entity_profile: String,
    /// end entity 使用者名稱前綴，後接訂單 id。
    pub username_prefix: String,
    pub client_p12: Option<PathBuf>,
    pub client_p12_password: Option<String>,
}

impl EjbcaSettings {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ca_name: "ManagementCA".to_string(),
            certificate_profile: "SERVER".to_string(),
            end_entity_profile: "EMPTY".to_string(),
            username_prefix: "acme-".to_string(),
            client_p12: None,
            client_p12_password: None,
        }
    }
}

/// ACME 伺服器核心的完整設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// 對外的基底 URL，例如 `https://acme.example.com`。
    pub base_url: String,
    pub nonce_ttl: Duration,
    pub challenge_types: Vec<ChallengeType>,
    pub order_lifetime: Duration,
    pub authorization_lifetime: Duration,
    pub backend_timeout: Duration,
    pub retry: RetryPolicy,
    pub orders_per_hour: u32,
    /// `memory` 或 `file:<path>`。
    pub storage: String,
    pub http01_port: u16,
    pub validation_timeout: Duration,
    pub doh_url: String,
    pub maintenance_interval: Duration,
    /// processing 訂單在無進行中呼叫且超過此時間後才會被對帳。
    pub reconcile_grace: Duration,
    pub log_level: String,
    pub terms_of_service: Option<String>,
    pub process: ProcessSettings,
    /// 未設定時使用行程內的本機 CA。
    pub ejbca: Option<EjbcaSettings>,
}

impl ServerConfig {
    pub fn builder(base_url: &str) -> ServerConfigBuilder {
        ServerConfigBuilder::new(base_url)
    }

    /// 從環境變數讀取設定。
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 以任意查詢函式讀取設定，未設定的鍵使用預設值。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("ACME_BASE_URL").unwrap_or_else(|| "http://localhost:8080".into());
        let mut builder = ServerConfigBuilder::new(&base_url);

        let mut process = ProcessSettings::default();
        if let Some(v) = lookup("TLS_ENABLED") {
            process.tls_enabled = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(v) = lookup("TLS_PORT") {
            process.tls_port = parse_number("TLS_PORT", &v)?;
        }
        if let Some(v) = lookup("HTTP_PORT") {
            process.http_port = parse_number("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("TLS_KEY_FILE") {
            process.tls_key_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("TLS_CERT_FILE") {
            process.tls_cert_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACME_WORKERS") {
            process.workers = parse_number("ACME_WORKERS", &v)?;
        }
        if let Some(v) = lookup("ACME_REQUEST_TIMEOUT_SECS") {
            process.request_timeout = parse_secs("ACME_REQUEST_TIMEOUT_SECS", &v)?;
        }
        builder = builder.process(process);

        if let Some(v) = lookup("LOG_LEVEL") {
            builder = builder.log_level(&v);
        }
        if let Some(v) = lookup("ACME_NONCE_TTL_SECS") {
            builder = builder.nonce_ttl(parse_secs("ACME_NONCE_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("ACME_CHALLENGE_TYPES") {
            let types = v
                .split(',')
                .filter(|t| !t.trim().is_empty())
                .map(|t| {
                    ChallengeType::parse(t).ok_or_else(|| ConfigError::InvalidValue {
                        key: "ACME_CHALLENGE_TYPES".into(),
                        value: t.to_string(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            builder = builder.challenge_types(types);
        }
        if let Some(v) = lookup("ACME_BACKEND_TIMEOUT_SECS") {
            builder = builder.backend_timeout(parse_secs("ACME_BACKEND_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("ACME_ORDERS_PER_HOUR") {
            builder = builder.orders_per_hour(parse_number("ACME_ORDERS_PER_HOUR", &v)?);
        }
        if let Some(v) = lookup("ACME_STORAGE") {
            builder = builder.storage(&v);
        }

        if let Some(url) = lookup("EJBCA_URL") {
            let mut ejbca = EjbcaSettings::new(&url);
            if let Some(v) = lookup("EJBCA_CA_NAME") {
                ejbca.ca_name = v;
            }
            if let Some(v) = lookup("EJBCA_CERT_PROFILE") {
                ejbca.certificate_profile = v;
            }
            if let Some(v) = lookup("EJBCA_ENTITY_PROFILE") {
                ejbca.end_entity_profile = v;
            }
            if let Some(v) = lookup("EJBCA_USERNAME_PREFIX") {
                ejbca.username_prefix = v;
            }
            ejbca.client_p12 = lookup("EJBCA_CLIENT_P12").map(PathBuf::from);
            ejbca.client_p12_password = lookup("EJBCA_CLIENT_P12_PASSWORD");
            builder = builder.ejbca(ejbca);
        }

        builder.build()
    }

    pub fn log_filter(&self) -> LevelFilter {
        parse_level(&self.log_level).unwrap_or(LevelFilter::Info)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_secs)
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        // 沿用前端伺服器的命名
        "critical" | "error" => Some(LevelFilter::Error),
        "warning" | "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// [`ServerConfig`] 的建構器，未設定的欄位使用預設值。
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new(base_url: &str) -> Self {
        Self {
            config: ServerConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                nonce_ttl: Duration::from_secs(3600),
                challenge_types: vec![ChallengeType::Http01, ChallengeType::Dns01],
                order_lifetime: Duration::from_secs(7 * 24 * 3600),
                authorization_lifetime: Duration::from_secs(7 * 24 * 3600),
                backend_timeout: Duration::from_secs(120),
                retry: RetryPolicy::default(),
                orders_per_hour: 300,
                storage: "memory".to_string(),
                http01_port: 80,
                validation_timeout: Duration::from_secs(10),
                doh_url: "https://dns.google/resolve".to_string(),
                maintenance_interval: Duration::from_secs(60),
                reconcile_grace: Duration::from_secs(30),
                log_level: "info".to_string(),
                terms_of_service: None,
                process: ProcessSettings::default(),
                ejbca: None,
            },
        }
    }

    pub fn nonce_ttl(mut self, ttl: Duration) -> Self {
        self.config.nonce_ttl = ttl;
        self
    }

    pub fn challenge_types(mut self, types: Vec<ChallengeType>) -> Self {
        self.config.challenge_types = types;
        self
    }

    pub fn order_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.order_lifetime = lifetime;
        self
    }

    pub fn authorization_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.authorization_lifetime = lifetime;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn orders_per_hour(mut self, limit: u32) -> Self {
        self.config.orders_per_hour = limit;
        self
    }

    pub fn storage(mut self, backend: &str) -> Self {
        self.config.storage = backend.to_string();
        self
    }

    pub fn http01_port(mut self, port: u16) -> Self {
        self.config.http01_port = port;
        self
    }

    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = timeout;
        self
    }

    pub fn doh_url(mut self, url: &str) -> Self {
        self.config.doh_url = url.to_string();
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    pub fn reconcile_grace(mut self, grace: Duration) -> Self {
        self.config.reconcile_grace = grace;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.log_level = level.to_string();
        self
    }

    pub fn terms_of_service(mut self, url: &str) -> Self {
        self.config.terms_of_service = Some(url.to_string());
        self
    }

    pub fn process(mut self, process: ProcessSettings) -> Self {
        self.config.process = process;
        self
    }

    pub fn ejbca(mut self, settings: EjbcaSettings) -> Self {
        self.config.ejbca = Some(settings);
        self
    }

    /// 檢查設定並產生 [`ServerConfig`]。
    pub fn build(self) -> Result<ServerConfig> {
        let config = self.config;
        let invalid = |key: &str, value: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        if !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://")) {
            return Err(invalid("ACME_BASE_URL", &config.base_url));
        }
        if config.challenge_types.is_empty() {
            return Err(ConfigError::Missing("ACME_CHALLENGE_TYPES"));
        }
        if config.nonce_ttl.is_zero() {
            return Err(invalid("ACME_NONCE_TTL_SECS", "0"));
        }
        if config.backend_timeout.is_zero() {
            return Err(invalid("ACME_BACKEND_TIMEOUT_SECS", "0"));
        }
        if config.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "0"));
        }
        if config.storage != "memory" && !config.storage.starts_with("file:") {
            return Err(invalid("ACME_STORAGE", &config.storage));
        }
        if parse_level(&config.log_level).is_none() {
            return Err(invalid("LOG_LEVEL", &config.log_level));
        }
        if let Some(ejbca) = &config.ejbca {
            if ejbca.url.is_empty() {
                return Err(ConfigError::Missing("EJBCA_URL"));
            }
        }
        Ok(config)
    }
}

/// 安裝 `env_logger`；重複呼叫不會出錯，回傳是否由本次呼叫完成安裝。
pub fn init_logging(level: &str) -> bool {
    let filter = parse_level(level).unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(filter)
        .parse_env("RUST_LOG")
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.nonce_ttl, Duration::from_secs(3600));
        assert_eq!(config.backend_timeout, Duration::from_secs(120));
        assert_eq!(config.orders_per_hour, 300);
        assert_eq!(
            config.challenge_types,
            vec![ChallengeType::Http01, ChallengeType::Dns01]
        );
        assert_eq!(config.process.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.process.protocol(), "HTTP");
        assert!(config.process.workers <= 2);
        assert!(config.ejbca.is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("ACME_BASE_URL", "https://acme.example.com/"),
            ("TLS_ENABLED", "yes"),
            ("TLS_PORT", "9443"),
            ("ACME_CHALLENGE_TYPES", "dns-01"),
            ("ACME_NONCE_TTL_SECS", "60"),
            ("LOG_LEVEL", "warning"),
            ("EJBCA_URL", "https://ejbca.internal:8443"),
            ("EJBCA_CA_NAME", "IssuingCA"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "https://acme.example.com");
        assert_eq!(config.process.bind_address(), "0.0.0.0:9443");
        assert_eq!(config.process.protocol(), "HTTPS");
        assert_eq!(config.challenge_types, vec![ChallengeType::Dns01]);
        assert_eq!(config.nonce_ttl, Duration::from_secs(60));
        assert_eq!(config.log_filter(), LevelFilter::Warn);
        let ejbca = config.ejbca.unwrap();
        assert_eq!(ejbca.ca_name, "IssuingCA");
        assert_eq!(ejbca.username_prefix, "acme-");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ServerConfig::from_lookup(lookup_from(&[("HTTP_PORT", "eighty")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(ServerConfig::from_lookup(lookup_from(&[("ACME_CHALLENGE_TYPES", "tls-alpn-01")]))
            .is_err());
        assert!(ServerConfig::builder("https://acme.test")
            .storage("redis://x")
            .build()
            .is_err());
        assert!(ServerConfig::builder("ftp://acme.test").build().is_err());
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging("debug");
        assert!(!init_logging("info"));
    }
}
