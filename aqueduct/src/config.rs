//! Configuration types for the MySQL pool and the HTTP client transport.
//!
//! All structs deserialize from the JSON documents the deployment tooling
//! produces. String fields may contain `${VAR}` / `${VAR:-default}`
//! placeholders; [`substitute_env_json`] resolves them before
//! deserialization (OS environment first, then a caller-supplied map, then
//! the inline default, otherwise the placeholder is left intact).

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use aqueduct_io::{codes, Error, Result};

fn config_error(what: impl Into<String>) -> Error {
    Error::new(codes::parse::BAD_VALUE_ACCESS, what)
}

/// Substitute `${VAR}` and `${VAR:-default}` placeholders in a single
/// string. Unresolvable placeholders without a default are left intact.
pub fn substitute_env(input: &str, extra: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let inner = &input[i + 2..i + 2 + end];
                let (name, default) = match inner.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner, None),
                };
                let resolved = std::env::var(name)
                    .ok()
                    .or_else(|| extra.get(name).cloned())
                    .or_else(|| default.map(str::to_string));
                match resolved {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&input[i..i + 2 + end + 1]),
                }
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Apply [`substitute_env`] to every string in a JSON document, in place.
pub fn substitute_env_json(value: &mut serde_json::Value, extra: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                *s = substitute_env(s, extra);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_env_json(item, extra);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env_json(v, extra);
            }
        }
        _ => {}
    }
}

/// Accept either raw PEM or base64-encoded PEM. Raw PEM is the canonical
/// form for new configuration; the base64 variant remains for deployed
/// configs that still carry it.
pub fn decode_pem_field(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.contains("-----BEGIN") {
        return Ok(trimmed.as_bytes().to_vec());
    }
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| config_error(format!("certificate field is neither PEM nor base64: {e}")))
}

/// TLS requirement for the MySQL server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Enable,
    Require,
}

/// MySQL connection and pool parameters.
///
/// Two credential sets exist because unix-socket deployments authenticate
/// as a different user than TCP ones; `unix_socket` being non-empty selects
/// the socket transport and the `*_socket` credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ca_str: String,
    pub cert_str: String,
    pub cert_key_str: String,
    pub ssl: i32,
    pub multi_queries: bool,
    pub unix_socket: String,
    pub username_socket: String,
    pub password_socket: String,
    pub thread_safe: bool,
    #[serde(default = "default_initial_size")]
    pub initial_size: u64,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Seconds between idle-connection pings; 0 disables pinging.
    #[serde(default)]
    pub ping_interval: u64,
}

fn default_initial_size() -> u64 {
    1
}

fn default_max_size() -> u64 {
    151
}

impl MysqlConfig {
    /// Deserialize from JSON after environment substitution.
    pub fn from_json(
        mut value: serde_json::Value,
        extra: &HashMap<String, String>,
    ) -> Result<Self> {
        substitute_env_json(&mut value, extra);
        serde_json::from_value(value).map_err(|e| config_error(format!("MysqlConfig: {e}")))
    }

    pub fn ssl_mode(&self) -> SslMode {
        match self.ssl {
            0 => SslMode::Disable,
            1 => SslMode::Enable,
            _ => SslMode::Require,
        }
    }

    pub fn uses_unix_socket(&self) -> bool {
        !self.unix_socket.is_empty()
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }
}

/// One upstream HTTP proxy. Disabled entries are dropped at config load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ProxySetting {
    pub host: String,
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disabled: bool,
}

impl ProxySetting {
    pub fn port_u16(&self) -> Result<u16> {
        self.port
            .parse()
            .map_err(|_| config_error(format!("invalid proxy port '{}'", self.port)))
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Text(String),
        Number(i64),
    }
    Ok(match PortRepr::deserialize(deserializer)? {
        PortRepr::Text(s) => s,
        PortRepr::Number(n) => n.to_string(),
    })
}

/// An inline certificate: PEM content carried in the config document.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpclientCertificate {
    pub cert_content: String,
    #[serde(default)]
    pub file_format: String,
}

/// A certificate referenced by path.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpclientCertificateFile {
    pub cert_path: String,
    #[serde(default)]
    pub file_format: String,
}

/// Minimum TLS protocol selection derived from the openssl-style
/// `ssl_method` names the original configs used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersions {
    Tls12Only,
    Tls13Only,
    Any,
}

fn tls_versions_from_method(name: &str) -> Result<TlsVersions> {
    match name {
        "tlsv12" | "tlsv12_client" | "tlsv12_server" => Ok(TlsVersions::Tls12Only),
        "tlsv13" | "tlsv13_client" | "tlsv13_server" => Ok(TlsVersions::Tls13Only),
        "tls" | "tls_client" | "tls_server" | "sslv23" | "sslv23_client" | "sslv23_server" => {
            Ok(TlsVersions::Any)
        }
        other => Err(config_error(format!("unsupported ssl_method '{other}'"))),
    }
}

/// HTTP client transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpclientConfig {
    #[serde(default = "default_ssl_method")]
    pub ssl_method: String,
    #[serde(default)]
    pub threads_num: u32,
    #[serde(default)]
    pub verify_paths: Vec<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub certificates: Vec<HttpclientCertificate>,
    #[serde(default)]
    pub certificate_files: Vec<HttpclientCertificateFile>,
    #[serde(default)]
    pub proxy_pool: Vec<ProxySetting>,
}

fn default_ssl_method() -> String {
    "tlsv12_client".to_string()
}

impl Default for HttpclientConfig {
    fn default() -> Self {
        Self {
            ssl_method: default_ssl_method(),
            threads_num: 0,
            verify_paths: Vec::new(),
            insecure_skip_verify: false,
            certificates: Vec::new(),
            certificate_files: Vec::new(),
            proxy_pool: Vec::new(),
        }
    }
}

impl HttpclientConfig {
    /// Deserialize from JSON after environment substitution; disabled proxy
    /// entries are filtered out here.
    pub fn from_json(
        mut value: serde_json::Value,
        extra: &HashMap<String, String>,
    ) -> Result<Self> {
        substitute_env_json(&mut value, extra);
        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| config_error(format!("HttpclientConfig: {e}")))?;
        config.proxy_pool.retain(|p| !p.disabled);
        config.tls_versions()?;
        Ok(config)
    }

    pub fn tls_versions(&self) -> Result<TlsVersions> {
        tls_versions_from_method(&self.ssl_method)
    }

    /// Worker thread count: 0 means "use all available parallelism", larger
    /// values are clamped to it.
    pub fn effective_threads(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self.threads_num as usize {
            0 => available,
            n => n.min(available),
        }
    }
}

/// HTTP connection pool tuning. All intervals are configured in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_idle_reap_interval")]
    pub idle_reap_interval: i64,
    #[serde(default = "default_idle_keep_alive")]
    pub idle_keep_alive: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,
    #[serde(default = "default_max_idle_per_origin")]
    pub max_idle_per_origin: usize,
    #[serde(default = "default_max_total_idle")]
    pub max_total_idle: usize,
}

fn default_idle_reap_interval() -> i64 {
    15
}
fn default_idle_keep_alive() -> u64 {
    60
}
fn default_resolve_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_io_timeout() -> u64 {
    30
}
fn default_max_idle_per_origin() -> usize {
    6
}
fn default_max_total_idle() -> usize {
    512
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_reap_interval: default_idle_reap_interval(),
            idle_keep_alive: default_idle_keep_alive(),
            resolve_timeout: default_resolve_timeout(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            io_timeout: default_io_timeout(),
            max_idle_per_origin: default_max_idle_per_origin(),
            max_total_idle: default_max_total_idle(),
        }
    }
}

impl PoolConfig {
    /// Reaper period; `None` disables the reaper.
    pub fn reap_interval(&self) -> Option<Duration> {
        (self.idle_reap_interval > 0).then(|| Duration::from_secs(self.idle_reap_interval as u64))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.idle_keep_alive)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_extra() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn substitute_prefers_os_env_then_map_then_default() {
        std::env::set_var("AQ_CFG_TEST_HOST", "from-env");
        let mut extra = HashMap::new();
        extra.insert("AQ_CFG_TEST_HOST".to_string(), "from-map".to_string());
        extra.insert("AQ_CFG_TEST_USER".to_string(), "mapped-user".to_string());

        assert_eq!(
            substitute_env("${AQ_CFG_TEST_HOST}", &extra),
            "from-env"
        );
        assert_eq!(
            substitute_env("${AQ_CFG_TEST_USER}", &extra),
            "mapped-user"
        );
        assert_eq!(
            substitute_env("${AQ_CFG_TEST_MISSING:-fallback}", &extra),
            "fallback"
        );
        assert_eq!(
            substitute_env("${AQ_CFG_TEST_MISSING}", &extra),
            "${AQ_CFG_TEST_MISSING}"
        );
        std::env::remove_var("AQ_CFG_TEST_HOST");
    }

    #[test]
    fn substitute_handles_multiple_placeholders() {
        let mut extra = HashMap::new();
        extra.insert("A".to_string(), "1".to_string());
        extra.insert("B".to_string(), "2".to_string());
        assert_eq!(substitute_env("${A}-${B:-x}-${C:-3}", &extra), "1-2-3");
    }

    #[test]
    fn substitute_env_json_walks_nested_strings() {
        let mut extra = HashMap::new();
        extra.insert("DB".to_string(), "sakila".to_string());
        let mut v = serde_json::json!({
            "database": "${DB}",
            "nested": {"list": ["${DB}", 42]}
        });
        substitute_env_json(&mut v, &extra);
        assert_eq!(v["database"], "sakila");
        assert_eq!(v["nested"]["list"][0], "sakila");
    }

    #[test]
    fn pem_field_accepts_raw_and_base64() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----";
        assert_eq!(decode_pem_field(pem).unwrap(), pem.as_bytes());

        let encoded = base64::engine::general_purpose::STANDARD.encode(pem);
        assert_eq!(decode_pem_field(&encoded).unwrap(), pem.as_bytes());

        assert_eq!(decode_pem_field("  ").unwrap(), Vec::<u8>::new());
        assert!(decode_pem_field("!!not base64!!").is_err());
    }

    #[test]
    fn mysql_config_defaults_and_ssl_mode() {
        let jv = serde_json::json!({
            "host": "127.0.0.1", "port": 3306,
            "username": "app", "password": "secret", "database": "sakila",
            "ca_str": "", "cert_str": "", "cert_key_str": "",
            "ssl": 2, "multi_queries": true,
            "unix_socket": "", "username_socket": "", "password_socket": "",
            "thread_safe": true
        });
        let cfg = MysqlConfig::from_json(jv, &no_extra()).unwrap();
        assert_eq!(cfg.initial_size, 1);
        assert_eq!(cfg.max_size, 151);
        assert_eq!(cfg.ping_interval(), None);
        assert_eq!(cfg.ssl_mode(), SslMode::Require);
        assert!(!cfg.uses_unix_socket());
    }

    #[test]
    fn mysql_config_missing_field_is_an_error() {
        let jv = serde_json::json!({"host": "localhost"});
        let err = MysqlConfig::from_json(jv, &no_extra()).unwrap_err();
        assert_eq!(err.code, codes::parse::BAD_VALUE_ACCESS);
    }

    #[test]
    fn httpclient_config_filters_disabled_proxies() {
        let jv = serde_json::json!({
            "ssl_method": "tlsv13",
            "threads_num": 2,
            "proxy_pool": [
                {"host": "p1", "port": 8080, "username": "", "password": ""},
                {"host": "p2", "port": "8081", "username": "", "password": "", "disabled": true}
            ]
        });
        let cfg = HttpclientConfig::from_json(jv, &no_extra()).unwrap();
        assert_eq!(cfg.proxy_pool.len(), 1);
        assert_eq!(cfg.proxy_pool[0].host, "p1");
        assert_eq!(cfg.proxy_pool[0].port_u16().unwrap(), 8080);
        assert_eq!(cfg.tls_versions().unwrap(), TlsVersions::Tls13Only);
    }

    #[test]
    fn unknown_ssl_method_is_rejected() {
        let jv = serde_json::json!({"ssl_method": "sslv3", "threads_num": 0});
        assert!(HttpclientConfig::from_json(jv, &no_extra()).is_err());
    }

    #[test]
    fn effective_threads_clamps_to_parallelism() {
        let mut cfg = HttpclientConfig::default();
        cfg.threads_num = 0;
        let auto = cfg.effective_threads();
        assert!(auto >= 1);
        cfg.threads_num = u32::MAX;
        assert_eq!(cfg.effective_threads(), auto);
        cfg.threads_num = 1;
        assert_eq!(cfg.effective_threads(), 1);
    }

    #[test]
    fn pool_config_defaults_match_deployment_values() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.reap_interval(), Some(Duration::from_secs(15)));
        assert_eq!(cfg.keep_alive(), Duration::from_secs(60));
        assert_eq!(cfg.max_idle_per_origin, 6);
        assert_eq!(cfg.max_total_idle, 512);
        assert_eq!(cfg.io_timeout(), Duration::from_secs(30));

        let disabled: PoolConfig =
            serde_json::from_value(serde_json::json!({"idle_reap_interval": 0})).unwrap();
        assert_eq!(disabled.reap_interval(), None);
    }
}
