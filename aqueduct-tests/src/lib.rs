//! Shared helpers for the integration test suites.

use std::collections::HashMap;

use aqueduct::MysqlConfig;

/// Install a subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A TCP config pointing at a local test server (no TLS, multi-statement
/// queries enabled).
pub fn mysql_config(host: &str, port: u16, user: &str, password: &str, db: &str) -> MysqlConfig {
    let jv = serde_json::json!({
        "host": host,
        "port": port,
        "username": user,
        "password": password,
        "database": db,
        "ca_str": "",
        "cert_str": "",
        "cert_key_str": "",
        "ssl": 0,
        "multi_queries": true,
        "unix_socket": "",
        "username_socket": "",
        "password_socket": "",
        "thread_safe": true,
        "initial_size": 1,
        "max_size": 8
    });
    MysqlConfig::from_json(jv, &HashMap::new()).expect("test config is valid")
}
