//! Origin keying for the HTTP connection pool.

/// `(scheme, host, port)` triple. Equality over all three fields; the pool
/// keys its idle deques by it and TLS uses `host` for SNI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// "http" or "https", lowercase
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
        }
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "https".to_string(),
            host: host.into(),
            port,
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.is_https() { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_over_all_three_fields() {
        assert_eq!(Origin::http("a", 80), Origin::http("a", 80));
        assert_ne!(Origin::http("a", 80), Origin::https("a", 80));
        assert_ne!(Origin::http("a", 80), Origin::http("a", 81));
        assert_ne!(Origin::http("a", 80), Origin::http("b", 80));
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(Origin::http("example.com", 80).host_header(), "example.com");
        assert_eq!(Origin::https("example.com", 443).host_header(), "example.com");
        assert_eq!(
            Origin::https("example.com", 8443).host_header(),
            "example.com:8443"
        );
    }
}
