//! Client TLS context assembly from [`HttpclientConfig`].

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;

use aqueduct_io::{codes, Error, Result};

use crate::config::{decode_pem_field, HttpclientConfig, TlsVersions};

fn tls_error(what: impl Into<String>) -> Error {
    Error::new(codes::parse::BAD_VALUE_ACCESS, what)
}

fn add_pem_bytes(roots: &mut RootCertStore, pem: &[u8], source: &str) -> Result<()> {
    let mut reader = std::io::BufReader::new(pem);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert: CertificateDer<'static> =
            cert.map_err(|e| tls_error(format!("bad certificate in {source}: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("rejected certificate in {source}: {e}")))?;
    }
    Ok(())
}

fn add_pem_path(roots: &mut RootCertStore, path: &std::path::Path) -> Result<()> {
    let pem = std::fs::read(path)
        .map_err(|e| tls_error(format!("cannot read {}: {e}", path.display())))?;
    add_pem_bytes(roots, &pem, &path.display().to_string())
}

/// Build a rustls client config: protocol versions from `ssl_method`,
/// system roots plus any configured extra certificates, and optionally the
/// no-verification mode.
pub fn client_tls_config(config: &HttpclientConfig) -> Result<Arc<rustls::ClientConfig>> {
    let versions: &[&rustls::SupportedProtocolVersion] = match config.tls_versions()? {
        TlsVersions::Tls12Only => &[&rustls::version::TLS12],
        TlsVersions::Tls13Only => &[&rustls::version::TLS13],
        TlsVersions::Any => rustls::ALL_VERSIONS,
    };

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(error = %error, "skipping unreadable system certificate");
    }
    for cert in native.certs {
        // tolerate odd entries in system stores
        let _ = roots.add(cert);
    }

    for path in &config.verify_paths {
        let path = std::path::Path::new(path);
        if path.is_dir() {
            let entries = std::fs::read_dir(path)
                .map_err(|e| tls_error(format!("cannot read {}: {e}", path.display())))?;
            for entry in entries.flatten() {
                let p = entry.path();
                let is_pem = p
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e, "pem" | "crt" | "cer"))
                    .unwrap_or(false);
                if is_pem {
                    add_pem_path(&mut roots, &p)?;
                }
            }
        } else {
            add_pem_path(&mut roots, path)?;
        }
    }

    for cert in &config.certificates {
        let pem = decode_pem_field(&cert.cert_content)?;
        add_pem_bytes(&mut roots, &pem, "inline certificate")?;
    }
    for file in &config.certificate_files {
        add_pem_path(&mut roots, std::path::Path::new(&file.cert_path))?;
    }

    let builder = rustls::ClientConfig::builder_with_protocol_versions(versions);
    let mut tls = builder
        .with_root_certificates(roots)
        .with_no_client_auth();

    if config.insecure_skip_verify {
        tracing::warn!("TLS peer verification is disabled by configuration");
        tls.dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification::new()));
    }

    Ok(Arc::new(tls))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate. Installed only when
    /// `insecure_skip_verify` is set.
    #[derive(Debug)]
    pub(super) struct NoVerification {
        provider: CryptoProvider,
    }

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self {
                provider: rustls::crypto::aws_lc_rs::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
