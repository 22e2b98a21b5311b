//! TLS connector construction from store material.

use crate::error::ClientError;
use crate::options::TransportSslOptions;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a TLS connector for `server_host` from the given options.
///
/// Store files are opened here, not when the options are built.
pub fn create_tls_connector(
    options: &TransportSslOptions,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    if !options
        .store_type()
        .eq_ignore_ascii_case(TransportSslOptions::DEFAULT_STORE_TYPE)
    {
        return Err(ClientError::TlsConfig(format!(
            "unsupported store type: {}",
            options.store_type()
        )));
    }

    let builder = if options.is_trust_all() {
        tracing::warn!("Using insecure TLS (server certificate verification disabled)");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    } else {
        let root_store = load_root_store(options)?;
        if options.is_verify_host() {
            rustls::ClientConfig::builder().with_root_certificates(root_store)
        } else {
            tracing::warn!("TLS host name verification disabled");
            let inner = WebPkiServerVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| ClientError::TlsConfig(format!("invalid trust store: {}", e)))?;
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoHostnameVerifier { inner }))
        }
    };

    let client_config = match options.key_store_location() {
        Some(path) => {
            require_password(path, options.key_store_password())?;
            let certs = load_certs(path)?;
            let key = load_private_key(path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(server_host.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", server_host)))?;

    Ok((connector, server_name))
}

/// Maps a failed TLS handshake to a client error, keeping certificate
/// failures distinct from other connect failures.
pub fn handshake_error(err: io::Error) -> ClientError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls_error {
        Some(rustls::Error::InvalidCertificate(cert)) => {
            ClientError::TlsVerification(format!("{:?}", cert))
        }
        Some(rustls::Error::NoCertificatesPresented) => {
            ClientError::TlsVerification("no certificates presented".to_string())
        }
        _ => ClientError::TransportConnect(format!("TLS handshake failed: {}", err)),
    }
}

fn load_root_store(options: &TransportSslOptions) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match options.trust_store_location() {
        Some(path) => {
            require_password(path, options.trust_store_password())?;
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn require_password(path: &Path, password: Option<&str>) -> Result<(), ClientError> {
    match password {
        Some(_) => Ok(()),
        None => Err(ClientError::TlsConfig(format!(
            "no password configured for store {:?}",
            path
        ))),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open store {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid store {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open store {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ClientError::TlsConfig(format!("invalid store {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ClientError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    match err {
        rustls::Error::InvalidCertificate(CertificateError::NotValidForName) => true,
        // Newer rustls releases report the mismatch with extra context.
        rustls::Error::InvalidCertificate(other) => {
            format!("{:?}", other).starts_with("NotValidForName")
        }
        _ => false,
    }
}

/// Full chain verification with the host name check skipped.
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(err) if is_name_mismatch(&err) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any server certificate.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pem_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_load_invalid_key_path() {
        let result = load_private_key(Path::new("/nonexistent/key.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open"));
    }

    #[test]
    fn test_empty_store_has_no_certificates() {
        let file = pem_file("not a certificate\n");
        let err = load_certs(file.path()).unwrap_err();
        assert!(err.to_string().contains("no certificates"));

        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_default_options_use_bundled_roots() {
        let options = TransportSslOptions::new();
        assert!(create_tls_connector(&options, "broker.example.com").is_ok());
    }

    #[test]
    fn test_trust_all_connector() {
        let options = TransportSslOptions::new().with_trust_all(true);
        assert!(create_tls_connector(&options, "127.0.0.1").is_ok());
    }

    #[test]
    fn test_verify_host_disabled_connector() {
        let options = TransportSslOptions::new().with_verify_host(false);
        assert!(create_tls_connector(&options, "localhost").is_ok());
    }

    #[test]
    fn test_unsupported_store_type() {
        let options = TransportSslOptions::new().with_store_type("jks");
        let err = create_tls_connector(&options, "localhost").err().unwrap();
        assert!(matches!(err, ClientError::TlsConfig(ref m) if m.contains("jks")));
    }

    #[test]
    fn test_store_type_is_case_insensitive() {
        let options = TransportSslOptions::new().with_store_type("PEM");
        assert!(create_tls_connector(&options, "localhost").is_ok());
    }

    #[test]
    fn test_trust_store_without_password() {
        let file = pem_file("");
        let options = TransportSslOptions::new().with_trust_store_location(file.path());
        let err = create_tls_connector(&options, "localhost").err().unwrap();
        assert!(matches!(err, ClientError::TlsConfig(ref m) if m.contains("no password")));
    }

    #[test]
    fn test_key_store_without_password() {
        let options = TransportSslOptions::new()
            .with_trust_all(true)
            .with_key_store_location("/nonexistent/client.pem");
        let err = create_tls_connector(&options, "localhost").err().unwrap();
        assert!(matches!(err, ClientError::TlsConfig(ref m) if m.contains("no password")));
    }

    #[test]
    fn test_missing_trust_store_file() {
        let options =
            TransportSslOptions::new().with_trust_store("/nonexistent/ca.pem", "password");
        let err = create_tls_connector(&options, "localhost").err().unwrap();
        assert!(matches!(err, ClientError::TlsConfig(ref m) if m.contains("cannot open")));
    }

    #[test]
    fn test_handshake_error_classification() {
        let cert_err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert!(matches!(
            handshake_error(cert_err),
            ClientError::TlsVerification(_)
        ));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(
            handshake_error(reset),
            ClientError::TransportConnect(_)
        ));
    }

    #[test]
    fn test_name_mismatch_detection() {
        assert!(is_name_mismatch(&rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName
        )));
        assert!(!is_name_mismatch(&rustls::Error::InvalidCertificate(
            CertificateError::Expired
        )));
    }
}
