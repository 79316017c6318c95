use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::{ConfigError, Settings};

/// TLS acceptor for `DAYBOOK_TLS_CERT` / `DAYBOOK_TLS_KEY`, or None when
/// neither is set.
pub fn load_tls_acceptor(settings: &Settings) -> Result<Option<TlsAcceptor>, ConfigError> {
    let (cert_path, key_path) = match (settings.tls_cert.as_deref(), settings.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(ConfigError::Invalid(
                "both DAYBOOK_TLS_CERT and DAYBOOK_TLS_KEY must be set, or neither".into(),
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ConfigError::Invalid(format!("no certificate in {cert_path}")));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| ConfigError::Invalid(format!("no private key in {key_path}")))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Invalid(format!("TLS: {e}")))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
