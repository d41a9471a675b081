//! tokio-postgres connectivity for the COPY/transaction path.
//!
//! sqlx has no streaming `COPY ... FROM STDIN` sink that plays well with an
//! outer transaction we own end to end, so the update pipeline talks to
//! Postgres through a dedicated tokio-postgres client.

use anyhow::{anyhow, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::load_native_certs;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// Postgres `sslmode=require` means "encrypt" but does not mandate verifying that the
/// server cert chains to a trusted CA.
#[derive(Debug)]
struct InsecureSslModeRequireVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ServerCertVerifier for InsecureSslModeRequireVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn sslmode_from_querystring(url: &str) -> Option<String> {
    url.split_once('?').and_then(|(_, qs)| {
        qs.split('&').find_map(|kv| match kv.split_once('=') {
            Some((k, v)) if k.eq_ignore_ascii_case("sslmode") => Some(v.to_lowercase()),
            _ => None,
        })
    })
}

fn host_is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("://0.0.0.0")
}

/// Effective sslmode; precedence: querystring > env (PG_SSLMODE/DB_SSLMODE) > heuristic.
pub(crate) fn effective_sslmode(url: &str, env_mode: Option<&str>) -> String {
    let env_mode = env_mode
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    match (sslmode_from_querystring(url), env_mode) {
        (Some(url_mode), Some(env_mode)) if url_mode != env_mode => {
            // Avoid printing the DSN (it contains secrets); only log the modes.
            warn!(
                dsn_mode = %url_mode,
                env_mode = %env_mode,
                "sslmode differs between DSN and env; honoring DSN"
            );
            url_mode
        }
        (Some(url_mode), _) => url_mode,
        (None, Some(env_mode)) => env_mode,
        // Require for remote hosts, prefer for localhost.
        (None, None) if host_is_local(url) => "prefer".to_string(),
        (None, None) => "require".to_string(),
    }
}

async fn connect_tls(url: &str, sslmode: &str) -> Result<Client> {
    let mut roots = RootCertStore::empty();
    for cert in load_native_certs().certs {
        let _ = roots.add(cert);
    }
    roots.extend(TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let config = if matches!(sslmode, "verify-ca" | "verify-full") {
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        let inner: Arc<dyn ServerCertVerifier> =
            WebPkiServerVerifier::builder_with_provider(roots.into(), provider).build()?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSslModeRequireVerifier { inner }))
            .with_no_client_auth()
    };
    let tls = MakeRustlsConnect::new(config);
    let (client, conn) = tokio_postgres::connect(url, tls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!(error = %e, "postgres connection error");
        }
    });
    Ok(client)
}

async fn connect_notls(url: &str) -> Result<Client> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            error!(error = %e, "postgres connection error");
        }
    });
    Ok(client)
}

/// Connect to Postgres using TLS by default, but honor sslmode overrides.
///
/// - If sslmode is "disable", use plaintext (NoTls).
/// - If sslmode is "require"/"verify-full" or unspecified, use Rustls TLS with system roots.
/// - If sslmode is "prefer", try TLS first; on TLS failure against a local host, fall back to NoTls.
pub async fn connect_postgres_auto(url: &str) -> Result<Client> {
    let env_mode = std::env::var("PG_SSLMODE")
        .ok()
        .or_else(|| std::env::var("DB_SSLMODE").ok());
    let sslmode = effective_sslmode(url, env_mode.as_deref());

    let client = match sslmode.as_str() {
        "disable" => {
            info!("sslmode=disable (NoTLS)");
            connect_notls(url).await?
        }
        "prefer" => match connect_tls(url, &sslmode).await {
            Ok(c) => {
                info!("sslmode=prefer, using TLS");
                c
            }
            Err(e) if host_is_local(url) => {
                warn!(error = %e, "TLS failed in prefer mode on local host, falling back to NoTLS");
                connect_notls(url).await?
            }
            Err(e) => {
                return Err(anyhow!(
                    "TLS connection failed (sslmode=prefer, non-local): {e}"
                ));
            }
        },
        _ => {
            info!(sslmode = %sslmode, "using TLS");
            connect_tls(url, &sslmode).await?
        }
    };
    Ok(client)
}
