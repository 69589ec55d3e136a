use base64::Engine;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use url::Url;

use super::KubeConfig;
use crate::error::{Result, TunnelError};

/// Everything needed to open a connection to one cluster
#[derive(Debug, Clone)]
pub struct Credentials {
    pub base_url: Url,
    /// Extra upgrade-request headers (the bearer token, when present)
    pub auth_headers: HeaderMap,
    /// Client certificate identity, used only when no token is configured
    pub identity: Option<ClientIdentity>,
}

/// Client certificate chain and private key, parsed from PEM
pub struct ClientIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut reader = cert_pem;
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TunnelError::Credential(format!("Invalid client certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(TunnelError::Credential(
                "No certificate found in client-certificate-data".to_string(),
            ));
        }

        let mut reader = key_pem;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| TunnelError::Credential(format!("Invalid client key: {}", e)))?
            .ok_or_else(|| {
                TunnelError::Credential("No private key found in client-key-data".to_string())
            })?;

        Ok(Self { certs, key })
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Resolves context names against a kubeconfig loaded once at startup
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    kubeconfig: KubeConfig,
}

impl CredentialResolver {
    pub fn new(kubeconfig: KubeConfig) -> Self {
        Self { kubeconfig }
    }

    pub fn kubeconfig(&self) -> &KubeConfig {
        &self.kubeconfig
    }

    /// Resolve a context to its cluster URL and user credentials.
    ///
    /// A non-empty bearer token wins; otherwise both client certificate and
    /// key data must be present.
    pub fn resolve(&self, context_name: &str) -> Result<Credentials> {
        let context = self.kubeconfig.context(context_name).ok_or_else(|| {
            TunnelError::Credential(format!("Context '{}' not found", context_name))
        })?;

        let cluster = self.kubeconfig.cluster(&context.cluster).ok_or_else(|| {
            TunnelError::Credential(format!(
                "Cluster '{}' of context '{}' not found",
                context.cluster, context_name
            ))
        })?;

        let user = self.kubeconfig.user(&context.user).ok_or_else(|| {
            TunnelError::Credential(format!(
                "User '{}' of context '{}' not found",
                context.user, context_name
            ))
        })?;

        let base_url = Url::parse(&cluster.server).map_err(|e| {
            TunnelError::Credential(format!(
                "Invalid server URL '{}' for cluster '{}': {}",
                cluster.server, context.cluster, e
            ))
        })?;

        if let Some(token) = user.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                TunnelError::Credential(format!("Token of user '{}' is not a valid header", context.user))
            })?;
            value.set_sensitive(true);

            let mut auth_headers = HeaderMap::new();
            auth_headers.insert(AUTHORIZATION, value);

            return Ok(Credentials {
                base_url,
                auth_headers,
                identity: None,
            });
        }

        let cert_data = user.client_certificate_data.as_deref().ok_or_else(|| {
            TunnelError::Credential(format!(
                "User '{}' has neither a token nor client-certificate-data",
                context.user
            ))
        })?;
        let key_data = user.client_key_data.as_deref().ok_or_else(|| {
            TunnelError::Credential(format!("User '{}' has no client-key-data", context.user))
        })?;

        let identity = ClientIdentity::from_pem(
            &decode_pem(cert_data, "client-certificate-data")?,
            &decode_pem(key_data, "client-key-data")?,
        )?;

        Ok(Credentials {
            base_url,
            auth_headers: HeaderMap::new(),
            identity: Some(identity),
        })
    }
}

fn decode_pem(data: &str, field: &str) -> Result<Vec<u8>> {
    let compact: String = data.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| TunnelError::Credential(format!("Invalid {} encoding: {}", field, e)))
}
