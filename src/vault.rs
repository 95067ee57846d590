//! Adapter around the Vault client: a narrow `read(path)` contract that
//! classifies a path as KV-versioned or dynamic-leased, plus connection
//! health management. Everything above this module talks to `SecretBackend`,
//! never to `vaultrs` directly, so tests can substitute a fake.

use crate::config::Config;
use crate::secret_string::SecretString;
use crate::types::SecretClassification;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vaultrs::auth::kubernetes;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("secret not found at {path}")]
    NotFound { path: String },
    #[error("backend I/O error: {0}")]
    Io(String),
    #[error("could not classify secret: {0}")]
    Classification(String),
    #[error("path is no longer a dynamic/leased secret")]
    NoLongerDynamic,
}

#[derive(Debug, Clone)]
pub struct SecretInfo {
    pub path: String,
    pub classification: SecretClassification,
}

#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub ttl_seconds: u64,
    pub renewable: bool,
}

/// Narrow contract the collector and reloader depend on. The real
/// implementation wraps Vault; tests substitute an in-memory fake.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn read(&self, path: &str) -> Result<SecretInfo, BackendError>;
    async fn renew_lease(&self, path: &str, lease_id: &str) -> Result<LeaseInfo, BackendError>;
    async fn health_check(&self) -> Result<(), BackendError>;
}

/// The standard Vault response envelope: lease fields live at the top level,
/// KV v2's version lives under `data.metadata.version`. A single generic
/// shape covers every secrets engine, which is what lets this adapter stay
/// ignorant of which engine is mounted at a given path.
#[derive(Debug, Deserialize)]
struct VaultReadEnvelope {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    data: Option<VaultReadData>,
}

#[derive(Debug, Deserialize)]
struct VaultReadData {
    metadata: Option<VaultKvMetadata>,
}

#[derive(Debug, Deserialize)]
struct VaultKvMetadata {
    version: u64,
}

pub struct VaultBackend {
    config: Config,
    http: reqwest::Client,
    token: RwLock<Option<SecretString>>,
}

impl VaultBackend {
    pub fn new(config: Config) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder().timeout(config.vault_client_timeout);
        if config.vault_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        for cert_pem in &config.vault_ca_certs {
            let cert = reqwest::Certificate::from_pem(cert_pem.as_bytes())
                .map_err(|e| BackendError::Io(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| BackendError::Io(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
        })
    }

    async fn authenticate(&self) -> Result<SecretString, BackendError> {
        info!(
            auth_method = %self.config.vault_auth_method,
            auth_path = %self.config.vault_path,
            "authenticating to Vault"
        );

        let jwt = tokio::fs::read_to_string(&self.config.service_account_token_path)
            .await
            .map_err(|e| BackendError::Io(format!("failed to read service account token: {e}")))?;
        let jwt = jwt.trim().to_string();

        let settings = VaultClientSettingsBuilder::default()
            .address(self.config.vault_addr.clone())
            .verify(!self.config.vault_skip_verify)
            .namespace(Some(self.config.vault_namespace.clone()))
            .timeout(Some(self.config.vault_client_timeout))
            .build()
            .map_err(|e| BackendError::Io(format!("invalid Vault client settings: {e}")))?;
        let client = VaultClient::new(settings)
            .map_err(|e| BackendError::Io(format!("failed to build Vault client: {e}")))?;

        let auth_info = kubernetes::login(&client, &self.config.vault_path, &self.config.vault_role, &jwt)
            .await
            .map_err(|e| BackendError::Io(format!("Vault login failed: {e}")))?;

        Ok(SecretString::new(auth_info.client_token))
    }

    async fn token(&self) -> Result<SecretString, BackendError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let token = self.authenticate().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn discard_client(&self) {
        *self.token.write().await = None;
    }

    async fn raw_read(&self, path: &str) -> Result<VaultReadEnvelope, BackendError> {
        let token = self.token().await?;
        let url = format!("{}/v1/{}", self.config.vault_addr.trim_end_matches('/'), path);

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", token.expose_secret())
            .send()
            .await
            .map_err(|e| BackendError::Io(format!("request to {url} failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                path: path.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(BackendError::Io(format!(
                "Vault returned status {} for {}",
                response.status(),
                url
            )));
        }

        response
            .json::<VaultReadEnvelope>()
            .await
            .map_err(|e| BackendError::Classification(format!("malformed Vault response: {e}")))
    }

    fn classify(path: &str, envelope: &VaultReadEnvelope) -> Result<SecretClassification, BackendError> {
        if !envelope.lease_id.is_empty() {
            return Ok(SecretClassification::Dynamic {
                lease_id: envelope.lease_id.clone(),
                ttl_seconds: envelope.lease_duration,
                renewable: envelope.renewable,
            });
        }

        let version = envelope
            .data
            .as_ref()
            .and_then(|d| d.metadata.as_ref())
            .map(|m| m.version)
            .ok_or_else(|| {
                BackendError::Classification(format!(
                    "path {path} has no lease and no metadata.version; cannot classify"
                ))
            })?;

        Ok(SecretClassification::Kv { version })
    }
}

#[async_trait]
impl SecretBackend for VaultBackend {
    async fn read(&self, path: &str) -> Result<SecretInfo, BackendError> {
        debug!(path, "reading secret from Vault");
        let envelope = self.raw_read(path).await?;
        let classification = Self::classify(path, &envelope)?;
        Ok(SecretInfo {
            path: path.to_string(),
            classification,
        })
    }

    async fn renew_lease(&self, path: &str, _lease_id: &str) -> Result<LeaseInfo, BackendError> {
        let envelope = self.raw_read(path).await?;
        if envelope.lease_id.is_empty() {
            return Err(BackendError::NoLongerDynamic);
        }
        Ok(LeaseInfo {
            lease_id: envelope.lease_id,
            ttl_seconds: envelope.lease_duration,
            renewable: envelope.renewable,
        })
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let url = format!(
            "{}/v1/sys/health",
            self.config.vault_addr.trim_end_matches('/')
        );
        let response = self.http.get(&url).send().await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.discard_client().await;
                return Err(BackendError::Io(format!("health check request failed: {e}")));
            }
        };

        // 429 = standby node, still healthy enough to read from in most deployments
        if response.status().is_success() || response.status().as_u16() == 429 {
            return Ok(());
        }

        warn!(status = %response.status(), "Vault health check returned non-success; discarding cached client");
        self.discard_client().await;
        Err(BackendError::Io(format!(
            "Vault health check returned status {}",
            response.status()
        )))
    }
}

pub type SharedBackend = Arc<dyn SecretBackend>;
