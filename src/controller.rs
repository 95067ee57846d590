//! Top-level wiring: builds the Kubernetes and Vault clients, constructs the
//! shared index, and starts the collector and reloader workers under a
//! shared cancellation token.

use crate::collector;
use crate::config::Config;
use crate::index::Index;
use crate::reloader::{self, KubeRolloutSink, ReloaderContext};
use crate::vault::{SharedBackend, VaultBackend};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn create_client() -> Result<Client> {
    let client = Client::try_default().await.context("failed to build Kubernetes client")?;
    let api_server_info = client.apiserver_version().await.context("failed to reach Kubernetes API server")?;
    info!(
        "connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Reads the optional CA-bundle Secret named by `VAULT_TLS_SECRET`, returning
/// its PEM entries (all values of the Secret's `data` map). A no-op when the
/// name is empty.
pub async fn load_vault_ca_certs(client: &Client, config: &Config) -> Result<Vec<String>> {
    if config.vault_tls_secret.is_empty() {
        return Ok(Vec::new());
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.vault_tls_secret_ns);
    let secret = secrets
        .get(&config.vault_tls_secret)
        .await
        .with_context(|| format!("failed to read CA bundle secret {}/{}", config.vault_tls_secret_ns, config.vault_tls_secret))?;

    let certs = secret
        .data
        .unwrap_or_default()
        .into_values()
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .collect();
    Ok(certs)
}

pub struct Controller {
    pub client: Client,
    pub index: Arc<Index>,
    pub backend: SharedBackend,
    pub config: Config,
}

impl Controller {
    pub async fn bootstrap(mut config: Config) -> Result<Self> {
        config.validate()?;
        let client = create_client().await?;
        config.vault_ca_certs = load_vault_ca_certs(&client, &config).await?;

        let backend: SharedBackend = Arc::new(VaultBackend::new(config.clone()).context("failed to build Vault backend")?);

        Ok(Self {
            client,
            index: Arc::new(Index::new()),
            backend,
            config,
        })
    }

    /// Runs the collector and reloader concurrently until `cancel` fires.
    pub async fn run(
        self,
        collector_sync_period: Duration,
        reloader_run_period: Duration,
        cancel: CancellationToken,
    ) {
        let collector_task = collector::run(
            self.client.clone(),
            self.index.clone(),
            self.backend.clone(),
            self.config.pod_namespace.clone(),
            collector_sync_period,
            cancel.clone(),
        );

        let reloader_ctx = ReloaderContext {
            index: self.index.clone(),
            backend: self.backend.clone(),
            rollout_sink: Arc::new(KubeRolloutSink { client: self.client.clone() }),
            ignore_missing_secrets: self.config.vault_ignore_missing_secrets,
            restart_threshold: self.config.vault_dynamic_secret_restart_threshold,
        };
        let reloader_task = reloader::run(reloader_ctx, reloader_run_period, cancel.clone());

        tokio::join!(collector_task, reloader_task);
    }
}
