//! Runtime configuration: the CLI surface (parsed by `main` with `clap`) and
//! the Vault/runtime environment variables read directly via `std::env`, in
//! the teacher's `default_*`-function style.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// CLI surface. Each flag also reads its matching environment variable so
/// Helm/compose deployments can configure either way.
#[derive(Debug, Parser)]
#[command(name = "vault-secrets-reloader", about = "Rolls out workloads when the Vault secrets they consume change")]
pub struct Cli {
    #[arg(long, env = "COLLECTOR_SYNC_PERIOD", value_parser = humantime::parse_duration, default_value = "30s")]
    pub collector_sync_period: Duration,

    #[arg(long, env = "RELOADER_RUN_PERIOD", value_parser = humantime::parse_duration, default_value = "60s")]
    pub reloader_run_period: Duration,

    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "ENABLE_JSON_LOG", default_value_t = false)]
    pub enable_json_log: bool,
}

/// The Vault/runtime environment, read once at startup. Not derived from
/// `clap` because these are authoritative environment variables per the
/// external interface, not flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub vault_addr: String,
    pub vault_auth_method: String,
    pub vault_role: String,
    pub vault_path: String,
    pub vault_namespace: String,
    pub vault_skip_verify: bool,
    pub vault_tls_secret: String,
    pub vault_tls_secret_ns: String,
    pub vault_client_timeout: Duration,
    pub vault_ignore_missing_secrets: bool,
    pub vault_dynamic_secret_restart_threshold: f64,
    pub listen_address: String,
    pub pod_namespace: Option<String>,
    pub service_account_token_path: PathBuf,
    /// PEM-encoded CA bundle contents, loaded from `vault_tls_secret` by the
    /// caller before constructing the backend (kept here so the adapter
    /// doesn't need its own Kubernetes client just to read one Secret).
    pub vault_ca_certs: Vec<String>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.eq_ignore_ascii_case("true") || v == "1",
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let vault_client_timeout = humantime::parse_duration(&env_or("VAULT_CLIENT_TIMEOUT", "10s"))
            .context("invalid VAULT_CLIENT_TIMEOUT")?;

        let threshold: f64 = env_or("VAULT_DYNAMIC_SECRET_RESTART_THRESHOLD", "0.7")
            .parse()
            .context("invalid VAULT_DYNAMIC_SECRET_RESTART_THRESHOLD")?;

        Ok(Self {
            vault_addr: env_or("VAULT_ADDR", "https://vault:8200"),
            vault_auth_method: env_or("VAULT_AUTH_METHOD", "jwt"),
            vault_role: env_or("VAULT_ROLE", ""),
            vault_path: env_or("VAULT_PATH", "kubernetes"),
            vault_namespace: env_or("VAULT_NAMESPACE", "default"),
            vault_skip_verify: env_bool("VAULT_SKIP_VERIFY", false),
            vault_tls_secret: env_or("VAULT_TLS_SECRET", ""),
            vault_tls_secret_ns: env_or("VAULT_TLS_SECRET_NS", "default"),
            vault_client_timeout,
            vault_ignore_missing_secrets: env_bool("VAULT_IGNORE_MISSING_SECRETS", false),
            vault_dynamic_secret_restart_threshold: threshold,
            listen_address: env_or("LISTEN_ADDRESS", ":8080"),
            pod_namespace: std::env::var("POD_NAMESPACE").ok().filter(|s| !s.is_empty()),
            service_account_token_path: PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            ),
            vault_ca_certs: Vec::new(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.vault_dynamic_secret_restart_threshold <= 0.0
            || self.vault_dynamic_secret_restart_threshold >= 1.0
        {
            anyhow::bail!(
                "VAULT_DYNAMIC_SECRET_RESTART_THRESHOLD must be in (0, 1), got {}",
                self.vault_dynamic_secret_restart_threshold
            );
        }
        Ok(())
    }
}
