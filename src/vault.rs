//! Secret store adapter
//!
//! A thin Vault KV v2 client holding one process-scoped session token. Reads
//! go under a fixed tenant prefix. On any read failure the adapter
//! re-authenticates exactly once and retries the read exactly once; a second
//! failure is surfaced. Empty documents are reported as not-found rather than
//! empty success.
//!
//! Two authentication modes exist and never mix: a pre-issued static token
//! used verbatim when local mode is on, or a workload-identity JWT exchanged
//! at `auth/<method>/login` with a configured role.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::identity::CredentialBag;

/// All secret reads live under this tenant prefix.
pub const SECRET_PATH_PREFIX: &str = "devops/data/stratus-dev/";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Secret store errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// A read was attempted with an empty path
    #[error("secret path required")]
    EmptyPath,

    /// The secret does not exist (or exists but holds no data)
    #[error("secret not found: {0}")]
    NotFound(String),

    /// Login failed or no session token is available
    #[error("secret store authentication failed: {0}")]
    Auth(String),

    /// The store was unreachable or returned an unexpected response
    #[error("secret store transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for VaultError {
    fn from(e: reqwest::Error) -> Self {
        VaultError::Transport(e.to_string())
    }
}

/// Configuration for the secret store connection
#[derive(Debug, Clone, Default)]
pub struct VaultConfig {
    /// Base URL of the secret store (e.g. `https://vault.internal:8200`)
    pub addr: String,
    /// Role presented at workload login
    pub role: String,
    /// Auth mount name; login happens at `auth/<method>/login`
    pub auth_method: String,
    /// Pre-issued token, honored only when `local` is set
    pub static_token: Option<String>,
    /// Local mode: skip login and use the static token verbatim
    pub local: bool,
    /// Filesystem path of the workload-identity JWT
    pub kube_token_path: Option<PathBuf>,
}

/// Process-scoped secret store client
///
/// Created once at startup and shared behind an `Arc`. The session token is
/// the only mutable state; concurrent re-logins are tolerated (last writer
/// wins) but never required for correctness.
pub struct VaultClient {
    http: reqwest::Client,
    config: VaultConfig,
    workload_jwt: Option<String>,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

impl VaultClient {
    /// Connect to the secret store and obtain an initial session token
    ///
    /// Reads the workload JWT from disk when configured. Bootstrap failure is
    /// surfaced to the caller, which treats it as fatal.
    pub async fn connect(config: VaultConfig) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VaultError::Transport(format!("http client: {e}")))?;

        let workload_jwt = match &config.kube_token_path {
            Some(path) => {
                let jwt = std::fs::read_to_string(path).map_err(|e| {
                    VaultError::Auth(format!("reading workload token {}: {e}", path.display()))
                })?;
                Some(jwt.trim().to_string())
            }
            None => None,
        };

        let client = Self {
            http,
            config,
            workload_jwt,
            token: RwLock::new(None),
        };
        client.refresh_token().await?;
        info!(addr = %client.config.addr, "secret store session established");
        Ok(client)
    }

    /// Read the KV secret stored at `path` (joined under the tenant prefix)
    ///
    /// On a failed read the adapter re-authenticates once and retries once,
    /// so an expired session token heals transparently.
    pub async fn get_kv(&self, path: &str) -> Result<CredentialBag, VaultError> {
        if path.is_empty() {
            return Err(VaultError::EmptyPath);
        }
        match self.read_kv(path).await {
            Ok(data) => Ok(data),
            Err(first) => {
                warn!(path = %path, error = %first, "secret read failed, re-authenticating once");
                self.refresh_token().await?;
                self.read_kv(path).await
            }
        }
    }

    /// Acquire a session token per the configured authentication mode
    ///
    /// Local mode uses the static token verbatim and never logs in; workload
    /// mode always logs in and never falls back to the static token. A failed
    /// login leaves the stored token untouched.
    async fn refresh_token(&self) -> Result<(), VaultError> {
        if self.config.local {
            if let Some(token) = self
                .config
                .static_token
                .as_ref()
                .filter(|t| !t.is_empty())
            {
                debug!("using pre-issued local token");
                *self.token.write() = Some(token.clone());
                return Ok(());
            }
        }
        self.login().await
    }

    async fn login(&self) -> Result<(), VaultError> {
        let url = format!(
            "{}/v1/auth/{}/login",
            self.config.addr.trim_end_matches('/'),
            self.config.auth_method
        );
        let jwt = self
            .workload_jwt
            .as_deref()
            .ok_or_else(|| VaultError::Auth("no workload token configured".to_string()))?;

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "role": self.config.role, "jwt": jwt }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VaultError::Auth(format!(
                "login via {} returned {}",
                self.config.auth_method,
                response.status()
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| VaultError::Auth(format!("login response: {e}")))?;

        *self.token.write() = Some(login.auth.client_token);
        debug!(method = %self.config.auth_method, "secret store login succeeded");
        Ok(())
    }

    async fn read_kv(&self, path: &str) -> Result<CredentialBag, VaultError> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| VaultError::Auth("no session token".to_string()))?;

        let url = format!(
            "{}/v1/{}",
            self.config.addr.trim_end_matches('/'),
            kv_path(path)
        );
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(VaultError::NotFound(path.to_string()));
            }
            status => {
                return Err(VaultError::Transport(format!(
                    "read of {path} returned {status}"
                )));
            }
        }

        let envelope: serde_json::Value = response.json().await?;
        extract_kv_data(envelope, path)
    }
}

/// Join a caller path under the tenant prefix
fn kv_path(path: &str) -> String {
    format!("{SECRET_PATH_PREFIX}{path}")
}

/// Pull the inner `.data.data` object out of a KV v2 read envelope
///
/// A missing, null, or empty document is not-found, never empty success.
fn extract_kv_data(envelope: serde_json::Value, path: &str) -> Result<CredentialBag, VaultError> {
    match envelope.get("data").and_then(|d| d.get("data")) {
        Some(serde_json::Value::Object(map)) if !map.is_empty() => Ok(map.clone()),
        _ => Err(VaultError::NotFound(path.to_string())),
    }
}
