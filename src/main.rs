//! Causeway broker daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use causeway::policy::{self, git::RemoteRepo, LoaderConfig, MappingStore, Refresher};
use causeway::provider::ProviderRegistry;
use causeway::server::{self, AppState};
use causeway::vault::{VaultClient, VaultConfig};

/// Causeway - cross-cloud identity broker
#[derive(Parser, Debug)]
#[command(name = "causeway", version, about, long_about = None)]
struct Cli {
    /// TCP port to serve on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Comma-separated roots walked recursively for policy files
    #[arg(long, env = "CONFIG_PATHS", value_delimiter = ',')]
    config_paths: Vec<PathBuf>,

    /// URL of the remote policy repository (optional)
    #[arg(long, env = "REMOTE_CONFIG_REPO")]
    remote_config_repo: Option<String>,

    /// Local working directory for the remote repository
    #[arg(long, env = "GIT_CLONE_DIR", default_value = "/tmp/causeway-policy")]
    git_clone_dir: PathBuf,

    /// Branch or reference of the remote repository to track
    #[arg(long, env = "REMOTE_GIT_REF", default_value = "refs/heads/main")]
    remote_git_ref: String,

    /// Credential for the remote repository
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Interval between policy refreshes
    #[arg(long, env = "CONFIG_REFRESH_INTERVAL", value_parser = humantime::parse_duration, default_value = "60s")]
    config_refresh_interval: Duration,

    /// Secret store base URL
    #[arg(long, env = "VAULT_ADDR")]
    vault_addr: String,

    /// Role presented at secret store login
    #[arg(long, env = "VAULT_ROLE", default_value = "")]
    vault_role: String,

    /// Secret store auth mount; login happens at auth/<method>/login
    #[arg(long, env = "VAULT_AUTH_METHOD", default_value = "kubernetes")]
    vault_auth_method: String,

    /// Pre-issued secret store token, honored only in local mode
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,

    /// Local mode: any non-empty value skips secret store login
    #[arg(long, env = "LOCAL")]
    local: Option<String>,

    /// Path to the workload JWT used for secret store login
    #[arg(long, env = "KUBE_TOKEN")]
    kube_token: Option<PathBuf>,
}

impl Cli {
    fn vault_config(&self) -> VaultConfig {
        VaultConfig {
            addr: self.vault_addr.clone(),
            role: self.vault_role.clone(),
            auth_method: self.vault_auth_method.clone(),
            static_token: self.vault_token.clone(),
            local: self.local.as_deref().is_some_and(|v| !v.is_empty()),
            kube_token_path: self.kube_token.clone(),
        }
    }

    fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            config_paths: self.config_paths.clone(),
            remote: self.remote_config_repo.as_ref().map(|url| RemoteRepo {
                url: url.clone(),
                clone_dir: self.git_clone_dir.clone(),
                reference: self.remote_git_ref.clone(),
                token: self.github_token.clone(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Secret store bootstrap is fatal: every k8s/gcp request needs it.
    let vault = Arc::new(
        VaultClient::connect(cli.vault_config())
            .await
            .context("secret store bootstrap failed")?,
    );

    // First policy load happens before the listener binds, so a broken grant
    // set can never serve requests.
    let loader_config = cli.loader_config();
    let store = Arc::new(MappingStore::new());
    let initial = policy::load_async(loader_config.clone())
        .await
        .context("initial policy load failed")?;
    info!(count = initial.len(), "initial policy snapshot loaded");
    store.publish(initial);

    let refresher = Refresher::new(store.clone(), loader_config, cli.config_refresh_interval);
    refresher.start(CancellationToken::new());

    let state = AppState {
        mappings: store,
        providers: Arc::new(ProviderRegistry::standard(vault)),
    };

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("binding port {}", cli.port))?;
    info!(port = cli.port, "causeway listening");

    axum::serve(listener, server::router(state))
        .await
        .context("http server failed")?;

    Ok(())
}
