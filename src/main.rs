mod compute;
mod config;
mod credentials;
mod error;
mod event;
mod gcp;
mod handler;
mod http_server;
mod logging;
mod orchestrator;
mod secrets;
mod templates;
mod verification;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use compute::ComputeEngineProvisioner;
use config::Config;
use credentials::GitHubRegistrar;
use gcp::MetadataTokenSource;
use handler::AppState;
use secrets::SecretManagerStore;

/// Every call also sets its own overall timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").ok();
    logging::init(log_level.as_deref(), std::env::var_os("K_SERVICE").is_some());

    let config = Config::from_env().context("loading configuration")?;
    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("building HTTP client")?;

    let tokens = Arc::new(MetadataTokenSource::new(http.clone()));
    let state = Arc::new(AppState {
        secrets: Arc::new(SecretManagerStore::new(http.clone(), tokens.clone())),
        registrar: Arc::new(GitHubRegistrar::new(http.clone())),
        provisioner: Arc::new(ComputeEngineProvisioner::new(
            http,
            tokens,
            config.project.clone(),
        )),
        config,
    });

    info!(
        project = %state.config.project,
        templates = state.config.instance_templates.len(),
        "runner provisioner starting"
    );
    let port = state.config.port;
    http_server::serve(state, port)
        .await
        .context("HTTP server failed")
}
