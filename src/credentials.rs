//! GitHub App credential chain: app assertion → installation token → JIT config.
//!
//! Every step is a single attempt. A failure surfaces as [`ProvisioningError`]
//! and the orchestrator moves on to the next template.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ProvisioningError;
use crate::event::RegistrationTarget;
use crate::gcp::error_for_status;
use crate::secrets::AppSecrets;

pub const GITHUB_API_TIMEOUT: Duration = Duration::from_secs(30);
/// Backdates `iat` to tolerate clock drift against GitHub.
const CLOCK_SKEW_SECS: i64 = 60;
const ASSERTION_TTL_SECS: i64 = 60;
const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("gce-runner-provisioner/", env!("CARGO_PKG_VERSION"));

/// Encoded just-in-time runner configuration. Single use, never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct JitConfig(String);

impl JitConfig {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JitConfig(<redacted>)")
    }
}

/// What a runner registers as.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerRegistration<'a> {
    pub labels: &'a [String],
    pub name: &'a str,
    pub runner_group_id: u64,
}

/// Issues job-scoped runner credentials.
#[async_trait]
pub trait RunnerRegistrar: Send + Sync {
    async fn issue_jit_config(
        &self,
        app: &AppSecrets,
        target: &RegistrationTarget,
        registration: &RunnerRegistration<'_>,
    ) -> Result<JitConfig, ProvisioningError>;
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

/// RS256 JWT identifying the GitHub App, valid for one minute.
pub fn app_assertion(
    app_id: &str,
    private_key_pem: &str,
    now: i64,
) -> Result<String, ProvisioningError> {
    let claims = AssertionClaims {
        iat: now - CLOCK_SKEW_SECS,
        exp: now + ASSERTION_TTL_SECS,
        iss: app_id,
    };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| ProvisioningError::Assertion(e.to_string()))?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| ProvisioningError::Assertion(e.to_string()))
}

/// Registrar backed by the GitHub REST API.
pub struct GitHubRegistrar {
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct JitConfigResponse {
    encoded_jit_config: Option<String>,
}

impl GitHubRegistrar {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn post(&self, url: String, bearer: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .header("User-Agent", USER_AGENT)
            .bearer_auth(bearer)
            .timeout(GITHUB_API_TIMEOUT)
    }

    async fn installation_token(
        &self,
        assertion: &str,
        target: &RegistrationTarget,
    ) -> Result<String, ProvisioningError> {
        const CALL: &str = "installation token";

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            target.api_base_url, target.installation_id
        );
        let res = self
            .post(url, assertion)
            .send()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;
        let body: InstallationTokenResponse = error_for_status(CALL, res)
            .await?
            .json()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;
        body.token.ok_or(ProvisioningError::MissingField {
            call: CALL,
            field: "token",
        })
    }
}

#[async_trait]
impl RunnerRegistrar for GitHubRegistrar {
    async fn issue_jit_config(
        &self,
        app: &AppSecrets,
        target: &RegistrationTarget,
        registration: &RunnerRegistration<'_>,
    ) -> Result<JitConfig, ProvisioningError> {
        const CALL: &str = "generate jitconfig";

        let assertion = app_assertion(&app.app_id, &app.app_private_key, Utc::now().timestamp())?;
        let installation_token = self.installation_token(&assertion, target).await?;

        let url = format!("{}/actions/runners/generate-jitconfig", target.resource_url);
        let res = self
            .post(url, &installation_token)
            .json(registration)
            .send()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;
        let body: JitConfigResponse = error_for_status(CALL, res)
            .await?
            .json()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;

        body.encoded_jit_config
            .map(JitConfig::new)
            .ok_or(ProvisioningError::MissingField {
                call: CALL,
                field: "encoded_jit_config",
            })
    }
}
