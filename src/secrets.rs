use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HandlerError;
use crate::gcp::{error_for_status, AccessTokenSource};

const SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com";
const SECRET_MANAGER_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub App bundle stored as JSON in Secret Manager.
#[derive(Clone, Deserialize)]
pub struct AppSecrets {
    #[serde(deserialize_with = "string_or_number")]
    pub app_id: String,
    pub app_private_key: String,
    #[serde(default)]
    pub webhook_secret: String,
}

impl fmt::Debug for AppSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSecrets")
            .field("app_id", &self.app_id)
            .field("app_private_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .finish()
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(u64),
    }
    Ok(match Id::deserialize(d)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

/// Read access to the latest version of a named secret.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn latest_version(&self, project: &str, secret_id: &str) -> Result<Vec<u8>, HandlerError>;
}

pub async fn load_app_secrets(
    store: &dyn SecretStore,
    project: &str,
    secret_id: &str,
) -> Result<AppSecrets, HandlerError> {
    let data = store.latest_version(project, secret_id).await?;
    serde_json::from_slice(&data)
        .map_err(|e| HandlerError::Secret(format!("secret {secret_id} is not a valid bundle: {e}")))
}

/// Secret Manager REST client.
pub struct SecretManagerStore {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

impl SecretManagerStore {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self::with_base_url(http, tokens, SECRET_MANAGER_URL)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: SECRET_MANAGER_TIMEOUT,
        }
    }
}

#[async_trait]
impl SecretStore for SecretManagerStore {
    async fn latest_version(
        &self,
        project: &str,
        secret_id: &str,
    ) -> Result<Vec<u8>, HandlerError> {
        const CALL: &str = "access secret version";

        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| HandlerError::Secret(e.to_string()))?;

        let url = format!(
            "{}/v1/projects/{project}/secrets/{secret_id}/versions/latest:access",
            self.base_url
        );
        let res = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| HandlerError::Secret(format!("{CALL} request failed: {e}")))?;
        let res = error_for_status(CALL, res)
            .await
            .map_err(|e| HandlerError::Secret(e.to_string()))?;

        let body: AccessSecretVersionResponse = res
            .json()
            .await
            .map_err(|e| HandlerError::Secret(format!("{CALL} response: {e}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(body.payload.data)
            .map_err(|e| HandlerError::Secret(format!("{CALL} payload is not base64: {e}")))
    }
}
