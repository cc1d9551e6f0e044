use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ProvisioningError;

const METADATA_HOST: &str = "metadata.google.internal";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of OAuth bearer tokens for Google APIs.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ProvisioningError>;
}

/// Tokens for the attached service account, from the metadata server.
///
/// Honors `GCE_METADATA_HOST` the same way the Google client libraries do.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    token_url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

impl MetadataTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        let host = std::env::var("GCE_METADATA_HOST").unwrap_or_else(|_| METADATA_HOST.into());
        Self::with_base_url(http, format!("http://{host}"))
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: format!("{}{TOKEN_PATH}", base_url.into().trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl AccessTokenSource for MetadataTokenSource {
    async fn access_token(&self) -> Result<String, ProvisioningError> {
        const CALL: &str = "metadata token";

        let res = self
            .http
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;

        let res = error_for_status(CALL, res).await?;
        let body: TokenResponse = res
            .json()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;
        body.access_token.ok_or(ProvisioningError::MissingField {
            call: CALL,
            field: "access_token",
        })
    }
}

/// Turn a non-2xx response into `ProvisioningError::Status`, keeping the body
/// for the log line.
pub async fn error_for_status(
    call: &'static str,
    res: reqwest::Response,
) -> Result<reqwest::Response, ProvisioningError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    Err(ProvisioningError::Status {
        call,
        status: status.as_u16(),
        body,
    })
}
