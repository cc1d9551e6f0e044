use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::credentials::JitConfig;
use crate::error::ProvisioningError;
use crate::gcp::{error_for_status, AccessTokenSource};

const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";
pub const JIT_CONFIG_KEY: &str = "encoded_jit_config";
pub const RUNNER_VERSION_KEY: &str = "runner_version";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// The wait endpoint holds the request open for up to two minutes.
const WAIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(150);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// One VM to create from an instance template.
#[derive(Debug, Clone)]
pub struct InstanceRequest<'a> {
    pub name: &'a str,
    pub template_name: &'a str,
    pub jit_config: &'a JitConfig,
    pub runner_version: &'a str,
}

/// Creates runner VMs. Returns once the instance exists or the attempt failed.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    async fn create_instance(
        &self,
        request: &InstanceRequest<'_>,
        zone: &str,
    ) -> Result<(), ProvisioningError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Template metadata plus the runner entries. Runner entries replace any
/// template item with the same key.
pub fn merge_metadata(
    template_items: Vec<MetadataItem>,
    jit_config: &JitConfig,
    runner_version: &str,
) -> Vec<MetadataItem> {
    let mut items: Vec<MetadataItem> = template_items
        .into_iter()
        .filter(|item| item.key != JIT_CONFIG_KEY && item.key != RUNNER_VERSION_KEY)
        .collect();
    items.push(MetadataItem {
        key: JIT_CONFIG_KEY.into(),
        value: jit_config.expose().into(),
    });
    items.push(MetadataItem {
        key: RUNNER_VERSION_KEY.into(),
        value: runner_version.into(),
    });
    items
}

/// Idempotency key for one (instance, template, zone) insert, stable across
/// redeliveries. Two templates that share a zone get distinct keys so the
/// provider does not replay the first template's operation for the second.
pub fn request_id(instance_name: &str, template_name: &str, zone: &str) -> Uuid {
    let key = format!("{instance_name}/{template_name}/{zone}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

// ─── Compute Engine wire types ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceTemplate {
    self_link: String,
    #[serde(default)]
    properties: TemplateProperties,
}

#[derive(Default, Deserialize)]
struct TemplateProperties {
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Serialize)]
struct InstanceResource<'a> {
    name: &'a str,
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn check(&self, instance_name: &str) -> Result<(), ProvisioningError> {
        let Some(error) = &self.error else {
            return Ok(());
        };
        if error
            .errors
            .iter()
            .any(|e| e.code == "RESOURCE_ALREADY_EXISTS" || e.code == "alreadyExists")
        {
            return Err(ProvisioningError::AlreadyExists(instance_name.to_string()));
        }
        let message = error
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ProvisioningError::Operation {
            operation: self.name.clone(),
            message,
        })
    }
}

/// Compute Engine REST client.
pub struct ComputeEngineProvisioner {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    project: String,
    base_url: String,
    operation_timeout: Duration,
}

impl ComputeEngineProvisioner {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        project: impl Into<String>,
    ) -> Self {
        Self::with_base_url(http, tokens, project, COMPUTE_URL)
    }

    pub fn with_base_url(
        http: reqwest::Client,
        tokens: Arc<dyn AccessTokenSource>,
        project: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            project: project.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            operation_timeout: OPERATION_TIMEOUT,
        }
    }

    async fn get_template(
        &self,
        token: &str,
        template_name: &str,
    ) -> Result<InstanceTemplate, ProvisioningError> {
        const CALL: &str = "get instance template";

        let url = format!(
            "{}/projects/{}/global/instanceTemplates/{template_name}",
            self.base_url, self.project
        );
        let res = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;
        error_for_status(CALL, res)
            .await?
            .json()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))
    }

    async fn insert(
        &self,
        token: &str,
        zone: &str,
        source_template: &str,
        resource: &InstanceResource<'_>,
        request_id: Uuid,
    ) -> Result<Operation, ProvisioningError> {
        const CALL: &str = "insert instance";

        let url = format!(
            "{}/projects/{}/zones/{zone}/instances",
            self.base_url, self.project
        );
        let request_id = request_id.to_string();
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .query(&[
                ("sourceInstanceTemplate", source_template),
                ("requestId", request_id.as_str()),
            ])
            .json(resource)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))?;

        if res.status() == reqwest::StatusCode::CONFLICT {
            return Err(ProvisioningError::AlreadyExists(resource.name.to_string()));
        }
        error_for_status(CALL, res)
            .await?
            .json()
            .await
            .map_err(|e| ProvisioningError::transport(CALL, e))
    }

    async fn wait(
        &self,
        token: &str,
        zone: &str,
        mut operation: Operation,
    ) -> Result<Operation, ProvisioningError> {
        const CALL: &str = "wait operation";

        let url = format!(
            "{}/projects/{}/zones/{zone}/operations/{}/wait",
            self.base_url, self.project, operation.name
        );
        let name = operation.name.clone();
        let poll = async {
            while operation.status != "DONE" {
                let res = self
                    .http
                    .post(&url)
                    .bearer_auth(token)
                    .timeout(WAIT_REQUEST_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| ProvisioningError::transport(CALL, e))?;
                operation = error_for_status(CALL, res)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ProvisioningError::transport(CALL, e))?;
            }
            Ok::<_, ProvisioningError>(operation)
        };

        tokio::time::timeout(self.operation_timeout, poll)
            .await
            .map_err(|_| ProvisioningError::OperationTimeout {
                operation: name,
                seconds: self.operation_timeout.as_secs(),
            })?
    }
}

#[async_trait]
impl InstanceProvisioner for ComputeEngineProvisioner {
    async fn create_instance(
        &self,
        request: &InstanceRequest<'_>,
        zone: &str,
    ) -> Result<(), ProvisioningError> {
        let token = self.tokens.access_token().await?;

        let template = self.get_template(&token, request.template_name).await?;
        let items = template
            .properties
            .metadata
            .map(|m| m.items)
            .unwrap_or_default();
        let resource = InstanceResource {
            name: request.name,
            metadata: Metadata {
                items: merge_metadata(items, request.jit_config, request.runner_version),
            },
        };

        let request_id = request_id(request.name, request.template_name, zone);
        let operation = self
            .insert(&token, zone, &template.self_link, &resource, request_id)
            .await?;
        operation.check(request.name)?;
        let operation = self.wait(&token, zone, operation).await?;
        operation.check(request.name)
    }
}
