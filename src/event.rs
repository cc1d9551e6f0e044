use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::templates::required_labels;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// A delivery after authentication, reduced to what the handler acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    WorkflowJobQueued(JobRequest),
    Ignored {
        event: String,
        action: Option<String>,
    },
}

/// A queued job that wants a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: u64,
    /// Required labels, `self-hosted` already removed.
    pub labels: BTreeSet<String>,
    pub installation_id: Option<u64>,
    pub repository_url: Option<String>,
    pub organization_url: Option<String>,
}

/// Where runners are registered: a single repository or a whole organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerScope {
    Repository,
    Organization,
}

impl RunnerScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Organization => "organization",
        }
    }
}

impl FromStr for RunnerScope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(Self::Repository),
            "organization" => Ok(Self::Organization),
            other => Err(ValidationError::InvalidScope(other.to_string())),
        }
    }
}

impl fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the credential exchange needs from the payload, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTarget {
    pub installation_id: u64,
    /// API url of the repository or organization, e.g. `https://api.github.com/repos/o/r`.
    pub resource_url: String,
    /// `scheme://host` of `resource_url`.
    pub api_base_url: String,
}

impl JobRequest {
    pub fn registration_target(
        &self,
        scope: RunnerScope,
    ) -> Result<RegistrationTarget, ValidationError> {
        let installation_id = self
            .installation_id
            .filter(|id| *id != 0)
            .ok_or(ValidationError::MissingInstallation)?;

        let resource_url = match scope {
            RunnerScope::Repository => self.repository_url.as_deref(),
            RunnerScope::Organization => self.organization_url.as_deref(),
        }
        .filter(|url| !url.is_empty())
        .ok_or(ValidationError::MissingResourceUrl {
            scope: scope.as_str(),
        })?
        .trim_end_matches('/')
        .to_string();

        let api_base_url = api_base_url(&resource_url)
            .ok_or_else(|| ValidationError::InvalidResourceUrl(resource_url.clone()))?;

        Ok(RegistrationTarget {
            installation_id,
            resource_url,
            api_base_url,
        })
    }
}

/// `scheme://host[:port]` of an absolute URL. Path, query and fragment are dropped.
fn api_base_url(resource_url: &str) -> Option<String> {
    let url = Url::parse(resource_url).ok()?;
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

// ─── Payload wire types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ActionOnly {
    action: Option<String>,
}

#[derive(Deserialize)]
struct WorkflowJobPayload {
    workflow_job: WorkflowJob,
    installation: Option<IdField>,
    repository: Option<UrlField>,
    organization: Option<UrlField>,
}

#[derive(Deserialize)]
struct WorkflowJob {
    id: u64,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct IdField {
    id: Option<u64>,
}

#[derive(Deserialize)]
struct UrlField {
    url: Option<String>,
}

impl WebhookEvent {
    /// Classify a delivery. Call only after the signature has been verified.
    ///
    /// The body is only parsed for `workflow_job` deliveries.
    pub fn parse(event: Option<&str>, body: &[u8]) -> Result<Self, ValidationError> {
        let event = match event {
            Some("ping") => return Ok(Self::Ping),
            Some("workflow_job") => "workflow_job",
            other => {
                return Ok(Self::Ignored {
                    event: other.unwrap_or_default().to_string(),
                    action: None,
                })
            }
        };

        let ActionOnly { action } = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        if action.as_deref() != Some("queued") {
            return Ok(Self::Ignored {
                event: event.to_string(),
                action,
            });
        }

        let payload: WorkflowJobPayload = serde_json::from_slice(body)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;

        Ok(Self::WorkflowJobQueued(JobRequest {
            job_id: payload.workflow_job.id,
            labels: required_labels(payload.workflow_job.labels),
            installation_id: payload.installation.and_then(|i| i.id),
            repository_url: payload.repository.and_then(|r| r.url),
            organization_url: payload.organization.and_then(|o| o.url),
        }))
    }
}
