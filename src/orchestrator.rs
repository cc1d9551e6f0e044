//! Ordered template/zone fallback for one queued job.
//!
//! Each matching template gets exactly one credential exchange. The credential
//! is then offered to the template's zones in order until one placement
//! succeeds. Every attempt is recorded so callers and tests can see the path
//! taken without relying on logs.

use tracing::{error, info, warn};

use crate::compute::{InstanceProvisioner, InstanceRequest};
use crate::credentials::{RunnerRegistrar, RunnerRegistration};
use crate::event::RegistrationTarget;
use crate::secrets::AppSecrets;
use crate::templates::RunnerTemplate;

/// Inputs shared by every attempt for one job.
pub struct ProvisionJob<'a> {
    pub app: &'a AppSecrets,
    pub target: &'a RegistrationTarget,
    pub instance_name: &'a str,
    pub runner_version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    CredentialIssued,
    CredentialFailed(String),
    Placed,
    AlreadyExists,
    PlacementFailed(String),
}

/// One step of the attempt sequence. `zone` is `None` for credential requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub template: String,
    pub zone: Option<String>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned { template: String, zone: String },
    /// A VM with this name already exists, typically from a redelivered event.
    AlreadyExists { template: String, zone: String },
    /// Every template and zone failed.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub outcome: ProvisionOutcome,
    pub attempts: Vec<AttemptRecord>,
}

impl ProvisionReport {
    pub fn credential_requests(&self) -> usize {
        self.attempts.iter().filter(|a| a.zone.is_none()).count()
    }

    pub fn placements(&self) -> usize {
        self.attempts.iter().filter(|a| a.zone.is_some()).count()
    }
}

/// One template and the zones it may be placed in, in trial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateAttempt<'a> {
    pub template: &'a RunnerTemplate,
    pub zones: &'a [String],
}

/// The attempt sequence for a job: matching templates in configuration order,
/// each with its configured zones.
pub fn attempt_plan<'a>(templates: &[&'a RunnerTemplate]) -> Vec<TemplateAttempt<'a>> {
    templates
        .iter()
        .map(|&template| TemplateAttempt {
            template,
            zones: &template.zones,
        })
        .collect()
}

pub struct Orchestrator<'a> {
    registrar: &'a dyn RunnerRegistrar,
    provisioner: &'a dyn InstanceProvisioner,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        registrar: &'a dyn RunnerRegistrar,
        provisioner: &'a dyn InstanceProvisioner,
    ) -> Self {
        Self {
            registrar,
            provisioner,
        }
    }

    /// Walk the attempt plan for `templates`. Never fails: exhaustion is
    /// reported in the outcome and logged once at error level.
    pub async fn run(
        &self,
        job: &ProvisionJob<'_>,
        templates: &[&RunnerTemplate],
    ) -> ProvisionReport {
        let plan = attempt_plan(templates);
        let mut attempts = Vec::new();

        for (index, TemplateAttempt { template, zones }) in plan.iter().enumerate() {
            let has_next = index + 1 < plan.len();
            let name = template.template_name.as_str();
            let registration = RunnerRegistration {
                labels: &template.labels,
                name: job.instance_name,
                runner_group_id: template.group_id,
            };

            let jit_config = match self
                .registrar
                .issue_jit_config(job.app, job.target, &registration)
                .await
            {
                Ok(jit) => {
                    attempts.push(record(name, None, AttemptOutcome::CredentialIssued));
                    jit
                }
                Err(e) => {
                    warn!(template = name, error = %e, "failed to obtain runner credential");
                    let outcome = AttemptOutcome::CredentialFailed(e.to_string());
                    attempts.push(record(name, None, outcome));
                    continue;
                }
            };

            let request = InstanceRequest {
                name: job.instance_name,
                template_name: name,
                jit_config: &jit_config,
                runner_version: job.runner_version,
            };
            info!(instance = job.instance_name, template = name, "creating VM");

            for zone in zones.iter() {
                match self.provisioner.create_instance(&request, zone).await {
                    Ok(()) => {
                        info!(
                            instance = job.instance_name,
                            template = name,
                            zone = %zone,
                            "VM created"
                        );
                        attempts.push(record(name, Some(zone), AttemptOutcome::Placed));
                        return ProvisionReport {
                            outcome: ProvisionOutcome::Provisioned {
                                template: name.to_string(),
                                zone: zone.clone(),
                            },
                            attempts,
                        };
                    }
                    Err(e) if e.is_already_exists() => {
                        info!(
                            instance = job.instance_name,
                            template = name,
                            zone = %zone,
                            "VM already exists, treating delivery as a duplicate"
                        );
                        attempts.push(record(name, Some(zone), AttemptOutcome::AlreadyExists));
                        return ProvisionReport {
                            outcome: ProvisionOutcome::AlreadyExists {
                                template: name.to_string(),
                                zone: zone.clone(),
                            },
                            attempts,
                        };
                    }
                    Err(e) => {
                        warn!(
                            template = name,
                            zone = %zone,
                            error = %e,
                            "failed to create VM in zone"
                        );
                        attempts.push(record(
                            name,
                            Some(zone),
                            AttemptOutcome::PlacementFailed(e.to_string()),
                        ));
                    }
                }
            }
            if has_next {
                warn!(template = name, "all zones failed, trying next template");
            }
        }

        error!(
            instance = job.instance_name,
            attempts = attempts.len(),
            "failed to create VM from any matching template"
        );
        ProvisionReport {
            outcome: ProvisionOutcome::Exhausted,
            attempts,
        }
    }
}

fn record(template: &str, zone: Option<&String>, outcome: AttemptOutcome) -> AttemptRecord {
    AttemptRecord {
        template: template.to_string(),
        zone: zone.cloned(),
        outcome,
    }
}
