use axum::body::Bytes;
use axum::http::HeaderMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::compute::InstanceProvisioner;
use crate::config::Config;
use crate::credentials::RunnerRegistrar;
use crate::error::HandlerError;
use crate::event::{RunnerScope, WebhookEvent, EVENT_HEADER, SIGNATURE_HEADER};
use crate::orchestrator::{Orchestrator, ProvisionJob, ProvisionOutcome, ProvisionReport};
use crate::secrets::{load_app_secrets, SecretStore};
use crate::templates::{select_templates, RunnerTemplate};
use crate::verification::verify_signature;

/// Process-wide collaborators. Nothing in here is mutated by a delivery.
pub struct AppState {
    pub config: Config,
    pub secrets: Arc<dyn SecretStore>,
    pub registrar: Arc<dyn RunnerRegistrar>,
    pub provisioner: Arc<dyn InstanceProvisioner>,
}

/// What happened to an accepted delivery. Every variant answers `OK`.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Ping,
    Ignored,
    Provisioning(ProvisionReport),
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authenticate, classify, and act on one webhook delivery.
pub async fn handle_delivery(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<DeliveryOutcome, HandlerError> {
    let config = &state.config;
    let app =
        load_app_secrets(state.secrets.as_ref(), &config.project, &config.config_secret_id).await?;

    verify_signature(&app.webhook_secret, &body, header(headers, SIGNATURE_HEADER))?;

    let job = match WebhookEvent::parse(header(headers, EVENT_HEADER), &body)? {
        WebhookEvent::Ping => {
            info!("received ping event");
            return Ok(DeliveryOutcome::Ping);
        }
        WebhookEvent::Ignored { event, action } => {
            info!(event = %event, action = ?action, "ignoring event");
            return Ok(DeliveryOutcome::Ignored);
        }
        WebhookEvent::WorkflowJobQueued(job) => job,
    };
    debug!(payload = %String::from_utf8_lossy(&body), "webhook event payload");
    info!(job_id = job.job_id, labels = ?job.labels, "job queued");

    let scope: RunnerScope = config.runner_scope.parse()?;
    let target = job.registration_target(scope)?;
    let templates: Vec<RunnerTemplate> = select_templates(&job.labels, &config.instance_templates)?
        .into_iter()
        .cloned()
        .collect();
    let instance_name = config.instance_name(job.job_id);

    // Provisioning runs to completion even if the caller hangs up.
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        let job = ProvisionJob {
            app: &app,
            target: &target,
            instance_name: &instance_name,
            runner_version: &task_state.config.runner_version,
        };
        let refs: Vec<&RunnerTemplate> = templates.iter().collect();
        Orchestrator::new(task_state.registrar.as_ref(), task_state.provisioner.as_ref())
            .run(&job, &refs)
            .await
    });

    let report = match task.await {
        Ok(report) => report,
        Err(e) => {
            error!(job_id = job.job_id, error = %e, "provisioning task aborted");
            ProvisionReport {
                outcome: ProvisionOutcome::Exhausted,
                attempts: Vec::new(),
            }
        }
    };
    for attempt in &report.attempts {
        debug!(
            template = %attempt.template,
            zone = ?attempt.zone,
            outcome = ?attempt.outcome,
            "provisioning attempt"
        );
    }
    info!(
        job_id = job.job_id,
        outcome = ?report.outcome,
        credential_requests = report.credential_requests(),
        placements = report.placements(),
        "provisioning finished"
    );
    Ok(DeliveryOutcome::Provisioning(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthenticationError, ValidationError};
    use crate::orchestrator::testing::{
        LevelCounter, ScriptedProvisioner, ScriptedRegistrar, ZoneScript,
    };
    use crate::verification::sign;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::Level;

    const WEBHOOK_SECRET: &str = "hush";

    #[derive(Default)]
    struct MemorySecrets {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for MemorySecrets {
        async fn latest_version(
            &self,
            project: &str,
            secret_id: &str,
        ) -> Result<Vec<u8>, HandlerError> {
            assert_eq!((project, secret_id), ("ci", "gh-app"));
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::to_vec(&json!({
                "app_id": "1",
                "app_private_key": "unused",
                "webhook_secret": WEBHOOK_SECRET
            }))
            .unwrap())
        }
    }

    struct Harness {
        state: Arc<AppState>,
        registrar: Arc<ScriptedRegistrar>,
        provisioner: Arc<ScriptedProvisioner>,
    }

    fn harness(scope: &str, provisioner: ScriptedProvisioner) -> Harness {
        let vars: HashMap<String, String> = [
            ("CONFIG_SECRET_ID", "gh-app".to_string()),
            ("INSTANCE_NAME_PREFIX", "runner".to_string()),
            (
                "INSTANCE_TEMPLATES",
                json!([{
                    "labels": ["linux", "x64"],
                    "group_id": 1,
                    "zones": ["z1", "z2"],
                    "template_name": "t1"
                }])
                .to_string(),
            ),
            ("PROJECT", "ci".to_string()),
            ("RUNNER_SCOPE", scope.to_string()),
            ("RUNNER_VERSION", "2.321.0".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let registrar = Arc::new(ScriptedRegistrar::default());
        let provisioner = Arc::new(provisioner);
        let state = Arc::new(AppState {
            config: Config::from_vars(&vars).unwrap(),
            secrets: Arc::new(MemorySecrets::default()),
            registrar: registrar.clone(),
            provisioner: provisioner.clone(),
        });
        Harness {
            state,
            registrar,
            provisioner,
        }
    }

    fn queued(labels: &[&str]) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&json!({
                "action": "queued",
                "workflow_job": { "id": 987, "labels": labels },
                "installation": { "id": 55 },
                "repository": { "url": "https://api.github.com/repos/acme/widgets" }
            }))
            .unwrap(),
        )
    }

    fn signed(event: &str, body: &Bytes) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign(WEBHOOK_SECRET, body)).unwrap(),
        );
        headers
    }

    impl Harness {
        fn exchanges(&self) -> usize {
            self.registrar.calls.lock().unwrap().len()
        }
    }

    #[tokio::test]
    async fn ping_makes_no_provisioning_calls() {
        let h = harness("repository", ScriptedProvisioner::default());
        let body = Bytes::from_static(b"{\"zen\":\"Keep it logically awesome.\"}");

        let outcome = handle_delivery(h.state.clone(), &signed("ping", &body), body).await.unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Ping));
        assert_eq!(h.exchanges(), 0);
        assert!(h.provisioner.zones().is_empty());
    }

    #[tokio::test]
    async fn other_events_and_actions_are_ignored() {
        let h = harness("repository", ScriptedProvisioner::default());

        let body = Bytes::from_static(b"{}");
        let outcome = handle_delivery(h.state.clone(), &signed("push", &body), body).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Ignored));

        let body = Bytes::from(
            serde_json::to_vec(&json!({ "action": "in_progress", "workflow_job": { "id": 1 } }))
                .unwrap(),
        );
        let outcome = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Ignored));
        assert_eq!(h.exchanges(), 0);
    }

    #[tokio::test]
    async fn queued_job_provisions_in_first_zone() {
        let h = harness("repository", ScriptedProvisioner::default());
        let body = queued(&["self-hosted", "linux", "x64"]);

        let outcome = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap();

        let DeliveryOutcome::Provisioning(report) = outcome else {
            panic!("expected provisioning");
        };
        assert_eq!(
            report.outcome,
            ProvisionOutcome::Provisioned { template: "t1".into(), zone: "z1".into() }
        );
        assert_eq!(*h.registrar.calls.lock().unwrap(), [(1, "runner-987".to_string())]);
        assert_eq!(h.provisioner.zones(), ["z1"]);
    }

    #[tokio::test]
    async fn failed_zone_falls_back_with_same_credential() {
        let h = harness("repository", ScriptedProvisioner::with(&[("z1", ZoneScript::Fail)]));
        let body = queued(&["self-hosted", "linux", "x64"]);

        handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap();

        assert_eq!(h.exchanges(), 1);
        let calls = h.provisioner.calls.lock().unwrap();
        let zones: Vec<&str> = calls.iter().map(|c| c.0.as_str()).collect();
        assert_eq!(zones, ["z1", "z2"]);
        assert_eq!(calls[0].2, calls[1].2);
    }

    #[tokio::test]
    async fn unmatched_labels_abort_without_exchange() {
        let h = harness("repository", ScriptedProvisioner::default());
        let body = queued(&["self-hosted", "arm64"]);

        let err = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HandlerError::Validation(ValidationError::NoMatchingTemplate(_))
        ));
        assert_eq!(h.exchanges(), 0);
    }

    #[tokio::test]
    async fn invalid_scope_aborts_without_exchange() {
        let h = harness("enterprise", ScriptedProvisioner::default());
        let body = queued(&["linux"]);

        let err = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HandlerError::Validation(ValidationError::InvalidScope(_))
        ));
        assert_eq!(h.exchanges(), 0);
    }

    #[tokio::test]
    async fn bad_signature_aborts_before_parsing() {
        let h = harness("repository", ScriptedProvisioner::default());
        let body = Bytes::from_static(b"not even json");
        let mut headers = signed("workflow_job", &Bytes::from_static(b"other body"));

        let err = handle_delivery(h.state.clone(), &headers, body.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Authentication(AuthenticationError::SignatureMismatch)
        ));

        headers.remove(SIGNATURE_HEADER);
        let err = handle_delivery(h.state.clone(), &headers, body).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Authentication(AuthenticationError::MissingSignature)
        ));
        assert_eq!(h.exchanges(), 0);
    }

    #[tokio::test]
    async fn exhaustion_still_succeeds_with_one_error_log() {
        let logs = LevelCounter::default();
        let _guard = logs.install();
        let h = harness(
            "repository",
            ScriptedProvisioner::with(&[("z1", ZoneScript::Fail), ("z2", ZoneScript::Fail)]),
        );
        let body = queued(&["self-hosted", "linux"]);

        let outcome = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap();

        let DeliveryOutcome::Provisioning(report) = outcome else {
            panic!("expected provisioning");
        };
        assert_eq!(report.outcome, ProvisionOutcome::Exhausted);
        assert_eq!(logs.count(Level::ERROR), 1);
    }

    #[tokio::test]
    async fn redelivery_hits_existing_instance() {
        let h = harness("repository", ScriptedProvisioner::with(&[("z1", ZoneScript::Exists)]));
        let body = queued(&["self-hosted", "linux", "x64"]);

        let outcome = handle_delivery(h.state.clone(), &signed("workflow_job", &body), body)
            .await
            .unwrap();

        let DeliveryOutcome::Provisioning(report) = outcome else {
            panic!("expected provisioning");
        };
        assert_eq!(
            report.outcome,
            ProvisionOutcome::AlreadyExists { template: "t1".into(), zone: "z1".into() }
        );
        assert_eq!(h.provisioner.zones(), ["z1"]);
    }
}
