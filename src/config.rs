use std::collections::HashMap;

use crate::error::ConfigError;
use crate::templates::RunnerTemplate;

const DEFAULT_PORT: u16 = 8080;

/// Environment-sourced settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secret Manager secret holding the GitHub App bundle.
    pub config_secret_id: String,
    pub instance_name_prefix: String,
    pub instance_templates: Vec<RunnerTemplate>,
    /// GCP project for both Secret Manager and Compute Engine.
    pub project: String,
    /// Raw scope value; validated per delivery.
    pub runner_scope: String,
    pub runner_version: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| -> Result<String, ConfigError> {
            vars.get(name).cloned().ok_or(ConfigError::Missing(name))
        };

        let instance_templates: Vec<RunnerTemplate> =
            serde_json::from_str(&get("INSTANCE_TEMPLATES")?).map_err(|e| {
                ConfigError::Invalid {
                    name: "INSTANCE_TEMPLATES",
                    message: e.to_string(),
                }
            })?;

        let port = match vars.get("PORT") {
            Some(p) => p.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                message: format!("'{p}' is not a port number"),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            config_secret_id: get("CONFIG_SECRET_ID")?,
            instance_name_prefix: get("INSTANCE_NAME_PREFIX")?,
            instance_templates,
            project: get("PROJECT")?,
            runner_scope: get("RUNNER_SCOPE")?,
            runner_version: get("RUNNER_VERSION")?,
            port,
        })
    }

    /// Deterministic VM and runner name for a job.
    pub fn instance_name(&self, job_id: u64) -> String {
        format!("{}-{job_id}", self.instance_name_prefix)
    }
}
