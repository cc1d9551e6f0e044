use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ValidationError;

/// Label every self-hosted job carries. It never constrains template choice.
pub const SELF_HOSTED_LABEL: &str = "self-hosted";

/// One entry of `INSTANCE_TEMPLATES`, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerTemplate {
    /// Labels the runner registers with; the capability superset it offers.
    pub labels: Vec<String>,
    pub group_id: u64,
    /// Candidate zones, tried in order.
    pub zones: Vec<String>,
    /// Name of the Compute Engine instance template.
    pub template_name: String,
}

impl RunnerTemplate {
    pub fn offers(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|label| self.labels.contains(label))
    }
}

/// Drop the generic marker label and dedupe.
pub fn required_labels<I, S>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    labels
        .into_iter()
        .map(Into::into)
        .filter(|label| label != SELF_HOSTED_LABEL)
        .collect()
}

/// Templates whose labels are a superset of `required`, in configuration order.
pub fn select_templates<'a>(
    required: &BTreeSet<String>,
    templates: &'a [RunnerTemplate],
) -> Result<Vec<&'a RunnerTemplate>, ValidationError> {
    let matching: Vec<&RunnerTemplate> =
        templates.iter().filter(|t| t.offers(required)).collect();

    if matching.is_empty() {
        let labels: Vec<&str> = required.iter().map(String::as_str).collect();
        return Err(ValidationError::NoMatchingTemplate(format!("{{{}}}", labels.join(", "))));
    }
    Ok(matching)
}
