use thiserror::Error;

/// The delivery could not be attributed to the configured webhook secret.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("webhook secret not found")]
    MissingSecret,

    #[error("signature header missing")]
    MissingSignature,

    #[error("webhook signature verification failed")]
    SignatureMismatch,
}

/// Malformed or unsupported input. Aborts the whole delivery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid runner scope '{0}', use 'repository' or 'organization'")]
    InvalidScope(String),

    #[error("installation.id not found in payload")]
    MissingInstallation,

    #[error("{scope} url not found in payload")]
    MissingResourceUrl { scope: &'static str },

    #[error("invalid resource url '{0}'")]
    InvalidResourceUrl(String),

    #[error("no matching template for labels: {0}")]
    NoMatchingTemplate(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// A single credential or zone attempt failed. The orchestrator recovers by
/// moving on to the next zone or template.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("{call} request failed: {message}")]
    Transport { call: &'static str, message: String },

    #[error("{call} returned HTTP {status}: {body}")]
    Status {
        call: &'static str,
        status: u16,
        body: String,
    },

    #[error("{call} response is missing '{field}'")]
    MissingField {
        call: &'static str,
        field: &'static str,
    },

    #[error("failed to sign app assertion: {0}")]
    Assertion(String),

    #[error("operation {operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("operation {operation} did not finish within {seconds}s")]
    OperationTimeout { operation: String, seconds: u64 },

    #[error("instance {0} already exists")]
    AlreadyExists(String),
}

impl ProvisioningError {
    pub fn transport(call: &'static str, err: reqwest::Error) -> Self {
        Self::Transport {
            call,
            message: err.to_string(),
        }
    }

    /// True when the provider rejected the insert because the name is taken.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Failures that reach the HTTP boundary. Everything here is a hard abort.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to load app credentials: {0}")]
    Secret(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}
