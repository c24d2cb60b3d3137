//! Error types for gateway reconciliation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to obtain an access token from the identity authority.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The authority answered with a non-success status.
    #[error("token endpoint {endpoint} returned HTTP {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The authority could not be reached (or kept failing with 5xx).
    #[error("token endpoint {endpoint} unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    /// The authority answered 2xx but the body is not a usable token response.
    #[error("malformed token response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
}

/// Classification of a single failed control-plane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    Transient,
    Auth,
    Rejected,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Error returned by a [`crate::api::ControlPlane`] call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error{}{}: {message}", status_suffix(.status), code_suffix(.code))]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    /// Service error code (for example `ConflictException`), when the body carried one.
    pub code: Option<String>,
    pub message: String,
    /// Set when the call failed because no access token could be obtained.
    pub auth: Option<AuthError>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

impl ApiError {
    #[must_use]
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            code: None,
            message: message.into(),
            auth: None,
        }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transient, message)
    }

    #[must_use]
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Rejected,
            status: None,
            code: Some(code.into()),
            message: message.into(),
            auth: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classify an HTTP error status (plus optional service code) returned by the control plane.
    #[must_use]
    pub fn from_status(status: u16, code: Option<String>, message: String) -> Self {
        let kind = match status {
            404 => ApiErrorKind::NotFound,
            401 | 403 => ApiErrorKind::Auth,
            408 | 429 | 500..=599 => ApiErrorKind::Transient,
            _ => ApiErrorKind::Rejected,
        };
        Self {
            kind,
            status: Some(status),
            code,
            message,
            auth: None,
        }
    }

    /// Classify a transport-level reqwest failure.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), None, err.to_string());
        }
        if err.is_decode() {
            return Self::new(
                ApiErrorKind::Rejected,
                format!("malformed response: {err}"),
            );
        }
        // connect / timeout / request / body errors
        Self::transient(err.to_string())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == ApiErrorKind::Transient
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let mut api = Self::new(ApiErrorKind::Auth, err.to_string());
        api.auth = Some(err);
        api
    }
}

/// Every configuration problem found by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ValidationIssue {
    field: String,
    problem: String,
}

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, problem: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            problem: problem.into(),
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }

    /// `Ok(())` when nothing was recorded.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` carrying every recorded issue.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "  - {}: {}", issue.field, issue.problem)?;
        }
        Ok(())
    }
}

/// Crate-level error: every remote failure classified, with the step and resource attached.
#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed during {step}: {source}")]
    Auth {
        step: &'static str,
        #[source]
        source: AuthError,
    },

    /// Raised before any remote call.
    #[error("invalid configuration:\n{0}")]
    Validation(ValidationErrors),

    #[error("{step} failed for {resource} after {attempts} attempt(s): {message}")]
    Transient {
        step: &'static str,
        resource: String,
        attempts: u32,
        message: String,
    },

    #[error("{step} for {resource} timed out after {}s", .waited.as_secs())]
    Timeout {
        step: &'static str,
        resource: String,
        waited: Duration,
    },

    #[error("{step} for {resource} was cancelled")]
    Cancelled {
        step: &'static str,
        resource: String,
    },

    #[error("{step}: {resource} not found")]
    NotFound {
        step: &'static str,
        resource: String,
    },

    #[error("{step} rejected for {resource}: {message}")]
    Rejected {
        step: &'static str,
        resource: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("gateway {resource} reached FAILED state{}", reason_suffix(.reason))]
    GatewayFailed {
        resource: String,
        reason: Option<String>,
    },

    #[error("failed to load configuration {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },
}

impl Error {
    /// Attach step/resource context to a control-plane failure.
    #[must_use]
    pub fn from_api(step: &'static str, resource: &str, attempts: u32, err: ApiError) -> Self {
        let resource = resource.to_string();
        match err.kind {
            ApiErrorKind::NotFound => Self::NotFound { step, resource },
            ApiErrorKind::Transient => Self::Transient {
                step,
                resource,
                attempts,
                message: err.message,
            },
            ApiErrorKind::Auth => Self::Auth {
                step,
                source: err.auth.unwrap_or(AuthError::Rejected {
                    endpoint: resource,
                    status: err.status.unwrap_or(401),
                    body: err.message,
                }),
            },
            ApiErrorKind::Rejected => Self::Rejected {
                step,
                resource,
                status: err.status,
                code: err.code,
                message: err.message,
            },
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Service error code carried by a rejected call, if any.
    #[must_use]
    pub fn service_code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
