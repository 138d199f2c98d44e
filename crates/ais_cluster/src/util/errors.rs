use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("MetricsError: {0}")]
    MetricsError(#[source] prometheus::Error),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::KubeError(_) => "kubeerror",
            StdError::FinalizerError(_) => "finalizererror",
            StdError::MetadataMissing(_) => "metadatamissing",
            StdError::InvalidSpec(_) => "invalidspec",
            StdError::HttpError(_) => "httperror",
            StdError::Timeout(_) => "timeout",
            StdError::Conflict(_) => "conflict",
            StdError::MetricsError(_) => "metricserror",
        };
        label.to_string()
    }

    /// True for `409 Conflict` responses from the API server.
    pub fn is_conflict(&self) -> bool {
        match self {
            StdError::Conflict(_) => true,
            StdError::KubeError(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    fn is_access_denied(&self) -> bool {
        matches!(self, StdError::KubeError(kube::Error::Api(e)) if e.code == 401 || e.code == 403)
    }
}

/// Categorized failure reasons recorded on the `ReconcilerError` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    Unknown,
    IncompatibleSpec,
    RbacManagement,
    ProxyCreation,
    TargetCreation,
    InstanceDeletion,
    ConfigChange,
    ConfigBuild,
    OwnerReference,
    ExternalService,
    ResourceCreation,
    ResourceFetch,
    ResourceUpdate,
}

impl ErrorReason {
    /// Transient reasons are retried with backoff. The rest need the user to
    /// change the spec.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorReason::IncompatibleSpec)
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            ErrorReason::Unknown => "Unknown",
            ErrorReason::IncompatibleSpec => "IncompatibleSpecError",
            ErrorReason::RbacManagement => "RBACError",
            ErrorReason::ProxyCreation => "ProxyCreationError",
            ErrorReason::TargetCreation => "TargetCreationError",
            ErrorReason::InstanceDeletion => "InstanceDeletionError",
            ErrorReason::ConfigChange => "ConfigChangeError",
            ErrorReason::ConfigBuild => "ConfigBuildError",
            ErrorReason::OwnerReference => "OwnerReferenceError",
            ErrorReason::ExternalService => "ExternalService",
            ErrorReason::ResourceCreation => "ResourceCreationError",
            ErrorReason::ResourceFetch => "ResourceFetchError",
            ErrorReason::ResourceUpdate => "ResourceUpdateError",
        };
        write!(f, "{reason}")
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),

    #[error("{reason}: {source}")]
    Categorized {
        reason: ErrorReason,
        #[source]
        source: StdError,
    },
}

impl Error {
    /// Tags `source` with the step that failed. Access-control failures keep
    /// their own category whatever the step was.
    pub fn categorize(reason: ErrorReason, source: StdError) -> Self {
        let reason = if source.is_access_denied() {
            ErrorReason::RbacManagement
        } else {
            reason
        };
        Error::Categorized { reason, source }
    }

    pub fn kube(reason: ErrorReason, e: kube::Error) -> Self {
        Error::categorize(reason, StdError::KubeError(e))
    }

    pub fn incompatible_spec(message: impl Into<String>) -> Self {
        Error::Categorized {
            reason: ErrorReason::IncompatibleSpec,
            source: StdError::InvalidSpec(message.into()),
        }
    }

    pub fn reason(&self) -> ErrorReason {
        match self {
            Error::Categorized { reason, .. } => *reason,
            Error::StdError(e) | Error::ErrorWithRequeue(ErrorWithRequeue { error: e, .. }) => {
                if e.is_access_denied() {
                    ErrorReason::RbacManagement
                } else {
                    ErrorReason::Unknown
                }
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::StdError(e) | Error::Categorized { source: e, .. } => e.is_conflict(),
            Error::ErrorWithRequeue(e) => e.error.is_conflict(),
        }
    }

    /// Requeue delay carried by this error, looking through finalizer wrapping.
    pub fn requeue_after(&self) -> Option<Duration> {
        use kube::runtime::finalizer::Error as FinalizerError;
        match self {
            Error::ErrorWithRequeue(e) => Some(e.duration),
            Error::StdError(StdError::FinalizerError(inner)) => match inner.as_ref() {
                FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.requeue_after(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
            Error::Categorized { reason, .. } => reason.to_string().to_lowercase(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
