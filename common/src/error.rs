use thiserror::Error;

use crate::job::JobId;

/// Errors surfaced by the registry and its clients.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("no host registration for '{0}'")]
    HostNotFound(String),

    #[error("no service registration for type '{service_type}' on host '{host}'")]
    ServiceNotFound { service_type: String, host: String },

    #[error("job {job}: illegal status transition {from} -> {to}")]
    InvalidTransition { job: JobId, from: String, to: String },

    #[error("transport failure: {0}")]
    Transport(String),
}
