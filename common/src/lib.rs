//! Shared types for the castgrid cluster.
//!
//! The registry node, the workers and the control CLI all speak in terms of
//! [`job::Job`]s, host and service registrations, and per-host load figures.
//! Everything here is transport-agnostic; the gRPC messages in each binary
//! crate are converted to and from these types at the edges.

pub mod error;
pub mod job;
pub mod load;
pub mod registration;

pub use error::RegistryError;
pub use job::{Job, JobId, JobStatus};
pub use load::{NodeLoad, SystemLoad};
pub use registration::{HostRegistration, ServiceRegistration, ServiceState};

/// Default load a job puts on a host unless the submitter says otherwise.
pub const DEFAULT_JOB_LOAD: f32 = 1.0;
