use std::fmt;
use std::hash::Hasher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub type JobId = u64;

/// State of a job in the registry.
///
/// A job starts out `Instantiated`, is queued for dispatch, handed to a host
/// (`Dispatching`), executed (`Running`) and ends in one of the terminal
/// states. `Restart` is the parking state for work that was in flight on a
/// host that went away; the dispatcher picks those up before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Instantiated,
    Queued,
    Dispatching,
    Running,
    Finished,
    Failed,
    Canceled,
    Restart,
}

impl JobStatus {
    /// Whether the job still occupies the system in some form.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Terminal states are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Statuses that count towards a host's current load.
    pub fn influences_load(self) -> bool {
        matches!(self, JobStatus::Dispatching | JobStatus::Running)
    }

    /// Check a single status transition.
    ///
    /// Transitions are monotonic: once a job hits a terminal state it stays
    /// there, and `Restart` is only reachable from in-flight states.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Instantiated => false,
            JobStatus::Queued => true,
            JobStatus::Dispatching => matches!(self, JobStatus::Queued | JobStatus::Restart),
            JobStatus::Running => matches!(self, JobStatus::Dispatching | JobStatus::Instantiated),
            JobStatus::Restart => matches!(self, JobStatus::Dispatching | JobStatus::Running),
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled => true,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Instantiated => "instantiated",
            JobStatus::Queued => "queued",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Restart => "restart",
        };
        write!(f, "{}", s)
    }
}

/// One unit of asynchronous work, tracked by the registry from creation to a
/// retained terminal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the registry at creation, immutable afterwards.
    pub id: JobId,

    /// Service type that must run this job, e.g. `waveform`.
    pub job_type: String,

    /// Operation within the service type.
    pub operation: String,

    /// Serialized arguments handed to the operation handler.
    pub arguments: Vec<String>,

    /// Serialized result, set when the job finishes.
    pub payload: Option<String>,

    pub status: JobStatus,

    /// Host that created the job.
    pub created_host: String,

    /// Host currently responsible for executing the job.
    pub processor_host: Option<String>,

    /// Non-dispatchable jobs are pinned to their creating host.
    pub dispatchable: bool,

    /// Load this job puts on its processor while active.
    pub job_load: f32,

    pub parent_id: Option<JobId>,
    pub root_id: Option<JobId>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set when the job fails.
    pub failure_reason: Option<String>,

    /// Number of dispatch attempts made for this job.
    pub dispatch_attempts: u32,
}

impl Job {
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        operation: impl Into<String>,
        arguments: Vec<String>,
        created_host: impl Into<String>,
        dispatchable: bool,
        job_load: f32,
    ) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            operation: operation.into(),
            arguments,
            payload: None,
            status: JobStatus::Instantiated,
            created_host: created_host.into(),
            processor_host: None,
            dispatchable,
            job_load,
            parent_id: None,
            root_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            dispatch_attempts: 0,
        }
    }

    /// Stable hash over type, operation and arguments.
    ///
    /// Two jobs doing the same work on the same inputs share a signature; the
    /// service failover logic uses this to tell "bad job" from "bad service".
    pub fn signature(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(self.job_type.as_bytes());
        hasher.write(self.operation.as_bytes());
        for arg in &self.arguments {
            hasher.write(arg.as_bytes());
        }
        hasher.finish()
    }

    /// Move the job to `next`, stamping timestamps as appropriate.
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), RegistryError> {
        if !self.status.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                job: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} ({}@{})", self.id, self.job_type, self.operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> Job {
        let mut j = Job::new(1, "inspect", "inspect", vec![], "http://a", true, 1.0);
        j.status = status;
        j
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [JobStatus::Finished, JobStatus::Failed, JobStatus::Canceled] {
            let mut j = job(terminal);
            for next in [
                JobStatus::Queued,
                JobStatus::Dispatching,
                JobStatus::Running,
                JobStatus::Restart,
            ] {
                assert!(j.set_status(next).is_err(), "{} -> {}", terminal, next);
            }
            assert_eq!(j.status, terminal);
        }
    }

    #[test]
    fn normal_lifecycle() {
        let mut j = job(JobStatus::Instantiated);
        j.set_status(JobStatus::Queued).unwrap();
        j.set_status(JobStatus::Dispatching).unwrap();
        j.set_status(JobStatus::Running).unwrap();
        assert!(j.started_at.is_some());
        assert!(j.completed_at.is_none());
        j.set_status(JobStatus::Finished).unwrap();
        assert!(j.completed_at.is_some());
    }

    #[test]
    fn restart_only_from_in_flight() {
        assert!(job(JobStatus::Running).set_status(JobStatus::Restart).is_ok());
        assert!(job(JobStatus::Dispatching).set_status(JobStatus::Restart).is_ok());
        assert!(job(JobStatus::Queued).set_status(JobStatus::Restart).is_err());
        assert!(job(JobStatus::Failed).set_status(JobStatus::Restart).is_err());
    }

    #[test]
    fn refused_dispatch_goes_back_to_queued() {
        let mut j = job(JobStatus::Queued);
        j.set_status(JobStatus::Dispatching).unwrap();
        j.set_status(JobStatus::Queued).unwrap();
        assert_eq!(j.status, JobStatus::Queued);
    }

    #[test]
    fn signature_ignores_id_but_not_arguments() {
        let a = Job::new(1, "crop", "crop", vec!["x".into()], "http://a", true, 1.0);
        let b = Job::new(2, "crop", "crop", vec!["x".into()], "http://b", true, 1.0);
        let c = Job::new(3, "crop", "crop", vec!["y".into()], "http://a", true, 1.0);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }
}
