use std::collections::HashMap;

use common::{Job, JobId, JobStatus, RegistryError};
use tracing::debug;

/// The job table.
///
/// Jobs are kept for their whole life, including terminal states, so that
/// operators can look up what happened to a recording after the fact.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    next_id: JobId,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_id: 1,
        }
    }

    /// Create a job and hand out its immutable id.
    #[allow(clippy::too_many_arguments)]
    pub fn create_job(
        &mut self,
        job_type: &str,
        operation: &str,
        arguments: Vec<String>,
        payload: Option<String>,
        created_host: &str,
        dispatchable: bool,
        job_load: f32,
        parent_id: Option<JobId>,
    ) -> Result<Job, RegistryError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut job = Job::new(
            id,
            job_type,
            operation,
            arguments,
            created_host,
            dispatchable,
            job_load,
        );
        job.payload = payload;

        if let Some(parent) = parent_id {
            let parent_job = self
                .jobs
                .get(&parent)
                .ok_or(RegistryError::JobNotFound(parent))?;
            job.parent_id = Some(parent);
            job.root_id = Some(parent_job.root_id.unwrap_or(parent));
        }

        if dispatchable {
            job.set_status(JobStatus::Queued)?;
        } else {
            // Non-dispatchable jobs are handled by the host that created them.
            job.processor_host = Some(job.created_host.clone());
        }

        debug!("created {} with status {}", job, job.status);
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// Dispatchable jobs in the given status, oldest first.
    pub fn dispatchable_with_status(&self, status: JobStatus) -> Vec<JobId> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.dispatchable && j.status == status)
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.iter().map(|j| j.id).collect()
    }

    /// All jobs, optionally filtered, oldest first.
    pub fn list(&self, job_type: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|j| job_type.map_or(true, |t| j.job_type == t))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    /// Whether any child of `parent` is currently running.
    pub fn has_running_children(&self, parent: JobId) -> bool {
        self.jobs
            .values()
            .any(|j| j.parent_id == Some(parent) && j.status == JobStatus::Running)
    }

    /// Count of failed jobs processed by the given service. Feeds the
    /// warning-to-error escalation.
    pub fn failed_count(&self, service_type: &str, host: &str) -> u32 {
        self.jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.job_type == service_type
                    && j.processor_host.as_deref() == Some(host)
            })
            .count() as u32
    }

    /// Sum of job loads currently occupying each host.
    pub fn current_loads(&self) -> HashMap<String, f32> {
        let mut loads: HashMap<String, f32> = HashMap::new();
        for job in self.jobs.values() {
            if !job.status.influences_load() {
                continue;
            }
            if let Some(host) = &job.processor_host {
                *loads.entry(host.clone()).or_insert(0.0) += job.job_load;
            }
        }
        loads
    }

    /// Park or fail every in-flight job on a host that went away.
    ///
    /// Dispatchable jobs go back through the queue via `Restart`; jobs pinned
    /// to the lost host cannot run anywhere else and fail outright.
    pub fn orphan_jobs_on_host(&mut self, host: &str) -> Vec<JobId> {
        self.orphan(host, None)
    }

    /// Same as [`Self::orphan_jobs_on_host`], limited to one service type.
    /// Used when a single service is declared dead while its host lives on.
    pub fn orphan_jobs_for_service(&mut self, host: &str, service_type: &str) -> Vec<JobId> {
        self.orphan(host, Some(service_type))
    }

    fn orphan(&mut self, host: &str, job_type: Option<&str>) -> Vec<JobId> {
        let mut touched = Vec::new();
        for job in self.jobs.values_mut() {
            if job.processor_host.as_deref() != Some(host) || !job.status.is_active() {
                continue;
            }
            if job_type.is_some_and(|t| t != job.job_type) {
                continue;
            }
            let in_flight = matches!(job.status, JobStatus::Dispatching | JobStatus::Running);
            let next = if job.dispatchable && in_flight {
                JobStatus::Restart
            } else if !job.dispatchable {
                JobStatus::Failed
            } else {
                continue;
            };
            if job.set_status(next).is_ok() {
                if next == JobStatus::Failed {
                    job.failure_reason = Some(format!("host {} was lost", host));
                } else {
                    job.processor_host = None;
                }
                touched.push(job.id);
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_job(dispatchable: bool) -> (JobStore, JobId) {
        let mut store = JobStore::new();
        let job = store
            .create_job(
                "inspect",
                "inspect",
                vec![],
                None,
                "http://reg",
                dispatchable,
                1.0,
                None,
            )
            .unwrap();
        (store, job.id)
    }

    #[test]
    fn ids_are_sequential_and_immutable() {
        let mut store = JobStore::new();
        let a = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        let b = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn dispatchable_jobs_start_queued() {
        let (store, id) = store_with_job(true);
        assert_eq!(store.get(id).unwrap().status, JobStatus::Queued);
        assert_eq!(store.dispatchable_with_status(JobStatus::Queued), vec![id]);
    }

    #[test]
    fn pinned_jobs_keep_their_creator() {
        let (store, id) = store_with_job(false);
        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Instantiated);
        assert_eq!(job.processor_host.as_deref(), Some("http://reg"));
        assert!(store.dispatchable_with_status(JobStatus::Queued).is_empty());
    }

    #[test]
    fn child_jobs_inherit_root() {
        let mut store = JobStore::new();
        let root = store
            .create_job("inspect", "inspect", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        let child = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, Some(root.id))
            .unwrap();
        let grandchild = store
            .create_job("waveform", "render", vec![], None, "http://r", true, 1.0, Some(child.id))
            .unwrap();
        assert_eq!(child.root_id, Some(root.id));
        assert_eq!(grandchild.root_id, Some(root.id));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut store = JobStore::new();
        let res = store.create_job("crop", "crop", vec![], None, "http://r", true, 1.0, Some(99));
        assert!(res.is_err());
    }

    #[test]
    fn load_counts_only_in_flight_jobs() {
        let mut store = JobStore::new();
        for status in [
            JobStatus::Queued,
            JobStatus::Dispatching,
            JobStatus::Running,
            JobStatus::Finished,
        ] {
            let job = store
                .create_job("crop", "crop", vec![], None, "http://r", true, 1.5, None)
                .unwrap();
            let j = store.get_mut(job.id).unwrap();
            j.status = status;
            j.processor_host = Some("http://w1".into());
        }
        let loads = store.current_loads();
        assert_eq!(loads.get("http://w1"), Some(&3.0));
    }

    #[test]
    fn orphaning_restarts_dispatchable_work() {
        let mut store = JobStore::new();
        let running = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        {
            let j = store.get_mut(running.id).unwrap();
            j.status = JobStatus::Running;
            j.processor_host = Some("http://w1".into());
        }
        let pinned = store
            .create_job("crop", "crop", vec![], None, "http://w1", false, 1.0, None)
            .unwrap();

        let touched = store.orphan_jobs_on_host("http://w1");
        assert_eq!(touched.len(), 2);
        assert_eq!(store.get(running.id).unwrap().status, JobStatus::Restart);
        assert!(store.get(running.id).unwrap().processor_host.is_none());
        assert_eq!(store.get(pinned.id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn finished_jobs_are_retained() {
        let (mut store, id) = store_with_job(true);
        store.get_mut(id).unwrap().status = JobStatus::Finished;
        assert!(store.get(id).is_some());
        assert_eq!(store.list(None, Some(JobStatus::Finished)).len(), 1);
    }
}
