use std::sync::Arc;

use dashmap::DashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use common::JobId;
use operations::Operation;

//
// Import gRPC stubs/definitions.
//
pub mod registry {
    tonic::include_proto!("registry");
}

pub mod worker {
    tonic::include_proto!("worker");
}

pub use registry::registry_client::RegistryClient;
pub use registry::{HostRequest, RegisterHostRequest, RegisterServiceRequest};
use registry::UpdateJobStatusRequest;
pub use worker::worker_server::{Worker, WorkerServer};
use worker::{AssignDisposition, AssignReply, AssignRequest, PingReply, PingRequest};

/// A worker node. Accepts jobs from the registry's dispatcher, runs the
/// operation handlers, and reports status transitions back.
pub struct WorkerNode {
    base_url: String,
    registry: String,
    max_load: f32,

    /// Jobs currently executing, id to job load.
    running: Arc<DashMap<JobId, f32>>,
}

impl WorkerNode {
    pub fn new(base_url: String, registry: String, max_load: f32) -> Self {
        Self {
            base_url,
            registry,
            max_load,
            running: Arc::new(DashMap::new()),
        }
    }

    fn current_load(&self) -> f32 {
        self.running.iter().map(|e| *e.value()).sum()
    }

    fn refuse(detail: impl Into<String>) -> AssignReply {
        AssignReply {
            disposition: AssignDisposition::AssignRefused as i32,
            detail: detail.into(),
        }
    }

    fn reject(detail: impl Into<String>) -> AssignReply {
        AssignReply {
            disposition: AssignDisposition::AssignRejected as i32,
            detail: detail.into(),
        }
    }
}

/// Whether a worker at `current` load with `running` jobs should take on
/// another `job_load` given its `max_load`.
///
/// An idle worker takes any job, even one bigger than its own maximum, so
/// that oversized jobs are not stuck forever.
fn accepts(current: f32, running: usize, job_load: f32, max_load: f32) -> bool {
    running == 0 || current + job_load <= max_load
}

#[tonic::async_trait]
impl Worker for WorkerNode {
    async fn assign(
        &self,
        request: Request<AssignRequest>,
    ) -> Result<Response<AssignReply>, Status> {
        let req = request.into_inner();
        debug!("offered job {} ({}@{})", req.job_id, req.job_type, req.operation);

        let Some(operation) = operations::named(&req.operation) else {
            warn!("no handler for operation {}", req.operation);
            return Ok(Response::new(Self::reject(format!(
                "unknown operation {}",
                req.operation
            ))));
        };

        let current = self.current_load();
        if !accepts(current, self.running.len(), req.job_load, self.max_load) {
            debug!(
                "at capacity ({} + {} > {}), refusing job {}",
                current, req.job_load, self.max_load, req.job_id
            );
            return Ok(Response::new(Self::refuse("worker is at capacity")));
        }

        self.running.insert(req.job_id, req.job_load);
        info!("accepted job {} ({}@{})", req.job_id, req.job_type, req.operation);

        tokio::spawn(execute(
            operation,
            req,
            self.base_url.clone(),
            self.registry.clone(),
            self.running.clone(),
        ));

        Ok(Response::new(AssignReply {
            disposition: AssignDisposition::AssignAccepted as i32,
            detail: String::new(),
        }))
    }

    async fn ping(&self, _: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        Ok(Response::new(PingReply {
            running_jobs: self.running.len() as u32,
        }))
    }
}

/// Run one job and report the outcome. The registry learns about `Running`
/// before the handler starts, and `Finished` or `Failed` once it is done.
async fn execute(
    operation: Operation,
    req: AssignRequest,
    base_url: String,
    registry: String,
    running: Arc<DashMap<JobId, f32>>,
) {
    let job_id = req.job_id;

    let mut client = match RegistryClient::connect(registry).await {
        Ok(client) => client,
        Err(e) => {
            error!("unable to reach the registry for job {}: {}", job_id, e);
            running.remove(&job_id);
            return;
        }
    };

    let update = UpdateJobStatusRequest {
        id: job_id,
        status: registry::JobStatus::Running as i32,
        processor_host: base_url,
        payload: String::new(),
        failure_reason: String::new(),
    };
    if let Err(e) = client.update_job_status(Request::new(update)).await {
        error!("unable to mark job {} as running: {}", job_id, e);
        running.remove(&job_id);
        return;
    }

    let handler = operation.handler;
    let arguments = req.arguments;
    let payload = (!req.payload.is_empty()).then_some(req.payload);
    let outcome = tokio::task::spawn_blocking(move || handler(&arguments, payload.as_deref()))
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("handler panicked: {}", e)));

    running.remove(&job_id);

    let update = match outcome {
        Ok(payload) => {
            info!("job {} finished", job_id);
            UpdateJobStatusRequest {
                id: job_id,
                status: registry::JobStatus::Finished as i32,
                processor_host: String::new(),
                payload,
                failure_reason: String::new(),
            }
        }
        Err(e) => {
            warn!("job {} failed: {}", job_id, e);
            UpdateJobStatusRequest {
                id: job_id,
                status: registry::JobStatus::Failed as i32,
                processor_host: String::new(),
                payload: String::new(),
                failure_reason: e.to_string(),
            }
        }
    };
    if let Err(e) = client.update_job_status(Request::new(update)).await {
        error!("unable to report the outcome of job {}: {}", job_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_worker_respects_max_load() {
        assert!(accepts(2.0, 2, 1.0, 4.0));
        assert!(accepts(3.0, 3, 1.0, 4.0));
        assert!(!accepts(3.5, 3, 1.0, 4.0));
    }

    #[test]
    fn idle_worker_takes_oversized_jobs() {
        assert!(accepts(0.0, 0, 8.0, 4.0));
        assert!(!accepts(1.0, 1, 8.0, 4.0));
    }
}
