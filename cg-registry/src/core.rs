use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use common::{HostRegistration, Job, JobStatus, RegistryError, ServiceRegistration, DEFAULT_JOB_LOAD};

use crate::jobs::JobStore;
use crate::service_registry::ServiceRegistry;

//
// Import gRPC stubs/definitions.
//
pub mod registry {
    tonic::include_proto!("registry");
}

pub mod worker {
    tonic::include_proto!("worker");
}

pub use registry::registry_server::{Registry, RegistryServer};
use registry::{
    Ack, CancelJobRequest, GetJobRequest, HostMessage, HostRequest, JobMessage, JobReply,
    ListHostsReply, ListHostsRequest, ListJobsReply, ListJobsRequest, ListServicesReply,
    ListServicesRequest, RegisterHostRequest, RegisterServiceRequest, ServiceMessage,
    ServiceRequest, SetMaintenanceRequest, SubmitJobRequest, UpdateJobStatusRequest,
};

/// The registry node: owns the job store and the host/service registrations
/// shared with the dispatcher and the heartbeat monitor.
pub struct RegistryNode {
    base_url: String,
    pub store: Arc<Mutex<JobStore>>,
    pub services: Arc<Mutex<ServiceRegistry>>,
}

impl RegistryNode {
    pub fn new(
        base_url: String,
        store: Arc<Mutex<JobStore>>,
        services: Arc<Mutex<ServiceRegistry>>,
    ) -> Self {
        Self {
            base_url,
            store,
            services,
        }
    }
}

pub fn status_to_proto(status: JobStatus) -> registry::JobStatus {
    match status {
        JobStatus::Instantiated => registry::JobStatus::Instantiated,
        JobStatus::Queued => registry::JobStatus::Queued,
        JobStatus::Dispatching => registry::JobStatus::Dispatching,
        JobStatus::Running => registry::JobStatus::Running,
        JobStatus::Finished => registry::JobStatus::Finished,
        JobStatus::Failed => registry::JobStatus::Failed,
        JobStatus::Canceled => registry::JobStatus::Canceled,
        JobStatus::Restart => registry::JobStatus::Restart,
    }
}

pub fn status_from_proto(value: i32) -> Option<JobStatus> {
    match registry::JobStatus::try_from(value).ok()? {
        registry::JobStatus::Instantiated => Some(JobStatus::Instantiated),
        registry::JobStatus::Queued => Some(JobStatus::Queued),
        registry::JobStatus::Dispatching => Some(JobStatus::Dispatching),
        registry::JobStatus::Running => Some(JobStatus::Running),
        registry::JobStatus::Finished => Some(JobStatus::Finished),
        registry::JobStatus::Failed => Some(JobStatus::Failed),
        registry::JobStatus::Canceled => Some(JobStatus::Canceled),
        registry::JobStatus::Restart => Some(JobStatus::Restart),
    }
}

pub fn job_to_message(job: &Job) -> JobMessage {
    JobMessage {
        id: job.id,
        job_type: job.job_type.clone(),
        operation: job.operation.clone(),
        arguments: job.arguments.clone(),
        payload: job.payload.clone().unwrap_or_default(),
        status: status_to_proto(job.status) as i32,
        created_host: job.created_host.clone(),
        processor_host: job.processor_host.clone().unwrap_or_default(),
        dispatchable: job.dispatchable,
        job_load: job.job_load,
        parent_id: job.parent_id.unwrap_or(0),
        root_id: job.root_id.unwrap_or(0),
        created_at: job.created_at.to_rfc3339(),
        started_at: job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        failure_reason: job.failure_reason.clone().unwrap_or_default(),
        dispatch_attempts: job.dispatch_attempts,
    }
}

fn to_status(err: RegistryError) -> Status {
    match err {
        RegistryError::JobNotFound(_)
        | RegistryError::HostNotFound(_)
        | RegistryError::ServiceNotFound { .. } => Status::not_found(err.to_string()),
        RegistryError::InvalidTransition { .. } => Status::failed_precondition(err.to_string()),
        RegistryError::Transport(_) => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl Registry for RegistryNode {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<JobReply>, Status> {
        let req = request.into_inner();
        if req.job_type.trim().is_empty() {
            return Err(Status::invalid_argument("job type can't be empty"));
        }
        if req.operation.trim().is_empty() {
            return Err(Status::invalid_argument("operation can't be empty"));
        }

        let job_load = if req.job_load > 0.0 {
            req.job_load
        } else {
            DEFAULT_JOB_LOAD
        };
        let parent_id = (req.parent_id != 0).then_some(req.parent_id);
        let payload = (!req.payload.is_empty()).then_some(req.payload);

        let job = {
            let mut store = self.store.lock().await;
            store
                .create_job(
                    &req.job_type,
                    &req.operation,
                    req.arguments,
                    payload,
                    &self.base_url,
                    req.dispatchable,
                    job_load,
                    parent_id,
                )
                .map_err(to_status)?
        };
        info!("accepted {} with load {}", job, job.job_load);

        Ok(Response::new(JobReply {
            job: Some(job_to_message(&job)),
        }))
    }

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<JobReply>, Status> {
        let id = request.into_inner().id;
        let store = self.store.lock().await;
        let job = store
            .get(id)
            .ok_or_else(|| to_status(RegistryError::JobNotFound(id)))?;
        Ok(Response::new(JobReply {
            job: Some(job_to_message(job)),
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsReply>, Status> {
        let req = request.into_inner();
        let job_type = (!req.job_type.is_empty()).then_some(req.job_type);
        let status = if req.status < 0 {
            None
        } else {
            Some(
                status_from_proto(req.status)
                    .ok_or_else(|| Status::invalid_argument("unknown job status"))?,
            )
        };

        let store = self.store.lock().await;
        let jobs = store
            .list(job_type.as_deref(), status)
            .iter()
            .map(job_to_message)
            .collect();
        Ok(Response::new(ListJobsReply { jobs }))
    }

    /// Workers report status transitions here; terminal transitions feed the
    /// service failover state machine.
    async fn update_job_status(
        &self,
        request: Request<UpdateJobStatusRequest>,
    ) -> Result<Response<JobReply>, Status> {
        let req = request.into_inner();
        let next = status_from_proto(req.status)
            .ok_or_else(|| Status::invalid_argument("unknown job status"))?;

        let (job, failed_history) = {
            let mut store = self.store.lock().await;
            let job = store
                .get_mut(req.id)
                .ok_or_else(|| to_status(RegistryError::JobNotFound(req.id)))?;

            if !req.processor_host.is_empty() {
                job.processor_host = Some(req.processor_host.clone());
            }
            job.set_status(next).map_err(to_status)?;
            if !req.payload.is_empty() {
                job.payload = Some(req.payload);
            }
            if !req.failure_reason.is_empty() {
                job.failure_reason = Some(req.failure_reason);
            }
            let job = job.clone();

            let history = match (&job.processor_host, job.status.is_terminal()) {
                (Some(host), true) => store.failed_count(&job.job_type, host),
                _ => 0,
            };
            (job, history)
        };
        debug!("{} moved to {}", job, job.status);

        if job.status.is_terminal() {
            let mut services = self.services.lock().await;
            services.record_job_outcome(&job, failed_history);
        }

        Ok(Response::new(JobReply {
            job: Some(job_to_message(&job)),
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<JobReply>, Status> {
        let id = request.into_inner().id;
        let mut store = self.store.lock().await;
        let job = store
            .get_mut(id)
            .ok_or_else(|| to_status(RegistryError::JobNotFound(id)))?;

        // Work that is already on a worker can't be recalled.
        if !matches!(
            job.status,
            JobStatus::Instantiated | JobStatus::Queued | JobStatus::Restart
        ) {
            return Err(Status::failed_precondition(format!(
                "{} is {} and can no longer be canceled",
                job, job.status
            )));
        }
        job.set_status(JobStatus::Canceled).map_err(to_status)?;
        info!("{} canceled", job);

        Ok(Response::new(JobReply {
            job: Some(job_to_message(job)),
        }))
    }

    async fn register_host(
        &self,
        request: Request<RegisterHostRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        if req.base_url.trim().is_empty() {
            return Err(Status::invalid_argument("host base URL can't be empty"));
        }
        let registration = HostRegistration::new(
            req.base_url,
            req.address,
            req.memory,
            req.cores,
            req.max_load,
        );
        self.services.lock().await.register_host(registration);
        Ok(Response::new(Ack { success: true }))
    }

    async fn unregister_host(
        &self,
        request: Request<HostRequest>,
    ) -> Result<Response<Ack>, Status> {
        let base_url = request.into_inner().base_url;
        self.services
            .lock()
            .await
            .unregister_host(&base_url)
            .map_err(to_status)?;
        let orphaned = self.store.lock().await.orphan_jobs_on_host(&base_url);
        if !orphaned.is_empty() {
            info!(
                "parked {} jobs from {} for redispatch",
                orphaned.len(),
                base_url
            );
        }
        Ok(Response::new(Ack { success: true }))
    }

    async fn enable_host(&self, request: Request<HostRequest>) -> Result<Response<Ack>, Status> {
        let base_url = request.into_inner().base_url;
        self.services
            .lock()
            .await
            .enable_host(&base_url)
            .map_err(to_status)?;
        Ok(Response::new(Ack { success: true }))
    }

    async fn disable_host(&self, request: Request<HostRequest>) -> Result<Response<Ack>, Status> {
        let base_url = request.into_inner().base_url;
        self.services
            .lock()
            .await
            .disable_host(&base_url)
            .map_err(to_status)?;
        Ok(Response::new(Ack { success: true }))
    }

    async fn set_maintenance(
        &self,
        request: Request<SetMaintenanceRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.services
            .lock()
            .await
            .set_maintenance(&req.base_url, req.maintenance)
            .map_err(to_status)?;
        Ok(Response::new(Ack { success: true }))
    }

    async fn list_hosts(
        &self,
        _request: Request<ListHostsRequest>,
    ) -> Result<Response<ListHostsReply>, Status> {
        let current = { self.store.lock().await.current_loads() };
        let services = self.services.lock().await;
        let hosts = services
            .hosts()
            .into_iter()
            .map(|h| HostMessage {
                current_load: current.get(&h.base_url).copied().unwrap_or(0.0),
                base_url: h.base_url,
                address: h.address,
                memory: h.memory,
                cores: h.cores,
                max_load: h.max_load,
                online: h.online,
                active: h.active,
                maintenance: h.maintenance,
            })
            .collect();
        Ok(Response::new(ListHostsReply { hosts }))
    }

    async fn register_service(
        &self,
        request: Request<RegisterServiceRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        if req.service_type.trim().is_empty() {
            return Err(Status::invalid_argument("service type can't be empty"));
        }
        let registration = ServiceRegistration::new(req.service_type, req.host, req.job_producer);
        self.services
            .lock()
            .await
            .register_service(registration)
            .map_err(to_status)?;
        Ok(Response::new(Ack { success: true }))
    }

    async fn unregister_service(
        &self,
        request: Request<ServiceRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.services
            .lock()
            .await
            .unregister_service(&req.service_type, &req.host)
            .map_err(to_status)?;
        let orphaned = {
            let mut store = self.store.lock().await;
            store.orphan_jobs_for_service(&req.host, &req.service_type)
        };
        if !orphaned.is_empty() {
            info!(
                "parked {} jobs from {}@{} for redispatch",
                orphaned.len(),
                req.service_type,
                req.host
            );
        }
        Ok(Response::new(Ack { success: true }))
    }

    async fn sanitize(&self, request: Request<ServiceRequest>) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.services
            .lock()
            .await
            .sanitize(&req.service_type, &req.host)
            .map_err(to_status)?;
        Ok(Response::new(Ack { success: true }))
    }

    async fn list_services(
        &self,
        _request: Request<ListServicesRequest>,
    ) -> Result<Response<ListServicesReply>, Status> {
        let services = self.services.lock().await;
        let services = services
            .services()
            .iter()
            .map(|s| ServiceMessage {
                service_type: s.service_type.clone(),
                host: s.host.clone(),
                online: s.online,
                job_producer: s.job_producer,
                service_state: s.service_state.to_string(),
            })
            .collect();
        Ok(Response::new(ListServicesReply { services }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_variant_maps_to_a_grpc_code() {
        assert_eq!(
            to_status(RegistryError::JobNotFound(4)).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            to_status(RegistryError::HostNotFound("http://w1".into())).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            to_status(RegistryError::InvalidTransition {
                job: 4,
                from: "finished".into(),
                to: "queued".into(),
            })
            .code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            to_status(RegistryError::Transport("connection refused".into())).code(),
            tonic::Code::Internal
        );
    }

    #[test]
    fn job_message_uses_zero_for_missing_parent() {
        let job = Job::new(3, "crop", "crop", vec![], "http://r", true, 1.0);
        let msg = job_to_message(&job);
        assert_eq!(msg.parent_id, 0);
        assert_eq!(msg.root_id, 0);
        assert!(msg.started_at.is_empty());
        assert_eq!(status_from_proto(msg.status), Some(JobStatus::Instantiated));
    }
}
