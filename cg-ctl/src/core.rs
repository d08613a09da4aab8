use std::time::{Duration, Instant};

use crate::core::registry::registry_client::RegistryClient;
use crate::core::registry::{
    CancelJobRequest, GetJobRequest, HostRequest, JobMessage, JobStatus, ListHostsRequest,
    ListJobsRequest, ListServicesRequest, ServiceRequest, SetMaintenanceRequest, SubmitJobRequest,
};

//
// Import gRPC stubs/definitions.
//
pub mod registry {
    tonic::include_proto!("registry");
}

fn status_value(name: &str) -> Option<i32> {
    let status = match name {
        "instantiated" => JobStatus::Instantiated,
        "queued" => JobStatus::Queued,
        "dispatching" => JobStatus::Dispatching,
        "running" => JobStatus::Running,
        "finished" => JobStatus::Finished,
        "failed" => JobStatus::Failed,
        "canceled" => JobStatus::Canceled,
        "restart" => JobStatus::Restart,
        _ => return None,
    };
    Some(status as i32)
}

fn status_name(value: i32) -> &'static str {
    match JobStatus::try_from(value) {
        Ok(JobStatus::Instantiated) => "instantiated",
        Ok(JobStatus::Queued) => "queued",
        Ok(JobStatus::Dispatching) => "dispatching",
        Ok(JobStatus::Running) => "running",
        Ok(JobStatus::Finished) => "finished",
        Ok(JobStatus::Failed) => "failed",
        Ok(JobStatus::Canceled) => "canceled",
        Ok(JobStatus::Restart) => "restart",
        Err(_) => "unknown",
    }
}

fn is_terminal(value: i32) -> bool {
    matches!(
        JobStatus::try_from(value),
        Ok(JobStatus::Finished) | Ok(JobStatus::Failed) | Ok(JobStatus::Canceled)
    )
}

fn print_job(job: &JobMessage) {
    println!(
        "job {}: {}@{} [{}] on {}",
        job.id,
        job.job_type,
        job.operation,
        status_name(job.status),
        if job.processor_host.is_empty() {
            "-"
        } else {
            &job.processor_host
        },
    );
    if !job.payload.is_empty() {
        println!("  payload: {}", job.payload);
    }
    if !job.failure_reason.is_empty() {
        println!("  failure: {}", job.failure_reason);
    }
}

pub async fn submit(
    address: String,
    job_type: String,
    operation: String,
    arguments: Vec<String>,
    payload: Option<String>,
    load: f32,
    parent: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    let request = tonic::Request::new(SubmitJobRequest {
        job_type,
        operation,
        arguments,
        payload: payload.unwrap_or_default(),
        dispatchable: true,
        job_load: load,
        parent_id: parent.unwrap_or(0),
    });
    let response = client.submit_job(request).await?;

    if let Some(job) = response.into_inner().job {
        print_job(&job);
    }
    Ok(())
}

pub async fn job(address: String, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    let response = client.get_job(tonic::Request::new(GetJobRequest { id })).await?;

    if let Some(job) = response.into_inner().job {
        print_job(&job);
    }
    Ok(())
}

/// Whether the wait is over: the job hit the target status, or a terminal
/// status it can never leave again.
fn wait_done(status: i32, target: Option<i32>) -> bool {
    target == Some(status) || is_terminal(status)
}

/// Poll a job until it reaches the target or a terminal status, or the
/// timeout runs out.
pub async fn wait(
    address: String,
    id: u64,
    target: Option<String>,
    interval: u64,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = match target {
        None => None,
        Some(name) => {
            Some(status_value(&name).ok_or_else(|| format!("unknown job status {}", name))?)
        }
    };

    let mut client = RegistryClient::connect(address).await?;
    let deadline = Instant::now() + Duration::from_secs(timeout);

    loop {
        let response = client.get_job(tonic::Request::new(GetJobRequest { id })).await?;
        if let Some(job) = response.into_inner().job {
            if wait_done(job.status, target) {
                print_job(&job);
                return Ok(());
            }
            println!("job {} is {}", job.id, status_name(job.status));
        }
        if Instant::now() >= deadline {
            return Err(format!("job {} did not finish within {}s", id, timeout).into());
        }
        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}

pub async fn jobs(
    address: String,
    job_type: Option<String>,
    status: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = match status {
        None => -1,
        Some(name) => {
            status_value(&name).ok_or_else(|| format!("unknown job status {}", name))?
        }
    };

    let mut client = RegistryClient::connect(address).await?;
    let request = tonic::Request::new(ListJobsRequest {
        job_type: job_type.unwrap_or_default(),
        status,
    });
    let response = client.list_jobs(request).await?;

    println!("[Jobs]");
    for job in response.into_inner().jobs {
        print_job(&job);
    }
    Ok(())
}

pub async fn cancel(address: String, id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    let response = client
        .cancel_job(tonic::Request::new(CancelJobRequest { id }))
        .await?;

    if let Some(job) = response.into_inner().job {
        print_job(&job);
    }
    Ok(())
}

pub async fn hosts(address: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    let response = client.list_hosts(tonic::Request::new(ListHostsRequest {})).await?;

    println!("[Hosts]");
    for host in response.into_inner().hosts {
        let mut flags = Vec::new();
        if !host.online {
            flags.push("offline");
        }
        if !host.active {
            flags.push("disabled");
        }
        if host.maintenance {
            flags.push("maintenance");
        }
        println!(
            "{}: load {:.2}/{:.2} ({} cores){}{}",
            host.base_url,
            host.current_load,
            host.max_load,
            host.cores,
            if flags.is_empty() { "" } else { " " },
            flags.join(", "),
        );
    }
    Ok(())
}

pub async fn services(address: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    let response = client
        .list_services(tonic::Request::new(ListServicesRequest {}))
        .await?;

    println!("[Services]");
    for service in response.into_inner().services {
        println!(
            "{}@{}: {}{}",
            service.service_type,
            service.host,
            service.service_state,
            if service.online { "" } else { " (offline)" },
        );
    }
    Ok(())
}

pub async fn disable(address: String, host: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    client
        .disable_host(tonic::Request::new(HostRequest { base_url: host }))
        .await?;
    Ok(())
}

pub async fn enable(address: String, host: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    client
        .enable_host(tonic::Request::new(HostRequest { base_url: host }))
        .await?;
    Ok(())
}

pub async fn maintenance(
    address: String,
    host: String,
    maintenance: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    client
        .set_maintenance(tonic::Request::new(SetMaintenanceRequest {
            base_url: host,
            maintenance,
        }))
        .await?;
    Ok(())
}

pub async fn sanitize(
    address: String,
    job_type: String,
    host: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = RegistryClient::connect(address).await?;
    client
        .sanitize(tonic::Request::new(ServiceRequest {
            service_type: job_type,
            host,
        }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_stops_on_target_or_terminal() {
        let running = JobStatus::Running as i32;
        let queued = JobStatus::Queued as i32;
        assert!(wait_done(running, Some(running)));
        assert!(!wait_done(queued, Some(running)));
        assert!(!wait_done(running, None));
        // Terminal states end the wait no matter the target.
        assert!(wait_done(JobStatus::Failed as i32, Some(running)));
        assert!(wait_done(JobStatus::Finished as i32, None));
        assert!(wait_done(JobStatus::Canceled as i32, Some(queued)));
    }
}
