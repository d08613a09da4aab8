use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::{debug, info, trace, warn};

use common::{Job, JobId, JobStatus, RegistryError, ServiceRegistration, SystemLoad};

use crate::core::worker::{worker_client::WorkerClient, AssignDisposition, AssignRequest};
use crate::jobs::JobStore;
use crate::service_registry::ServiceRegistry;

/// Minimum delay between dispatch rounds, in seconds.
const MIN_DISPATCH_INTERVAL: u64 = 1;

/// What a worker told us about an assignment attempt.
enum Assignment {
    Accepted,
    Refused,
    Rejected(String),
}

/// Pushes queued jobs to the least loaded service that will take them.
///
/// Each round works on a load snapshot: every accepted job bumps the
/// snapshot so later jobs in the same round see the host filling up. Jobs in
/// `Restart` (recovered from a lost host) are dispatched before the regular
/// queue.
pub struct Dispatcher {
    store: Arc<Mutex<JobStore>>,
    services: Arc<Mutex<ServiceRegistry>>,
    interval_secs: u64,

    /// Whether a job bigger than every host may reserve the biggest host.
    accept_oversized: bool,

    /// Jobs waiting for a specific host to free up, and the host reserved
    /// for them. Reserved hosts get no other dispatchable work.
    priority_list: HashMap<JobId, String>,

    /// Cached worker connections by host base URL.
    clients: HashMap<String, WorkerClient<Channel>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Mutex<JobStore>>,
        services: Arc<Mutex<ServiceRegistry>>,
        interval_secs: u64,
        accept_oversized: bool,
    ) -> Self {
        Self {
            store,
            services,
            interval_secs,
            accept_oversized,
            priority_list: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        if self.interval_secs == 0 {
            info!("job dispatching is disabled");
            return;
        }
        let secs = self.interval_secs.max(MIN_DISPATCH_INTERVAL);
        info!("job dispatching every {}s", secs);

        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.dispatch_round().await;
        }
    }

    async fn dispatch_round(&mut self) {
        debug!("starting job dispatch");

        {
            let store = self.store.lock().await;
            prune_priority_list(&mut self.priority_list, &store);
        }

        // Job types that refused work this round; no point asking again
        // until the next round.
        let mut undispatchable: HashSet<String> = HashSet::new();

        for status in [JobStatus::Restart, JobStatus::Queued] {
            let ids = { self.store.lock().await.dispatchable_with_status(status) };
            if ids.is_empty() {
                continue;
            }

            let mut system_load = {
                let store = self.store.lock().await;
                let current = store.current_loads();
                self.services.lock().await.system_load(&current)
            };

            for id in ids {
                self.dispatch_one(id, &mut system_load, &mut undispatchable)
                    .await;
            }
        }

        debug!("finished job dispatch");
    }

    async fn dispatch_one(
        &mut self,
        id: JobId,
        system_load: &mut SystemLoad,
        undispatchable: &mut HashSet<String>,
    ) {
        let job = {
            let store = self.store.lock().await;
            match store.get(id) {
                Some(j) => j.clone(),
                None => return,
            }
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Restart) {
            // Raced with a cancel or another update since the scan.
            return;
        }

        let signature = format!("{}@{}", job.job_type, job.operation);
        if undispatchable.contains(&signature) && !self.priority_list.contains_key(&id) {
            trace!("skipping {} for this round of dispatching", job);
            return;
        }

        // Root jobs, and children whose siblings are already running, only
        // start when there is spare capacity; a child whose tree has nothing
        // running yet uses the full service list so the tree never deadlocks
        // waiting on itself.
        let require_capacity = match job.parent_id {
            None => true,
            Some(parent) => self.store.lock().await.has_running_children(parent),
        };

        let candidates = {
            let services = self.services.lock().await;
            let priority_list = &self.priority_list;
            services.candidates(&job.job_type, system_load, require_capacity, |host| {
                let reserved_for_other = priority_list
                    .iter()
                    .any(|(jid, h)| *jid != id && h == host);
                let own_reservation = priority_list.get(&id).map_or(true, |h| h == host);
                !reserved_for_other && own_reservation
            })
        };

        if candidates.is_empty() {
            debug!("no service available to handle jobs of type {}", job.job_type);
            undispatchable.insert(signature);
            return;
        }

        {
            let mut store = self.store.lock().await;
            let Some(j) = store.get_mut(id) else { return };
            if j.set_status(JobStatus::Dispatching).is_err() {
                return;
            }
            j.dispatch_attempts += 1;
        }

        let highest_max = highest_max_load(&candidates, system_load);
        let oversized = job.job_load > highest_max;

        let mut tried = false;
        for service in &candidates {
            // An oversized job only makes sense on the biggest host class.
            if oversized
                && system_load
                    .get(&service.host)
                    .map_or(true, |n| n.max_load < highest_max)
            {
                continue;
            }
            tried = true;

            debug!(
                "trying to dispatch {} (load {}) to {}",
                job, job.job_load, service.host
            );
            match self.assign(&service.host, &job).await {
                Ok(Assignment::Accepted) => {
                    {
                        let mut store = self.store.lock().await;
                        if let Some(j) = store.get_mut(id) {
                            j.processor_host = Some(service.host.clone());
                        }
                    }
                    system_load.update_node_load(&service.host, job.job_load);
                    self.priority_list.remove(&id);
                    debug!("{} dispatched to {}", job, service.host);
                    return;
                }
                Ok(Assignment::Refused) => {
                    debug!("service {} refused to accept {}", service, job);
                    continue;
                }
                Ok(Assignment::Rejected(detail)) => {
                    warn!("service {} rejected {}: {}", service, job, detail);
                    let mut store = self.store.lock().await;
                    if let Some(j) = store.get_mut(id) {
                        if j.set_status(JobStatus::Failed).is_ok() {
                            j.failure_reason = Some(detail);
                        }
                    }
                    return;
                }
                Err(e) => {
                    // Try the next host; the heartbeat monitor will deal
                    // with the unreachable one.
                    warn!("unable to dispatch {} to {}: {}", job, service.host, e);
                    continue;
                }
            }
        }

        if tried && self.accept_oversized && oversized && !self.priority_list.contains_key(&id) {
            if let Some(biggest) = biggest_host(&candidates, system_load) {
                debug!("reserving {} for oversized {}", biggest, job);
                self.priority_list.insert(id, biggest);
            }
        }

        // Every candidate refused; put the job back into the queue for the
        // next round.
        {
            let mut store = self.store.lock().await;
            if let Some(j) = store.get_mut(id) {
                if j.set_status(JobStatus::Queued).is_ok() {
                    j.processor_host = None;
                }
            }
        }
        debug!("unable to dispatch {}, no service currently ready", job);
    }

    async fn assign(&mut self, host: &str, job: &Job) -> Result<Assignment, RegistryError> {
        if !self.clients.contains_key(host) {
            let client = WorkerClient::connect(host.to_string())
                .await
                .map_err(|e| RegistryError::Transport(e.to_string()))?;
            self.clients.insert(host.to_string(), client);
        }
        let client = self.clients.get_mut(host).unwrap();

        let request = tonic::Request::new(AssignRequest {
            job_id: job.id,
            job_type: job.job_type.clone(),
            operation: job.operation.clone(),
            arguments: job.arguments.clone(),
            payload: job.payload.clone().unwrap_or_default(),
            job_load: job.job_load,
        });

        let reply = match client.assign(request).await {
            Ok(reply) => reply.into_inner(),
            Err(status) => {
                // Drop the cached channel so the next attempt reconnects.
                self.clients.remove(host);
                return Err(RegistryError::Transport(status.to_string()));
            }
        };

        match AssignDisposition::try_from(reply.disposition) {
            Ok(AssignDisposition::AssignAccepted) => Ok(Assignment::Accepted),
            Ok(AssignDisposition::AssignRefused) => Ok(Assignment::Refused),
            Ok(AssignDisposition::AssignRejected) => Ok(Assignment::Rejected(reply.detail)),
            Err(_) => Err(RegistryError::Transport(format!(
                "unknown assign disposition {}",
                reply.disposition
            ))),
        }
    }
}

/// Drop priority entries for jobs that no longer wait for dispatch.
fn prune_priority_list(priority_list: &mut HashMap<JobId, String>, store: &JobStore) {
    priority_list.retain(|id, _| {
        store
            .get(*id)
            .map(|j| j.dispatchable && matches!(j.status, JobStatus::Queued | JobStatus::Restart))
            .unwrap_or(false)
    });
}

fn highest_max_load(candidates: &[ServiceRegistration], load: &SystemLoad) -> f32 {
    candidates
        .iter()
        .filter_map(|s| load.get(&s.host))
        .map(|n| n.max_load)
        .fold(0.0, f32::max)
}

fn biggest_host(candidates: &[ServiceRegistration], load: &SystemLoad) -> Option<String> {
    candidates
        .iter()
        .filter_map(|s| load.get(&s.host))
        .max_by(|a, b| {
            a.max_load
                .partial_cmp(&b.max_load)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|n| n.host.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeLoad;

    fn load_with(hosts: &[(&str, f32, f32)]) -> SystemLoad {
        let mut load = SystemLoad::new();
        for (host, current, max) in hosts {
            load.add(NodeLoad::new(*host, *current, *max));
        }
        load
    }

    fn service(host: &str) -> ServiceRegistration {
        ServiceRegistration::new("crop", host, true)
    }

    #[test]
    fn highest_max_load_over_candidates() {
        let load = load_with(&[("http://a", 0.0, 4.0), ("http://b", 0.0, 8.0)]);
        let candidates = vec![service("http://a"), service("http://b")];
        assert_eq!(highest_max_load(&candidates, &load), 8.0);
        assert_eq!(biggest_host(&candidates, &load).unwrap(), "http://b");
    }

    #[test]
    fn priority_list_pruning() {
        let mut store = JobStore::new();
        let queued = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        let done = store
            .create_job("crop", "crop", vec![], None, "http://r", true, 1.0, None)
            .unwrap();
        store.get_mut(done.id).unwrap().status = JobStatus::Finished;

        let mut list = HashMap::new();
        list.insert(queued.id, "http://a".to_string());
        list.insert(done.id, "http://a".to_string());
        list.insert(999, "http://a".to_string());

        prune_priority_list(&mut list, &store);
        assert_eq!(list.len(), 1);
        assert!(list.contains_key(&queued.id));
    }
}
