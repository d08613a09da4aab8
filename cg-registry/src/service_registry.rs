use std::collections::{HashMap, HashSet};

use common::{
    HostRegistration, Job, JobStatus, NodeLoad, RegistryError, ServiceRegistration, ServiceState,
    SystemLoad,
};
use tracing::{debug, info, trace, warn};

/// Jobs that failed because their input data was bad carry this reason; those
/// failures say nothing about the health of the service that ran them.
pub const FAILURE_REASON_DATA: &str = "data";

/// Registry of hosts and the services they offer.
#[derive(Debug)]
pub struct ServiceRegistry {
    hosts: HashMap<String, HostRegistration>,
    services: Vec<ServiceRegistration>,

    /// Failed jobs on a warning service before it goes into the error state.
    max_attempts_before_error: u32,

    /// Error states can be switched off wholesale.
    error_states_enabled: bool,

    /// Service types that never escalate past warning.
    no_error_state_types: HashSet<String>,
}

impl ServiceRegistry {
    pub fn new(
        max_attempts_before_error: u32,
        error_states_enabled: bool,
        no_error_state_types: HashSet<String>,
    ) -> Self {
        Self {
            hosts: HashMap::new(),
            services: Vec::new(),
            max_attempts_before_error,
            error_states_enabled,
            no_error_state_types,
        }
    }

    //
    // Host registrations.
    //

    /// Register (or re-register) a host. Re-registration refreshes the
    /// capacity figures and brings the host back online.
    pub fn register_host(&mut self, registration: HostRegistration) {
        info!(
            "registering host {} (max load {})",
            registration.base_url, registration.max_load
        );
        self.hosts
            .insert(registration.base_url.clone(), registration);
    }

    /// Drop a host and mark all of its services offline. The caller is
    /// responsible for orphaning the jobs that were in flight there.
    pub fn unregister_host(&mut self, base_url: &str) -> Result<(), RegistryError> {
        self.hosts
            .remove(base_url)
            .ok_or_else(|| RegistryError::HostNotFound(base_url.to_string()))?;
        for service in self.services.iter_mut().filter(|s| s.host == base_url) {
            service.online = false;
        }
        info!("unregistered host {}", base_url);
        Ok(())
    }

    pub fn enable_host(&mut self, base_url: &str) -> Result<(), RegistryError> {
        self.host_mut(base_url)?.active = true;
        Ok(())
    }

    pub fn disable_host(&mut self, base_url: &str) -> Result<(), RegistryError> {
        self.host_mut(base_url)?.active = false;
        Ok(())
    }

    /// Hosts in maintenance keep their running jobs but receive no new ones.
    pub fn set_maintenance(&mut self, base_url: &str, maintenance: bool) -> Result<(), RegistryError> {
        self.host_mut(base_url)?.maintenance = maintenance;
        info!("maintenance mode for {} set to {}", base_url, maintenance);
        Ok(())
    }

    pub fn host(&self, base_url: &str) -> Option<&HostRegistration> {
        self.hosts.get(base_url)
    }

    pub fn hosts(&self) -> Vec<HostRegistration> {
        let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.base_url.cmp(&b.base_url));
        hosts
    }

    fn host_mut(&mut self, base_url: &str) -> Result<&mut HostRegistration, RegistryError> {
        self.hosts
            .get_mut(base_url)
            .ok_or_else(|| RegistryError::HostNotFound(base_url.to_string()))
    }

    //
    // Service registrations.
    //

    pub fn register_service(&mut self, registration: ServiceRegistration) -> Result<(), RegistryError> {
        if !self.hosts.contains_key(&registration.host) {
            return Err(RegistryError::HostNotFound(registration.host));
        }
        if let Some(existing) = self.service_mut(&registration.service_type, &registration.host) {
            existing.online = true;
            existing.job_producer = registration.job_producer;
            debug!("service {} came back online", existing);
            return Ok(());
        }
        info!("registering service {}", registration);
        self.services.push(registration);
        Ok(())
    }

    pub fn unregister_service(&mut self, service_type: &str, host: &str) -> Result<(), RegistryError> {
        let service = self
            .service_mut(service_type, host)
            .ok_or_else(|| RegistryError::ServiceNotFound {
                service_type: service_type.to_string(),
                host: host.to_string(),
            })?;
        service.online = false;
        warn!("marked service {}@{} offline", service_type, host);
        Ok(())
    }

    pub fn set_service_online(&mut self, service_type: &str, host: &str, online: bool) {
        if let Some(service) = self.service_mut(service_type, host) {
            service.online = online;
        }
    }

    /// Operator reset of a misbehaving service back to the normal state.
    pub fn sanitize(&mut self, service_type: &str, host: &str) -> Result<(), RegistryError> {
        let service = self
            .service_mut(service_type, host)
            .ok_or_else(|| RegistryError::ServiceNotFound {
                service_type: service_type.to_string(),
                host: host.to_string(),
            })?;
        info!("state reset to normal for {} through sanitize", service);
        service.set_state(ServiceState::Normal, 0);
        Ok(())
    }

    pub fn service(&self, service_type: &str, host: &str) -> Option<&ServiceRegistration> {
        self.services
            .iter()
            .find(|s| s.service_type == service_type && s.host == host)
    }

    fn service_mut(&mut self, service_type: &str, host: &str) -> Option<&mut ServiceRegistration> {
        self.services
            .iter_mut()
            .find(|s| s.service_type == service_type && s.host == host)
    }

    pub fn services(&self) -> &[ServiceRegistration] {
        &self.services
    }

    /// Job producers on hosts that are not in maintenance; these are the
    /// services the heartbeat monitor checks on. Offline services are
    /// included so that a worker that recovers is noticed.
    pub fn heartbeat_targets(&self) -> Vec<ServiceRegistration> {
        self.services
            .iter()
            .filter(|s| s.job_producer)
            .filter(|s| {
                self.hosts
                    .get(&s.host)
                    .map(|h| !h.maintenance)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    //
    // Load bookkeeping and candidate selection.
    //

    /// Snapshot of every registered host's load, given the per-host sums of
    /// in-flight job loads.
    pub fn system_load(&self, current: &HashMap<String, f32>) -> SystemLoad {
        let mut load = SystemLoad::new();
        for host in self.hosts.values() {
            load.add(NodeLoad::new(
                host.base_url.clone(),
                current.get(&host.base_url).copied().unwrap_or(0.0),
                host.max_load,
            ));
        }
        load
    }

    /// Services able to take a job of `job_type`, best host first.
    ///
    /// With `require_capacity` the host additionally must not be maxed out;
    /// that stricter mode is used for root jobs so new trees only start when
    /// there is room. `host_allowed` lets the dispatcher exclude hosts that
    /// are reserved for priority jobs.
    pub fn candidates(
        &self,
        job_type: &str,
        load: &SystemLoad,
        require_capacity: bool,
        host_allowed: impl Fn(&str) -> bool,
    ) -> Vec<ServiceRegistration> {
        let mut filtered: Vec<ServiceRegistration> = Vec::new();

        for service in &self.services {
            if service.service_type != job_type {
                continue;
            }
            if service.service_state == ServiceState::Error {
                trace!("not considering {}: error state", service);
                continue;
            }
            if !service.online {
                trace!("not considering {}: offline", service);
                continue;
            }
            let Some(host) = self.hosts.get(&service.host) else {
                trace!("not considering {}: host not registered", service);
                continue;
            };
            if !host.accepts_dispatch() {
                trace!("not considering {}: host does not accept dispatch", service);
                continue;
            }
            if !host_allowed(&service.host) {
                trace!("not considering {}: host reserved", service);
                continue;
            }
            if require_capacity {
                match load.get(&service.host) {
                    Some(node) if !node.exceeds_maximum() => {}
                    Some(_) => {
                        trace!("not considering {}: host is maxed out", service);
                        continue;
                    }
                    None => {
                        warn!("unable to determine load for host {}", service.host);
                        continue;
                    }
                }
            }
            filtered.push(service.clone());
        }

        filtered.sort_by(|a, b| load.compare_hosts(&a.host, &b.host));
        filtered
    }

    //
    // Failover state machine.
    //

    /// Fold a terminal job outcome into the service states.
    ///
    /// A failure first looks for sibling services of the same type that are
    /// already in warning/error because of the same job signature; if any
    /// exist the problem travels with the job, so those services are
    /// de-escalated instead of the current one being punished. Otherwise the
    /// processing service escalates normal -> warning -> error, the last step
    /// gated on the failure history reaching the configured attempts.
    pub fn record_job_outcome(&mut self, job: &Job, failed_history: u32) {
        if job.status != JobStatus::Failed && job.status != JobStatus::Finished {
            return;
        }
        let Some(processor) = job.processor_host.clone() else {
            return;
        };
        if self.service(&job.job_type, &processor).is_none() {
            return;
        }
        let signature = job.signature();

        if job.status == JobStatus::Failed
            && job.failure_reason.as_deref() != Some(FAILURE_REASON_DATA)
        {
            let related: Vec<(String, String)> = self
                .services
                .iter()
                .filter(|s| s.service_type == job.job_type)
                .filter(|s| !(s.host == processor))
                .filter(|s| {
                    (s.service_state == ServiceState::Warning
                        && s.warning_state_trigger == signature)
                        || (s.service_state == ServiceState::Error
                            && s.error_state_trigger == signature)
                })
                .map(|s| (s.service_type.clone(), s.host.clone()))
                .collect();

            if !related.is_empty() {
                // The same work already broke other services: blame the job.
                for (service_type, host) in related {
                    let service = self.service_mut(&service_type, &host).unwrap();
                    match service.service_state {
                        ServiceState::Warning => {
                            info!("state reset to normal for related service {}", service);
                            service.set_state(ServiceState::Normal, 0);
                        }
                        ServiceState::Error => {
                            info!("state reset to warning for related service {}", service);
                            let trigger = service.warning_state_trigger;
                            service.set_state(ServiceState::Warning, trigger);
                        }
                        ServiceState::Normal => {}
                    }
                }
                return;
            }

            let escalate_to_error = self.error_states_enabled
                && !self.no_error_state_types.contains(&job.job_type)
                && failed_history >= self.max_attempts_before_error;
            let service = self.service_mut(&job.job_type, &processor).unwrap();
            match service.service_state {
                ServiceState::Normal => {
                    info!("state set to warning for {}", service);
                    service.set_state(ServiceState::Warning, signature);
                }
                ServiceState::Warning if escalate_to_error => {
                    warn!("state set to error for {}", service);
                    service.set_state(ServiceState::Error, signature);
                }
                _ => {}
            }
        } else if job.status == JobStatus::Finished {
            let service = self.service_mut(&job.job_type, &processor).unwrap();
            if service.service_state == ServiceState::Warning {
                info!("state reset to normal for {}", service);
                service.set_state(ServiceState::Normal, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Job;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(2, true, HashSet::new())
    }

    fn worker_host(url: &str, max_load: f32) -> HostRegistration {
        HostRegistration::new(url, "127.0.0.1", 8 << 30, 8, max_load)
    }

    fn populated() -> ServiceRegistry {
        let mut reg = registry();
        reg.register_host(worker_host("http://w1", 4.0));
        reg.register_host(worker_host("http://w2", 8.0));
        reg.register_service(ServiceRegistration::new("crop", "http://w1", true))
            .unwrap();
        reg.register_service(ServiceRegistration::new("crop", "http://w2", true))
            .unwrap();
        reg
    }

    fn loads(reg: &ServiceRegistry, w1: f32, w2: f32) -> SystemLoad {
        let mut current = HashMap::new();
        current.insert("http://w1".to_string(), w1);
        current.insert("http://w2".to_string(), w2);
        reg.system_load(&current)
    }

    fn failed_job(processor: &str) -> Job {
        let mut job = Job::new(7, "crop", "crop", vec!["x".into()], "http://reg", true, 1.0);
        job.status = JobStatus::Failed;
        job.processor_host = Some(processor.to_string());
        job
    }

    #[test]
    fn service_registration_requires_host() {
        let mut reg = registry();
        let res = reg.register_service(ServiceRegistration::new("crop", "http://nowhere", true));
        assert!(res.is_err());
    }

    #[test]
    fn candidates_sorted_by_load_factor() {
        let reg = populated();
        // w1 at 50%, w2 at 12.5%
        let load = loads(&reg, 2.0, 1.0);
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].host, "http://w2");
    }

    #[test]
    fn maintenance_host_is_skipped() {
        let mut reg = populated();
        reg.set_maintenance("http://w2", true).unwrap();
        let load = loads(&reg, 0.0, 0.0);
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].host, "http://w1");
    }

    #[test]
    fn disabled_host_is_skipped() {
        let mut reg = populated();
        reg.disable_host("http://w1").unwrap();
        let load = loads(&reg, 0.0, 0.0);
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].host, "http://w2");
    }

    #[test]
    fn capacity_mode_drops_maxed_out_hosts() {
        let reg = populated();
        let load = loads(&reg, 4.0, 1.0);
        let c = reg.candidates("crop", &load, true, |_| true);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].host, "http://w2");
        // Without the capacity requirement the maxed host is still a candidate.
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn error_state_service_is_never_a_candidate() {
        let mut reg = populated();
        reg.service_mut("crop", "http://w1")
            .unwrap()
            .set_state(ServiceState::Error, 1);
        let load = loads(&reg, 0.0, 0.0);
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].host, "http://w2");
    }

    #[test]
    fn first_failure_sets_warning() {
        let mut reg = populated();
        reg.record_job_outcome(&failed_job("http://w1"), 1);
        let s = reg.service("crop", "http://w1").unwrap();
        assert_eq!(s.service_state, ServiceState::Warning);
        assert_eq!(s.warning_state_trigger, failed_job("http://w1").signature());
    }

    #[test]
    fn repeated_failures_escalate_to_error() {
        let mut reg = populated();
        reg.record_job_outcome(&failed_job("http://w1"), 1);
        reg.record_job_outcome(&failed_job("http://w1"), 2);
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Error
        );
    }

    #[test]
    fn same_job_failing_elsewhere_deescalates_siblings() {
        let mut reg = populated();
        // First failure on w1 puts it into warning.
        reg.record_job_outcome(&failed_job("http://w1"), 1);
        // The same job failing on w2 clears w1 instead of punishing w2.
        reg.record_job_outcome(&failed_job("http://w2"), 1);
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Normal
        );
        assert_eq!(
            reg.service("crop", "http://w2").unwrap().service_state,
            ServiceState::Normal
        );
    }

    #[test]
    fn data_failures_do_not_escalate() {
        let mut reg = populated();
        let mut job = failed_job("http://w1");
        job.failure_reason = Some(FAILURE_REASON_DATA.to_string());
        reg.record_job_outcome(&job, 1);
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Normal
        );
    }

    #[test]
    fn success_resets_warning() {
        let mut reg = populated();
        reg.record_job_outcome(&failed_job("http://w1"), 1);
        let mut job = failed_job("http://w1");
        job.status = JobStatus::Finished;
        // A different signature; any success on the service clears the warning.
        job.arguments = vec!["other".into()];
        reg.record_job_outcome(&job, 1);
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Normal
        );
    }

    #[test]
    fn unregistering_a_host_takes_services_offline() {
        let mut reg = populated();
        reg.unregister_host("http://w1").unwrap();
        assert!(!reg.service("crop", "http://w1").unwrap().online);
        let load = loads(&reg, 0.0, 0.0);
        let c = reg.candidates("crop", &load, false, |_| true);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn sanitize_resets_error_state() {
        let mut reg = populated();
        reg.record_job_outcome(&failed_job("http://w1"), 5);
        reg.record_job_outcome(&failed_job("http://w1"), 5);
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Error
        );
        reg.sanitize("crop", "http://w1").unwrap();
        assert_eq!(
            reg.service("crop", "http://w1").unwrap().service_state,
            ServiceState::Normal
        );
    }

    #[test]
    fn heartbeat_targets_exclude_maintenance() {
        let mut reg = populated();
        reg.set_maintenance("http://w1", true).unwrap();
        let targets = reg.heartbeat_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host, "http://w2");
    }
}
