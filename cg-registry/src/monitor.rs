use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use common::RegistryError;

use crate::core::worker::{worker_client::WorkerClient, PingRequest};
use crate::jobs::JobStore;
use crate::service_registry::ServiceRegistry;

/// What one heartbeat result means for a service.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// Responsive, nothing to do.
    Healthy,
    /// Responsive after being marked offline; bring it back.
    Revive,
    /// First consecutive miss; keep an eye on it.
    FirstStrike,
    /// Second consecutive miss; take it out of rotation.
    Takedown,
    /// Already offline and still not answering.
    StillOffline,
}

/// Watches the registered job producers and takes unresponsive ones out of
/// rotation.
///
/// A service gets one free miss: the first failed ping puts it on the watch
/// list, the second consecutive one marks it offline and parks its in-flight
/// jobs for redispatch. A service that answers again is taken off the list,
/// and an offline one that answers is brought back online.
pub struct HeartbeatMonitor {
    store: Arc<Mutex<JobStore>>,
    services: Arc<Mutex<ServiceRegistry>>,
    interval_secs: u64,

    /// Services that missed their last ping, keyed (service_type, host).
    unresponsive: Vec<(String, String)>,

    clients: HashMap<String, WorkerClient<Channel>>,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<Mutex<JobStore>>,
        services: Arc<Mutex<ServiceRegistry>>,
        interval_secs: u64,
    ) -> Self {
        Self {
            store,
            services,
            interval_secs,
            unresponsive: Vec::new(),
            clients: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        if self.interval_secs == 0 {
            info!("heartbeat monitor is disabled");
            return;
        }
        info!("heartbeat monitor running every {}s", self.interval_secs);

        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.pass().await;
        }
    }

    /// Fold one ping result into the watch list and decide what follows.
    fn record(&mut self, key: &(String, String), responsive: bool, online: bool) -> Verdict {
        let watched = self.unresponsive.iter().position(|k| k == key);
        if responsive {
            if let Some(pos) = watched {
                self.unresponsive.remove(pos);
            }
            if online {
                Verdict::Healthy
            } else {
                Verdict::Revive
            }
        } else if !online {
            Verdict::StillOffline
        } else if let Some(pos) = watched {
            self.unresponsive.remove(pos);
            Verdict::Takedown
        } else {
            self.unresponsive.push(key.clone());
            Verdict::FirstStrike
        }
    }

    async fn pass(&mut self) {
        debug!("checking for unresponsive services");

        let targets = { self.services.lock().await.heartbeat_targets() };
        for service in targets {
            let key = (service.service_type.clone(), service.host.clone());

            let responsive = match self.ping(&service.host).await {
                Ok(running) => {
                    debug!("service {} is responsive ({} running)", service, running);
                    true
                }
                Err(e) => {
                    debug!("unable to reach {}: {}", service, e);
                    false
                }
            };

            match self.record(&key, responsive, service.online) {
                Verdict::Healthy => {}
                Verdict::Revive => {
                    info!("service {} came back, marking it online", service);
                    let mut services = self.services.lock().await;
                    services.set_service_online(&service.service_type, &service.host, true);
                }
                Verdict::FirstStrike => {
                    warn!("added {} to the watch list", service);
                }
                Verdict::Takedown => {
                    warn!("marking {} as offline", service);
                    {
                        let mut services = self.services.lock().await;
                        let _ = services.unregister_service(&service.service_type, &service.host);
                    }
                    let orphaned = {
                        let mut store = self.store.lock().await;
                        store.orphan_jobs_for_service(&service.host, &service.service_type)
                    };
                    if !orphaned.is_empty() {
                        info!(
                            "parked {} jobs from {} for redispatch",
                            orphaned.len(),
                            service
                        );
                    }
                }
                Verdict::StillOffline => {
                    debug!("service {} is still offline", service);
                }
            }
        }

        debug!("finished checking for unresponsive services");
    }

    async fn ping(&mut self, host: &str) -> Result<u32, RegistryError> {
        if !self.clients.contains_key(host) {
            let client = WorkerClient::connect(host.to_string())
                .await
                .map_err(|e| RegistryError::Transport(e.to_string()))?;
            self.clients.insert(host.to_string(), client);
        }
        let client = self.clients.get_mut(host).unwrap();

        match client.ping(tonic::Request::new(PingRequest {})).await {
            Ok(reply) => Ok(reply.into_inner().running_jobs),
            Err(status) => {
                self.clients.remove(host);
                Err(RegistryError::Transport(status.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Arc::new(Mutex::new(JobStore::new())),
            Arc::new(Mutex::new(ServiceRegistry::new(2, true, HashSet::new()))),
            30,
        )
    }

    fn key(host: &str) -> (String, String) {
        ("crop".to_string(), host.to_string())
    }

    #[test]
    fn second_consecutive_miss_takes_the_service_down() {
        let mut m = monitor();
        let k = key("http://w1");
        assert_eq!(m.record(&k, false, true), Verdict::FirstStrike);
        assert_eq!(m.unresponsive, vec![k.clone()]);
        assert_eq!(m.record(&k, false, true), Verdict::Takedown);
        assert!(m.unresponsive.is_empty());
    }

    #[test]
    fn recovery_clears_the_watch_list() {
        let mut m = monitor();
        let k = key("http://w1");
        assert_eq!(m.record(&k, false, true), Verdict::FirstStrike);
        assert_eq!(m.record(&k, true, true), Verdict::Healthy);
        assert!(m.unresponsive.is_empty());
        // The next miss is a first strike again, not a takedown.
        assert_eq!(m.record(&k, false, true), Verdict::FirstStrike);
    }

    #[test]
    fn strikes_are_tracked_per_service() {
        let mut m = monitor();
        assert_eq!(m.record(&key("http://w1"), false, true), Verdict::FirstStrike);
        assert_eq!(m.record(&key("http://w2"), false, true), Verdict::FirstStrike);
        assert_eq!(m.record(&key("http://w1"), false, true), Verdict::Takedown);
        assert_eq!(m.unresponsive, vec![key("http://w2")]);
    }

    #[test]
    fn offline_service_is_revived_on_response() {
        let mut m = monitor();
        let k = key("http://w1");
        assert_eq!(m.record(&k, true, false), Verdict::Revive);
    }

    #[test]
    fn offline_misses_stay_off_the_watch_list() {
        let mut m = monitor();
        let k = key("http://w1");
        assert_eq!(m.record(&k, false, false), Verdict::StillOffline);
        assert!(m.unresponsive.is_empty());
    }
}
