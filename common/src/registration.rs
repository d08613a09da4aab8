use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of a single service registration.
///
/// `Warning` and `Error` are driven by job outcomes: the first failure of a
/// given job signature on a service puts it into `Warning`, repeated failures
/// escalate to `Error`, and the dispatcher stops considering `Error` services
/// entirely until an operator sanitizes them or a success resets the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Normal,
    Warning,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Normal => write!(f, "normal"),
            ServiceState::Warning => write!(f, "warning"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

/// A node that takes part in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRegistration {
    /// Base URL the host's gRPC endpoints are reachable under.
    pub base_url: String,

    /// IP address, for operator display only.
    pub address: String,

    /// Bytes of memory on the node.
    pub memory: u64,

    pub cores: u32,

    /// Largest total job load this host will carry.
    pub max_load: f32,

    /// Set to false when the heartbeat monitor gives up on the host.
    pub online: bool,

    /// Operators can disable a host without unregistering it.
    pub active: bool,

    /// Hosts in maintenance mode keep running jobs but get no new ones.
    pub maintenance: bool,
}

impl HostRegistration {
    pub fn new(
        base_url: impl Into<String>,
        address: impl Into<String>,
        memory: u64,
        cores: u32,
        max_load: f32,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            address: address.into(),
            memory,
            cores,
            max_load,
            online: true,
            active: true,
            maintenance: false,
        }
    }

    /// Whether the dispatcher may send new work here.
    pub fn accepts_dispatch(&self) -> bool {
        self.online && self.active && !self.maintenance
    }
}

/// A single capability (service type) offered by a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_type: String,

    /// Base URL of the host this service runs on.
    pub host: String,

    pub online: bool,

    /// Job producers accept dispatched jobs and are heartbeat-checked.
    pub job_producer: bool,

    pub service_state: ServiceState,

    /// Signature of the job that moved this service into `Warning`.
    pub warning_state_trigger: u64,

    /// Signature of the job that moved this service into `Error`.
    pub error_state_trigger: u64,
}

impl ServiceRegistration {
    pub fn new(service_type: impl Into<String>, host: impl Into<String>, job_producer: bool) -> Self {
        Self {
            service_type: service_type.into(),
            host: host.into(),
            online: true,
            job_producer,
            service_state: ServiceState::Normal,
            warning_state_trigger: 0,
            error_state_trigger: 0,
        }
    }

    pub fn set_state(&mut self, state: ServiceState, trigger: u64) {
        match state {
            ServiceState::Warning => self.warning_state_trigger = trigger,
            ServiceState::Error => self.error_state_trigger = trigger,
            ServiceState::Normal => {}
        }
        self.service_state = state;
    }
}

impl fmt::Display for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_type, self.host)
    }
}
