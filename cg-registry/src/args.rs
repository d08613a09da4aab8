use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "castgrid service registry and job dispatcher")]
pub struct Args {
    /// Port the registry gRPC server listens on.
    #[arg(short, long, default_value_t = 8030)]
    pub port: u16,

    /// Seconds between dispatch rounds. 0 disables dispatching.
    #[arg(long, default_value_t = 2)]
    pub dispatch_interval: u64,

    /// Seconds between heartbeat passes over the registered job producers.
    /// 0 disables the monitor.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// Failed jobs on a service before it is put into the error state.
    #[arg(long, default_value_t = 10)]
    pub max_attempts: u32,

    /// Disable the warning/error service states entirely.
    #[arg(long, default_value_t = false)]
    pub no_error_states: bool,

    /// Service types that never enter the error state.
    #[arg(long, value_delimiter = ',', default_value = "")]
    pub no_error_state_types: Vec<String>,

    /// Accept jobs whose load exceeds every host's maximum by reserving the
    /// biggest host for them.
    #[arg(long, default_value_t = true)]
    pub accept_oversized_jobs: bool,
}
