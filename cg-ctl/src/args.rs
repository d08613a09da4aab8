use clap::{command, Parser, Subcommand};

//
// For parsing user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address of the registry node.
    #[arg(short, long, default_value = "http://[::1]:8030", global = true)]
    pub registry: String,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a job to the cluster.
    Submit {
        /// Service type that should handle the job.
        #[arg(short, long)]
        job_type: String,

        /// Operation to run.
        #[arg(short, long)]
        operation: String,

        /// Payload handed to the operation handler.
        #[arg(short, long)]
        payload: Option<String>,

        /// Load the job puts on its processor.
        #[arg(short, long, default_value_t = 1.0)]
        load: f32,

        /// Id of the parent job, if this is part of a job tree.
        #[arg(long)]
        parent: Option<u64>,

        /// Arguments to pass to the operation handler.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
    /// Show a single job.
    Job { id: u64 },
    /// Block until a job reaches the given status, or any terminal status.
    Wait {
        id: u64,

        /// Status to wait for. Terminal states always end the wait.
        #[arg(short, long)]
        status: Option<String>,

        /// Seconds between polls.
        #[arg(short, long, default_value_t = 2)]
        interval: u64,

        /// Give up after this many seconds.
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,
    },
    /// List jobs, optionally filtered by type and status.
    Jobs {
        #[arg(short, long)]
        job_type: Option<String>,

        /// One of: instantiated, queued, dispatching, running, finished,
        /// failed, canceled, restart.
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Cancel a job that has not been handed to a worker yet.
    Cancel { id: u64 },
    /// List registered hosts and their load.
    Hosts,
    /// List registered services and their health.
    Services,
    /// Take a host out of dispatching without unregistering it.
    Disable { host: String },
    /// Put a disabled host back into dispatching.
    Enable { host: String },
    /// Switch maintenance mode for a host on or off.
    Maintenance { host: String, maintenance: bool },
    /// Reset a service that got stuck in the error state.
    Sanitize { job_type: String, host: String },
}

pub fn parse_args() -> Args {
    Args::parse()
}
