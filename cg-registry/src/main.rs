mod args;
mod core;
mod dispatcher;
mod jobs;
mod monitor;
mod service_registry;

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tonic::transport::Server;
use tracing::info;

use args::Args;
use core::{RegistryNode, RegistryServer};
use dispatcher::Dispatcher;
use jobs::JobStore;
use monitor::HeartbeatMonitor;
use service_registry::ServiceRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let addr = format!("[::1]:{}", args.port).parse()?;
    let base_url = format!("http://[::1]:{}", args.port);
    info!("registry listening on {}", addr);

    let no_error_state_types: HashSet<String> = args
        .no_error_state_types
        .iter()
        .filter(|t| !t.is_empty())
        .cloned()
        .collect();

    let store = Arc::new(Mutex::new(JobStore::new()));
    let services = Arc::new(Mutex::new(ServiceRegistry::new(
        args.max_attempts,
        !args.no_error_states,
        no_error_state_types,
    )));

    let dispatcher = Dispatcher::new(
        store.clone(),
        services.clone(),
        args.dispatch_interval,
        args.accept_oversized_jobs,
    );
    tokio::spawn(dispatcher.run());

    let monitor = HeartbeatMonitor::new(store.clone(), services.clone(), args.heartbeat_interval);
    tokio::spawn(monitor.run());

    let node = RegistryNode::new(base_url, store, services);
    Server::builder()
        .add_service(RegistryServer::new(node))
        .serve(addr)
        .await?;

    Ok(())
}
