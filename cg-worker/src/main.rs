use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};

mod core;
use core::{
    HostRequest, RegisterHostRequest, RegisterServiceRequest, RegistryClient, WorkerNode,
    WorkerServer,
};

mod args;
use args::Args;

async fn start_server(node: WorkerNode, port: u16) {
    tokio::task::spawn(async move {
        let addr = match format!("[::1]:{}", port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("bad listen address: {}", e);
                return;
            }
        };
        info!("worker listening on {}", addr);

        let _ = Server::builder()
            .add_service(WorkerServer::new(node))
            .serve(addr)
            .await;
    });
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let max_load = args.max_load.unwrap_or(cores as f32);
    let base_url = format!("http://[::1]:{}", args.port);

    let node = WorkerNode::new(base_url.clone(), args.registry.clone(), max_load);
    start_server(node, args.port).await;

    let mut client = RegistryClient::connect(args.registry).await?;
    let request = tonic::Request::new(RegisterHostRequest {
        base_url: base_url.clone(),
        address: "::1".to_string(),
        memory: args.memory,
        cores,
        max_load,
    });
    client.register_host(request).await?;
    info!("host registered as {} (max load {})", base_url, max_load);

    for service_type in operations::service_types() {
        let request = tonic::Request::new(RegisterServiceRequest {
            service_type: service_type.to_string(),
            host: base_url.clone(),
            job_producer: true,
        });
        client.register_service(request).await?;
        info!("offering {} jobs", service_type);
    }

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("worker shutting down");
            let request = tonic::Request::new(HostRequest {
                base_url: base_url.clone(),
            });
            client.unregister_host(request).await?;
            Ok(())
        }
        Err(err) => {
            error!("unable to listen for shutdown signal: {}", err);
            Err(format!("unable to listen for shutdown signal: {}", err).into())
        }
    }
}
