mod args;
use args::{parse_args, Commands};

mod core;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    let registry = args.registry;

    match args.command {
        Commands::Submit {
            job_type,
            operation,
            payload,
            load,
            parent,
            args,
        } => core::submit(registry, job_type, operation, args, payload, load, parent).await?,
        Commands::Job { id } => core::job(registry, id).await?,
        Commands::Wait {
            id,
            status,
            interval,
            timeout,
        } => core::wait(registry, id, status, interval, timeout).await?,
        Commands::Jobs { job_type, status } => core::jobs(registry, job_type, status).await?,
        Commands::Cancel { id } => core::cancel(registry, id).await?,
        Commands::Hosts => core::hosts(registry).await?,
        Commands::Services => core::services(registry).await?,
        Commands::Disable { host } => core::disable(registry, host).await?,
        Commands::Enable { host } => core::enable(registry, host).await?,
        Commands::Maintenance { host, maintenance } => {
            core::maintenance(registry, host, maintenance).await?
        }
        Commands::Sanitize { job_type, host } => core::sanitize(registry, job_type, host).await?,
    }

    Ok(())
}
