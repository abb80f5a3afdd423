#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use switchyard::server;

#[derive(Parser)]
#[command(name = "switchyard", about = "Round-robin HTTP load balancer with service discovery")]
struct Cli {
    /// Path to balancer config file (optional)
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    /// Listen port; keeps the host of the configured listen address
    #[arg(short, long)]
    port: Option<u16>,

    /// Full listen address, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/backends/metrics), empty disables
    #[arg(long)]
    admin_listen: Option<String>,

    /// Service name to discover in Consul
    #[arg(long)]
    service_name: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workers = server::runtime::detect_worker_threads();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        port: cli.port,
        admin_listen: cli.admin_listen,
        service_name: cli.service_name,
        workers,
    }))
}
