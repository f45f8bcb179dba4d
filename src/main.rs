//! UniversalHash hashing service
//!
//! Serves proof-of-work hashes over HTTP from a pool of worker threads.
//!
//! # Commands
//!
//! - (none) - Run the HTTP service
//! - `benchmark` - Measure single and pipelined hash rates locally

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use uhash_service::config::{DEFAULT_HOST, DEFAULT_PORT};
use uhash_service::{http, ContextFactory, Flags, Service, ServiceConfig};

#[derive(Parser)]
#[command(name = "uhash-service")]
#[command(author = "Cyberia")]
#[command(version)]
#[command(about = "UniversalHash proof-of-work hashing over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Bind to a specific host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Bind to a specific port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of worker threads (default: number of CPU cores)
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    /// Context flags: 1 = full memory, 2 = large pages (default: probe with fallback)
    #[arg(long, global = true)]
    flags: Option<u32>,

    /// Origin allowed to make cross-origin requests
    #[arg(long)]
    origin: Option<String>,

    /// Log every HTTP request
    #[arg(long)]
    log: bool,

    /// Number of 64-byte dataset items
    #[arg(long, global = true)]
    dataset_items: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure hash rates with the configured context
    Benchmark {
        /// Number of hashes to compute per mode
        #[arg(short, long, default_value = "64")]
        count: u32,
    },
}

impl Cli {
    fn config(&self) -> ServiceConfig {
        let mut config = ServiceConfig {
            host: self.host.clone(),
            port: self.port,
            flags: self.flags.map(Flags::from_bits),
            origin: self.origin.clone(),
            log_requests: self.log,
            ..ServiceConfig::default()
        };
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(items) = self.dataset_items {
            config.tables.dataset_items = items;
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    let result = match cli.command {
        None => cmd_serve(config),
        Some(Commands::Benchmark { count }) => cmd_benchmark(config, count),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn cmd_serve(config: ServiceConfig) -> anyhow::Result<()> {
    info!("Initializing service...");
    let service =
        Arc::new(Service::new(&config).context("failed to initialize the hashing context")?);

    let state = service.state();
    info!("Threads: {}", state.threads());
    info!("Flags: {}", state.flags());
    if let Some(origin) = state.origin() {
        info!("Allowed origin: {}", origin);
    }
    if state.log_requests() {
        info!("Request logging enabled");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let address = config.bind_address();
        let listener = TcpListener::bind(address.as_str())
            .await
            .with_context(|| format!("failed to bind {}", address))?;
        info!("Listening on {}", listener.local_addr()?);

        http::serve(listener, Arc::clone(&service), shutdown_signal()).await?;
        anyhow::Ok(())
    })?;

    service.shutdown();
    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

fn cmd_benchmark(config: ServiceConfig, count: u32) -> anyhow::Result<()> {
    let mut factory = ContextFactory::new(config.flags, config.tables)?;
    println!("Flags: {}", factory.flags());

    let start = Instant::now();
    factory.reseed(b"benchmark seed", config.threads.max(1))?;
    println!("Seeded in {:.2}s", start.elapsed().as_secs_f64());

    let inputs: Vec<Vec<u8>> = (0..count).map(|i| i.to_le_bytes().to_vec()).collect();
    let mut machine = factory.create_machine();

    println!("\nRunning benchmark with {} hashes per mode...", count);

    let start = Instant::now();
    for input in &inputs {
        machine.hash(input)?;
    }
    let single = start.elapsed();

    let start = Instant::now();
    machine.hash_batch(&inputs)?;
    let pipelined = start.elapsed();

    println!("\nResults:");
    println!(
        "  Single:    {:.2} H/s",
        count as f64 / single.as_secs_f64()
    );
    println!(
        "  Pipelined: {:.2} H/s",
        count as f64 / pipelined.as_secs_f64()
    );

    println!("\nContext parameters:");
    println!("  Scratchpad memory: {} MB", uhash_core::TOTAL_MEMORY / (1024 * 1024));
    println!("  Cache: {} KB", config.tables.cache_bytes / 1024);
    println!("  Dataset: {} items", config.tables.dataset_items);

    Ok(())
}
