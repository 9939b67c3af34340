//! keymqd: run the keymq broker.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use keymq::{HttpInvoker, KEYMQ_VERSION, LoggingDispatch, ServerConfig, WebhookConfig};

#[derive(Parser, Debug)]
#[command(name = "keymqd", version, about = "Key-addressed message broker")]
struct Args {
    /// Address to bind listeners on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for producer/consumer clients
    #[arg(short = 'l', long = "listen", default_value_t = 12000)]
    port: u16,

    /// Port for worker processes (disabled when unset)
    #[arg(long = "worker-listen")]
    worker_port: Option<u16>,

    /// Runtime worker threads (default: available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Largest accepted message body in bytes
    #[arg(long, default_value_t = keymq::bridge::codec::DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let config = ServerConfig::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_max_body_size(self.max_body_size);
        match self.worker_port {
            Some(port) => config.with_worker_port(port),
            None => config,
        }
    }

    fn threads(&self) -> usize {
        self.threads
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    keymq::logging::init();

    let threads = args.threads();
    tracing::info!(version = KEYMQ_VERSION, threads, "Starting keymqd");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let invoker = HttpInvoker::new(WebhookConfig::default())
            .context("failed to build webhook client")?;
        keymq::serve(args.server_config(), Arc::new(invoker), Arc::new(LoggingDispatch)).await
    })
}
