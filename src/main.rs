use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gantry::config::{GantryConfig, TlsConfig};
use gantry::db::MemDb;
use gantry::scm::FixedScm;
use gantry::server::Server;
use gantry::shutdown::install_shutdown_handler;
use gantry::store::grpc::GrpcStore;
use gantry::store::{CoordStore, MemStore};
use gantry::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "gantry-server")]
#[command(about = "CI control plane: job scheduler and worker registry")]
struct Args {
    /// Coordination store endpoint (host:port)
    #[arg(long, default_value = "127.0.0.1:2379")]
    store_addr: String,

    /// Run with an in-process coordination store (single node)
    #[arg(long)]
    standalone: bool,

    /// CA certificate for verifying worker certificates
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Certificate presented to workers
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Private key for the presented certificate
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Permit plaintext worker connections (local clusters only)
    #[arg(long)]
    allow_insecure: bool,

    /// Usage samples retained per worker
    #[arg(long, default_value = "120")]
    usage_retention: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tls_config = TlsConfig {
        enabled: args.tls_ca.is_some(),
        ca_cert_path: args.tls_ca,
        cert_path: args.tls_cert,
        key_path: args.tls_key,
        allow_insecure: args.allow_insecure,
    };
    let config = GantryConfig {
        store_addr: args.store_addr,
        standalone: args.standalone,
        usage_retention: args.usage_retention,
        tls: tls_config,
        ..GantryConfig::default()
    };

    let tls = if config.tls.is_complete() {
        Some(TlsIdentity::load(&config.tls).await?)
    } else {
        None
    };

    let store: Arc<dyn CoordStore> = if config.standalone {
        tracing::info!("using in-process coordination store");
        Arc::new(MemStore::new())
    } else {
        tracing::info!(addr = %config.store_addr, "connecting to coordination store");
        Arc::new(GrpcStore::connect(&config.store_addr, None).await?)
    };

    let db = Arc::new(MemDb::new());
    // TODO: wire provider-backed SCM clients once the HTTP surface lands.
    let scm = Arc::new(FixedScm::new());

    let cancel_token = install_shutdown_handler();
    let server = Server::new(
        config,
        store,
        db.clone(),
        db.clone(),
        db,
        scm,
        tls,
        cancel_token,
    );

    tracing::info!("starting gantry server");
    server.run().await?;

    Ok(())
}
