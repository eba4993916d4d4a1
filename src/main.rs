//! Quota engine IPC server - main entry point.
//!
//! Loads configuration and the last snapshot, then runs the retention sweeper
//! and the msgpack IPC server until Ctrl-C, saving a snapshot on the way out.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use quota_engine::engine::RetentionService;
use quota_engine::ipc::IpcServer;
use quota_engine::store::{self, JsonFileStore};
use quota_engine::{Config, QuotaEngine};

#[derive(Parser, Debug)]
#[command(name = "quota-engine")]
#[command(version)]
#[command(about = "Multi-tenant quota allocation and enforcement server", long_about = None)]
struct Args {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long, env = "QUOTA_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot file loaded at startup and written on shutdown
    #[arg(short, long, env = "QUOTA_ENGINE_STATE")]
    state: Option<PathBuf>,

    /// Listen address, overriding config and environment
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    quota_engine::observability::init_tracing_with(&config.observability);

    let engine = Arc::new(QuotaEngine::new(config.engine.clone()));
    let state_store = args.state.map(JsonFileStore::new);
    if let Some(state) = &state_store {
        let loaded = store::load_into(&engine, state).await?;
        tracing::info!(path = %state.path().display(), loaded, "engine_state_load");
    }

    let retention = RetentionService::new(engine.clone(), config.retention.clone());
    let retention_task = retention.start();

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    let server = Arc::new(IpcServer::new(engine.clone(), addr, config.ipc.clone()));
    tracing::info!(
        addr = %addr,
        enforcement_period = %config.engine.enforcement_period,
        "quota_engine_starting"
    );

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown_signal_received");
        }
        result = serving => {
            // The server only returns on its own when binding or accepting fails.
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "ipc_server_failed"),
                Err(e) => tracing::error!(error = %e, "ipc_server_panicked"),
            }
        }
    }

    server.shutdown();
    retention.stop();
    if let Err(e) = retention_task.await {
        tracing::warn!(error = %e, "retention_task_join_failed");
    }

    if let Some(state) = &state_store {
        store::persist(&engine, state).await?;
    }
    tracing::info!("quota_engine_stopped");
    Ok(())
}
