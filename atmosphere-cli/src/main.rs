mod config;
mod debug_http;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use atmosphere_core::node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::CliArgs::parse();

    // JSON logs in production (ATMOSPHERE_LOG_JSON=1), human-readable otherwise.
    let json_logs = args.log_json;
    let filter = EnvFilter::from_default_env().add_directive("atmosphere_cli=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let name = args.name.clone();
    let debug_http_addr = args.debug_http_addr;
    let mesh_config = args.resolve()?;

    tracing::info!(
        mesh_id = %mesh_config.mesh_id,
        app_id = %mesh_config.app_id,
        data_dir = %mesh_config.data_dir.display(),
        "opening mesh node"
    );
    let node = Node::open(mesh_config, &name)?;

    let port = node.start_mesh().await?;
    tracing::info!(port, "mesh transports started");

    if let Some(addr) = debug_http_addr {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = debug_http::serve(addr, node, shutdown_signal()).await {
                tracing::error!(error = %e, "debug HTTP surface exited");
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping mesh node");
    node.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
