mod arm;
mod auth;
mod cache;
mod config;
mod cosmos;
mod error;
mod keyvault;
mod kusto;
mod rest;
mod server;
mod subscription;

use std::sync::Arc;

use anyhow::Context;
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use server::{AzureMcpServer, Services};

use crate::auth::CredentialResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Write structured logs to stderr so stdout stays clean for MCP JSON-RPC.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_env("RUST_LOG")
                .add_directive("azure_data_mcp=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting azure-data-mcp v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::from_env()?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("azure-data-mcp/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let resolver = Arc::new(CredentialResolver::new(config::process_env(), http.clone()));
    let services = Services::new(&config, resolver, http);
    let purge_period = config.cache.list_ttl;

    let server = AzureMcpServer::new(config, services);
    let handle = server.clone();
    let purge = handle
        .cache()
        .spawn_purge_task(purge_period, handle.shutdown_token());

    let transport = stdio();

    tracing::info!("MCP server listening on stdio");

    let running = server.serve(transport).await?;
    running.waiting().await?;

    handle.shutdown();
    purge.await.context("cache purge task panicked")?;

    Ok(())
}
