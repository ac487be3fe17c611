/// Chain Graph Loader
///
/// A resumable pipeline that walks a Bitcoin-style chain through its node's
/// JSON-RPC interface and loads blocks, transactions, outputs, addresses and
/// the edges between them into PostgreSQL-backed document collections.
mod cli;
mod db;
mod error;
mod etl;
mod models;
mod pipeline;
mod progress;
mod rpc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use db::Database;
use progress::{format_block_time, format_number};
use rpc::{BitcoinRpcClient, ChainReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    cli.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level().into()))
        .init();

    println!("🚀 Starting Chain Graph Loader...");

    // Initialize RPC client
    let rpc_client = BitcoinRpcClient::new(
        cli.rpc_url.clone(),
        cli.rpc_user.clone(),
        cli.rpc_password.clone(),
        cli.rpc_timeout(),
    )
    .context("Failed to create RPC client")?;
    let endpoint = rpc_client.endpoint().to_string();
    let chain = ChainReader::new(rpc_client, cli.perf);

    // Test RPC connection
    let tip = chain.get_chain_tip().await.context("Failed to connect to node RPC")?;

    println!("✅ Connected to: {}", endpoint);
    println!("📦 Best block: {}", tip.hash);
    println!("🎯 Chain height: {}", format_number(tip.height));
    println!("⏰ Block time: {}", format_block_time(tip.time));

    println!("\n💾 Connecting to PostgreSQL database...");
    let database = Database::new(&cli.database_url, cli.pool_size()).await?;
    database.test_connection().await?;
    println!("✅ Database connected successfully!");

    // Latch a stop request; the pipeline checks it between blocks
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current block");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    tracing::info!("Chain Graph Loader initialized successfully");

    let mut pipeline = pipeline::Pipeline::new(chain, Arc::new(database), cli.pipeline_config(), stop);
    pipeline
        .run()
        .await
        .with_context(|| format!("Pipeline execution failed with {} recorded errors", pipeline.errors().len()))?;

    println!("\n✨ Pipeline execution complete!");

    Ok(())
}
