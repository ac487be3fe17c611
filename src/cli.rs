/// CLI Module
///
/// Command-line interface configuration using clap. Connection settings fall
/// back to the environment (loaded from `.env` first).
use std::time::Duration;

use clap::Parser;

use crate::etl::transform::Concurrency;
use crate::pipeline::PipelineConfig;

/// Chain Graph Loader - resumable ingestion pipeline
///
/// Walk a Bitcoin-style chain from the last stored block to the tip and load
/// blocks, transactions, outputs and addresses into a document/graph store
#[derive(Parser, Debug)]
#[command(name = "chain-graph-loader")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Truncate every collection and exit
    #[arg(long)]
    pub clean: bool,

    /// Process the transactions, inputs and outputs of a block concurrently
    #[arg(long = "async")]
    pub concurrent: bool,

    /// Retries after a transient write conflict
    #[arg(long, value_name = "COUNT", default_value = "3")]
    pub retries: usize,

    /// Number of block workers; above 1 blocks are processed out of order
    #[arg(long, value_name = "COUNT", default_value = "1")]
    pub max_workers: usize,

    /// Fail instead of replacing documents that already exist
    #[arg(long)]
    pub dont_overwrite: bool,

    /// Log timings of node calls and bulk imports
    #[arg(long)]
    pub perf: bool,

    /// Debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Trace logging
    #[arg(long)]
    pub debug: bool,

    /// Documents per collection buffered before a bulk import
    #[arg(short = 'b', long, value_name = "SIZE", default_value = "1000")]
    pub batch_size: usize,

    /// Blocks between progress lines
    #[arg(long, value_name = "BLOCKS", default_value = "100")]
    pub progress_interval: u64,

    /// Node JSON-RPC endpoint
    #[arg(short = 'r', long, value_name = "URL", env = "BITCOIN_RPC_URL", default_value = "http://127.0.0.1:8332")]
    pub rpc_url: String,

    #[arg(long, value_name = "USER", env = "BITCOIN_RPC_USER")]
    pub rpc_user: Option<String>,

    #[arg(long, value_name = "PASSWORD", env = "BITCOIN_RPC_PASSWORD", hide_env_values = true)]
    pub rpc_password: Option<String>,

    /// Node request timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value = "30")]
    pub rpc_timeout: u64,

    /// Database connection URL
    #[arg(short = 'd', long, value_name = "URL", env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.max_workers == 0 {
            anyhow::bail!("Max workers must be greater than 0");
        }

        if self.progress_interval == 0 {
            anyhow::bail!("Progress interval must be greater than 0");
        }

        if self.verbose && self.debug {
            anyhow::bail!("--verbose and --debug are mutually exclusive");
        }

        if self.rpc_user.is_some() != self.rpc_password.is_some() {
            anyhow::bail!("RPC user and password must be given together");
        }

        Ok(())
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::TRACE
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }

    /// Pool size: enough for every worker plus the driver
    pub fn pool_size(&self) -> u32 {
        (self.max_workers as u32).saturating_mul(2).saturating_add(2)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            retries: self.retries,
            overwrite: !self.dont_overwrite,
            concurrency: if self.concurrent { Concurrency::Concurrent } else { Concurrency::Sequential },
            max_workers: self.max_workers,
            clean: self.clean,
            perf: self.perf,
            progress_interval: self.progress_interval,
        }
    }
}
