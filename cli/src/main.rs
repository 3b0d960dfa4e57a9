//! ledgerindex CLI — run the indexer and inspect or repair ledger state.
//!
//! Usage:
//! ```bash
//! ledgerindex run        --config indexer.json --rpc https://rpc.api.moonbeam.network --db ./ledger.db
//! ledgerindex status     --db ./ledger.db --id payments
//! ledgerindex rollback   --db ./ledger.db --id payments --from 3000100
//! ledgerindex decode-log --topics 0xddf252ad... 0x... 0x... --data 0x...
//! ledgerindex info
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ledgerindex_core::decoder::EventDecoder;
use ledgerindex_core::indexer::{
    IndexerConfig, ENV_CONTRACT_ADDRESS, ENV_FINALITY_DEPTH, ENV_START_HEIGHT,
};
use ledgerindex_core::store::LedgerStore;
use ledgerindex_evm::{EvmEventDecoder, IndexerBuilder, KnownEvent};
use ledgerindex_storage::SqliteLedgerStore;

mod logging;

#[derive(Parser)]
#[command(
    name = "ledgerindex",
    about = "Reorg-safe token ledger indexer — LedgerIndex CLI",
    long_about = "
LedgerIndex CLI: index ERC-20 transfers and payment receipts from an EVM
JSON-RPC node into a relational ledger, with checkpointing and reorg rollback.

ENVIRONMENT VARIABLES:
  RUST_LOG                       Log filter (default: info)
  LEDGERINDEX_START_HEIGHT       Overrides start_height from the config file
  LEDGERINDEX_CONTRACT_ADDRESS   Overrides contract_address
  LEDGERINDEX_FINALITY_DEPTH     Overrides finality_depth
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexer until Ctrl-C or a fatal error
    Run {
        /// Path to the JSON indexer config
        #[arg(short, long)]
        config: PathBuf,
        /// JSON-RPC endpoint of the chain node
        #[arg(long)]
        rpc: String,
        /// SQLite database file (created if missing)
        #[arg(long, default_value = "./ledger.db")]
        db: String,
    },

    /// Print the stored checkpoint and ledger counts
    Status {
        #[arg(long, default_value = "./ledger.db")]
        db: String,
        /// Indexer id
        #[arg(long, default_value = "default")]
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Discard every record at or above a height and rewind the checkpoint.
    /// An indexer running against the same database halts at its next commit.
    Rollback {
        #[arg(long, default_value = "./ledger.db")]
        db: String,
        /// Indexer id
        #[arg(long, default_value = "default")]
        id: String,
        /// First height to discard
        #[arg(long)]
        from: u64,
    },

    /// Decode an EVM log from raw topics + data
    #[command(name = "decode-log")]
    DecodeLog {
        /// topics[0] = event signature hash, topics[1..] = indexed params
        #[arg(long, num_args = 1..)]
        topics: Vec<String>,
        /// Non-indexed params (hex, 0x-prefixed)
        #[arg(long, default_value = "0x")]
        data: String,
    },

    /// Show defaults and supported events
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.json_logs, cli.verbose);

    match cli.command {
        Commands::Run { config, rpc, db } => cmd_run(&config, &rpc, &db).await,
        Commands::Status { db, id, json } => cmd_status(&db, &id, json).await,
        Commands::Rollback { db, id, from } => cmd_rollback(&db, &id, from).await,
        Commands::DecodeLog { topics, data } => cmd_decode_log(&topics, &data),
        Commands::Info => {
            cmd_info();
            Ok(())
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config_path: &Path, rpc: &str, db: &str) -> Result<()> {
    let config = IndexerConfig::from_json_file(config_path)?
        .apply_env()
        .context("applying environment overrides")?;
    let store: Arc<dyn LedgerStore> = Arc::new(
        SqliteLedgerStore::open(db)
            .await
            .with_context(|| format!("opening database '{db}'"))?,
    );

    let mut run_loop = IndexerBuilder::from_config(config)
        .build_http(rpc, store)
        .await?;

    let stop = run_loop.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current batch");
            stop.stop();
        }
    });

    let result = run_loop.run().await;
    let status = run_loop.status();
    match result {
        Ok(()) => {
            info!(
                id = %status.indexer_id,
                checkpoint = status.checkpoint_height,
                finalized = status.finalized_height,
                "Indexer stopped"
            );
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!(
            "indexer '{}' halted; last committed checkpoint is {}",
            status.indexer_id, status.checkpoint_height
        ))),
    }
}

async fn cmd_status(db: &str, id: &str, as_json: bool) -> Result<()> {
    let store = SqliteLedgerStore::open(db).await?;
    let checkpoint = store.load_checkpoint(id).await?;
    let transfers = store.transfer_count().await?;
    let payments = store.payment_count().await?;

    if as_json {
        let out = serde_json::json!({
            "indexer_id": id,
            "checkpoint": checkpoint,
            "transfers": transfers,
            "payments": payments,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Indexer:    {id}");
    match checkpoint {
        Some(cp) => {
            println!("Checkpoint: {} ({})", cp.height, if cp.is_final { "final" } else { "hot" });
            if !cp.block_hash.is_empty() {
                println!("Block hash: {}", cp.block_hash);
            }
        }
        None => println!("Checkpoint: none"),
    }
    println!("Transfers:  {transfers}");
    println!("Payments:   {payments}");
    Ok(())
}

async fn cmd_rollback(db: &str, id: &str, from: u64) -> Result<()> {
    if from == 0 {
        bail!("--from must be at least 1");
    }
    let store = SqliteLedgerStore::open(db).await?;
    let Some(cp) = store.load_checkpoint(id).await? else {
        bail!("no checkpoint for indexer '{id}' in '{db}'");
    };
    if from > cp.height {
        bail!("--from {from} is above the checkpoint {}; nothing to roll back", cp.height);
    }

    let summary = store.rollback_from(id, from).await?;
    println!("Rolled back '{id}' from height {from}");
    println!("  Transfers removed: {}", summary.transfers_removed);
    println!("  Payments removed:  {}", summary.payments_removed);
    println!("  Accounts adjusted: {}", summary.accounts_adjusted);
    println!("  Accounts removed:  {}", summary.accounts_removed);
    println!("  Checkpoint:        {}", from - 1);
    Ok(())
}

fn cmd_decode_log(topics: &[String], data: &str) -> Result<()> {
    let data_bytes =
        hex::decode(data.strip_prefix("0x").unwrap_or(data)).context("invalid data hex")?;

    match EvmEventDecoder::new().decode(topics, &data_bytes)? {
        Some(kind) => println!("{}", serde_json::to_string_pretty(&kind)?),
        None => bail!(
            "unrecognized event signature {}",
            topics.first().map(String::as_str).unwrap_or("<none>")
        ),
    }
    Ok(())
}

fn cmd_info() {
    let defaults = IndexerConfig::default();
    println!("LedgerIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default finality depth:    {} blocks", defaults.finality_depth);
    println!("  Default batch size:        {} blocks", defaults.batch_size);
    println!("  Default poll interval:     {} ms", defaults.poll_interval_ms);
    println!("  Default store timeout:     {} ms", defaults.store_timeout_ms);
    println!("  Default store retries:     {}", defaults.store_retry.max_retries);
    println!("  Storage backends:          memory, SQLite, Postgres (feature: postgres)");
    println!("  Environment overrides:     {ENV_START_HEIGHT}, {ENV_CONTRACT_ADDRESS}, {ENV_FINALITY_DEPTH}");
    println!("  Events:");
    for event in KnownEvent::ALL {
        println!("    {:<22} {}", event.name(), event.topic0());
        println!("    {:<22} {}", "", event.signature());
    }
}
