// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gov_core::{Origin, OriginKind, RiskClass};
use gov_kernel::{NoOpGovernanceProvider, PipelineConfig, PipelineExecutor, PipelineRequest};
use gov_receipt_store::ReceiptStore;
use gov_registry::{Handler, HandlerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for configuration errors (`STORE_MISCONFIGURED` and friends).
const EXIT_MISCONFIGURED: i32 = 2;
/// Exit code for a storage seal violation (`GOVERNANCE_BYPASS_DETECTED`).
const EXIT_SEAL_VIOLATION: i32 = 3;
/// Exit code for a receipt-chain verification failure.
const EXIT_CHAIN_INVALID: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "gov", version, about = "Governed execution substrate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive one request through the five-stage pipeline.
    Run {
        /// The registered intent to invoke.
        #[arg(long)]
        intent: String,

        /// The authenticated principal driving this request.
        #[arg(long)]
        principal: String,

        /// The authorization-boundary namespace for this request.
        #[arg(long)]
        namespace: String,

        /// JSON payload passed to ingress validation and the handler.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Optional path to a TOML tuning file (see `gov-config`).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Revoke every token in a namespace and signal an in-flight trace to stop.
    Stop {
        /// The invocation to signal, if still in-flight.
        #[arg(long)]
        trace_id: Uuid,

        /// The namespace whose tokens should be revoked.
        #[arg(long)]
        namespace: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Verify the durable receipt chain's hash linkage and signatures.
    VerifyChain {
        /// Restrict verification to one invocation's receipts. Without this,
        /// the whole store is verified.
        #[arg(long)]
        job_id: Option<Uuid>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List registered handlers (metadata only, never handler bodies).
    Handlers {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("gov=debug") } else { EnvFilter::new("gov=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run { intent, principal, namespace, payload, config } => {
            cmd_run(intent, principal, namespace, payload, config).await
        }
        Commands::Stop { trace_id, namespace, config } => cmd_stop(trace_id, namespace, config).await,
        Commands::VerifyChain { job_id, config } => cmd_verify_chain(job_id, config).await,
        Commands::Handlers { config } => cmd_handlers(config).await,
    };

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<gov_config::ConfigError>().is_some() {
        return EXIT_MISCONFIGURED;
    }
    if let Some(e) = err.downcast_ref::<gov_errors::GovError>() {
        if e.code == gov_errors::ErrorCode::GovernanceBypassDetected {
            return EXIT_SEAL_VIOLATION;
        }
    }
    if err.downcast_ref::<ChainInvalid>().is_some() {
        return EXIT_CHAIN_INVALID;
    }
    1
}

#[derive(Debug, thiserror::Error)]
#[error("receipt chain failed verification at position {broken_at:?}")]
struct ChainInvalid {
    broken_at: Option<usize>,
}

/// A pass-through handler that echoes its payload, used to make `gov run`
/// runnable against a bare checkout with no domain handler registered.
struct EchoHandler;

#[async_trait::async_trait]
impl Handler for EchoHandler {
    async fn call(
        &self,
        _ctx: &gov_core::RequestContext,
        payload: serde_json::Value,
        _capability_tokens: &[gov_core::CapabilityToken],
    ) -> Result<serde_json::Value, String> {
        Ok(payload)
    }
}

/// Build the receipt store the environment selects, engage the storage
/// seal, and initialize the process HMAC key — the sequence every
/// entrypoint adapter must follow before constructing a [`PipelineExecutor`].
async fn open_store(config_path: Option<PathBuf>) -> Result<Arc<dyn ReceiptStore>> {
    let store_env = gov_config::load_store_env()?;
    let cfg = gov_config::load_gov_config(config_path.as_deref())?;
    for warning in gov_config::validate_gov_config(&cfg)? {
        tracing::warn!(target: "gov.cli", %warning, "configuration warning");
    }

    let secret = match gov_config::read_hmac_secret(&cfg)? {
        Some(bytes) => bytes,
        None => gov_crypto::random_token().to_vec(),
    };
    gov_crypto::init_hmac_key(&secret).map_err(anyhow::Error::from)?;

    let capability = gov_seal::seal();

    let store: Arc<dyn ReceiptStore> = match store_env.backend {
        gov_config::StoreBackend::File => Arc::new(
            gov_receipt_store::FileReceiptStore::open(
                store_env.path,
                cfg.receipt_rotation_bytes,
                Some(capability.as_bytes()),
            )
            .context("open file receipt store")?,
        ),
        gov_config::StoreBackend::Sqlite => Arc::new(
            gov_receipt_store::SqliteReceiptStore::open(store_env.path, Some(capability.as_bytes()))
                .context("open sqlite receipt store")?,
        ),
    };
    Ok(store)
}

fn build_executor(receipts: Arc<dyn ReceiptStore>) -> Result<Arc<PipelineExecutor>> {
    let (registry, proof) = HandlerRegistry::new();
    registry
        .register("echo", "echo", RiskClass::ReadOnly, Vec::new(), Arc::new(EchoHandler))
        .context("register built-in echo handler")?;
    registry.seal();

    let tokens = Arc::new(gov_captoken::TokenStore::new());
    let governance = Arc::new(NoOpGovernanceProvider);
    Ok(Arc::new(PipelineExecutor::new(
        Arc::new(registry),
        proof,
        tokens,
        receipts,
        governance,
        PipelineConfig::default(),
    )))
}

async fn cmd_run(
    intent: String,
    principal: String,
    namespace: String,
    payload: String,
    config: Option<PathBuf>,
) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload).context("parse --payload as JSON")?;
    let receipts = open_store(config).await?;
    let executor = build_executor(receipts)?;

    let request = PipelineRequest::new(
        Uuid::new_v4(),
        principal,
        namespace,
        intent,
        Origin::new(OriginKind::Cli, "gov run"),
        payload,
    );
    let response = executor.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_stop(trace_id: Uuid, namespace: String, config: Option<PathBuf>) -> Result<()> {
    let receipts = open_store(config).await?;
    let executor = build_executor(receipts)?;
    let outcome = executor.stop(trace_id, &namespace);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn cmd_verify_chain(job_id: Option<Uuid>, config: Option<PathBuf>) -> Result<()> {
    let receipts = open_store(config).await?;
    let verification = match job_id {
        Some(job_id) => verify_job_chain(receipts.as_ref(), job_id).await?,
        None => receipts.verify_chain().await.context("verify receipt chain")?,
    };
    println!("{}", serde_json::to_string_pretty(&verification)?);
    if !verification.valid {
        return Err(ChainInvalid { broken_at: verification.broken_at }.into());
    }
    Ok(())
}

/// Verify one invocation's receipts: each entry's own HMAC signature must be
/// valid and `sequence_number`s must be gap-free starting at zero.
///
/// `prev_hash` links the *whole store's* tail, not a per-job chain (other
/// jobs' entries interleave in between), so this does not attempt to
/// re-derive global linkage — that is what `verify_chain()` is for.
async fn verify_job_chain(
    receipts: &dyn ReceiptStore,
    job_id: Uuid,
) -> Result<gov_core::ChainVerification> {
    let entries = receipts.query_by_job(job_id).await.context("query receipts by job")?;
    for (i, entry) in entries.iter().enumerate() {
        let signature_ok = entry.verify_signature().context("verify receipt signature")?;
        if !signature_ok || entry.sequence_number != i as u64 {
            return Ok(gov_core::ChainVerification { valid: false, broken_at: Some(i) });
        }
    }
    Ok(gov_core::ChainVerification { valid: true, broken_at: None })
}

async fn cmd_handlers(config: Option<PathBuf>) -> Result<()> {
    let receipts = open_store(config).await?;
    let executor = build_executor(receipts)?;
    for metadata in executor.registry().list_metadata() {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    }
    Ok(())
}
