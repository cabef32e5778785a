//! guardrail - deployment governance CLI
//!
//! Every subcommand opens the pipeline from the state directory, applies one
//! operation and prints the result as JSON. `run` keeps the control loops
//! going until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use guardrail_core::{
    GuardrailConfig, IntentId, LeaseId, ReviewClass, RiskTier, Role, Scope, SystemClock, Verdict,
};
use guardrail_kernel::control::ControlPlane;
use guardrail_kernel::host::{DryRunLauncher, FileHealthSource, SystemProbe};
use guardrail_kernel::lease::{CosignatureInput, Ed25519Verifier};
use guardrail_kernel::messages::OperatorCommand;
use guardrail_kernel::pipeline::{Pipeline, PipelineDeps};
use guardrail_kernel::rollback::SimulatedTarget;
use guardrail_kernel::runtime::Runtime;
use guardrail_kernel::store::{FileStore, StateStore};
use rand::rngs::OsRng;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Seed of the simulated deployment target's initial state
const TARGET_SEED: &str = "guardrail.target.v1";

/// guardrail - intent review, two-key leases and canary rollouts
#[derive(Parser, Debug)]
#[command(name = "guardrail")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// State directory, overrides `store.state_dir`
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Health samples file, defaults to `<state dir>/health.json`
    #[arg(long)]
    health_file: Option<PathBuf>,

    /// Log filter, overridden by `RUST_LOG`
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an Ed25519 key pair
    Keygen {
        /// Where to write the secret key (hex)
        #[arg(long)]
        out: PathBuf,
    },

    /// Register a signing principal
    RegisterPrincipal {
        id: String,
        #[arg(long)]
        role: Role,
        /// Public key, hex
        #[arg(long)]
        public_key: String,
    },

    /// Intent commands
    #[command(subcommand)]
    Intent(IntentCommands),

    /// Attach a review to an intent
    Review {
        intent: IntentId,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        class: ReviewClass,
        #[arg(long)]
        verdict: Verdict,
        #[arg(long = "finding")]
        findings: Vec<String>,
    },

    /// Approve a fully reviewed intent
    Approve { intent: IntentId },

    /// Reject an intent
    Reject {
        intent: IntentId,
        #[arg(long)]
        reason: String,
    },

    /// Issue a lease for an approved intent
    IssueLease {
        intent: IntentId,
        /// Narrow the scope to these paths (default: the intent's scope)
        #[arg(long = "path")]
        paths: Vec<String>,
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// Cosign a lease with a secret key file
    Cosign {
        lease: LeaseId,
        #[arg(long)]
        role: Role,
        #[arg(long)]
        signer: String,
        #[arg(long)]
        key_file: PathBuf,
    },

    /// Check whether a lease is usable
    VerifyLease { lease: LeaseId },

    /// Begin the canary rollout of a usable lease
    StartLease { lease: LeaseId },

    /// Stop automatic promotion of a rollout
    PauseRollout { lease: LeaseId },

    /// Resume automatic promotion of a rollout
    ResumeRollout { lease: LeaseId },

    /// Halt and revert a rollout
    ForceRollback {
        lease: LeaseId,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Promote a rollout to its next tier
    ApproveNextTier { lease: LeaseId },

    /// Rollouts not yet complete or rolled back
    ListActiveLeases,

    /// Score the execution log and print the report
    Report,

    /// Print the audit trail after verifying its hash chain
    Audit {
        /// Only records about this subject
        #[arg(long)]
        subject: Option<String>,
    },

    /// Run the control loops until interrupted
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        for_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum IntentCommands {
    /// Propose a change
    Create {
        #[arg(long)]
        proposer: String,
        #[arg(long)]
        risk: RiskTier,
        #[arg(long = "path")]
        paths: Vec<String>,
        #[arg(long = "command")]
        commands: Vec<String>,
        #[arg(long = "env")]
        environment: Vec<String>,
        /// Reference to the rollback plan
        #[arg(long)]
        rollback_plan: String,
    },
    /// Submit a draft intent for review
    Submit { intent: IntentId },
    /// Show one intent
    Show { intent: IntentId },
    /// List all intents
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(cli))
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Keygen { out } = &cli.command {
        return keygen(out);
    }

    let pipeline = Arc::new(open_pipeline(&cli)?);
    let control = ControlPlane::new(Arc::clone(&pipeline));

    match cli.command {
        Commands::Keygen { out } => keygen(&out),
        Commands::RegisterPrincipal {
            id,
            role,
            public_key,
        } => {
            let key = hex::decode(public_key.trim()).context("public key is not hex")?;
            print_json(&pipeline.directory().register(&id, role, key)?)
        }
        Commands::Intent(command) => intent(&pipeline, command),
        Commands::Review {
            intent,
            reviewer,
            class,
            verdict,
            findings,
        } => print_json(&pipeline.registry().attach_review(intent, &reviewer, class, verdict, findings)?),
        Commands::Approve { intent } => print_json(&pipeline.registry().approve(intent)?),
        Commands::Reject { intent, reason } => print_json(&pipeline.registry().reject(intent, &reason)?),
        Commands::IssueLease {
            intent,
            paths,
            ttl_secs,
        } => {
            let scope = (!paths.is_empty()).then(|| {
                paths
                    .into_iter()
                    .fold(Scope::new(), |scope, path| scope.with_path(path))
            });
            let ttl = ttl_secs
                .map(|secs| chrono::Duration::try_seconds(secs).context("ttl out of range"))
                .transpose()?;
            let issued = pipeline.leases().issue_lease(intent, scope, ttl)?;
            print_json(&issued.lease)
        }
        Commands::Cosign {
            lease,
            role,
            signer,
            key_file,
        } => {
            let key = read_signing_key(&key_file)?;
            let current = pipeline.leases().get(lease)?;
            let input = CosignatureInput::ed25519(&current, role, &signer, &key);
            print_json(&pipeline.leases().cosign(input)?)
        }
        Commands::VerifyLease { lease } => print_json(&pipeline.leases().verify(lease)?),
        Commands::StartLease { lease } => {
            command(&control, OperatorCommand::StartLease { lease_id: lease }).await
        }
        Commands::PauseRollout { lease } => {
            command(&control, OperatorCommand::PauseRollout { lease_id: lease }).await
        }
        Commands::ResumeRollout { lease } => {
            command(&control, OperatorCommand::ResumeRollout { lease_id: lease }).await
        }
        Commands::ForceRollback { lease, reason } => {
            command(
                &control,
                OperatorCommand::ForceRollback {
                    lease_id: lease,
                    reason,
                },
            )
            .await
        }
        Commands::ApproveNextTier { lease } => {
            command(&control, OperatorCommand::ApproveNextTier { lease_id: lease }).await
        }
        Commands::ListActiveLeases => command(&control, OperatorCommand::ListActiveLeases).await,
        Commands::Report => print_json(&pipeline.score_report()),
        Commands::Audit { subject } => {
            pipeline
                .audit()
                .verify_integrity()
                .context("audit trail failed verification")?;
            let records = match subject {
                Some(subject) => pipeline.audit().for_subject(&subject),
                None => pipeline.audit().records(),
            };
            print_json(&records)
        }
        Commands::Run { for_secs } => run_loops(pipeline, for_secs).await,
    }
}

fn open_pipeline(cli: &Cli) -> Result<Pipeline> {
    let mut config = match &cli.config {
        Some(path) => GuardrailConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => GuardrailConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.store.state_dir.clone_from(dir);
    }
    let state_dir = config.store.state_dir.clone();
    let store: Arc<dyn StateStore> = Arc::new(
        FileStore::open(&state_dir)
            .with_context(|| format!("failed to open state directory {}", state_dir.display()))?,
    );
    let health_file = cli
        .health_file
        .clone()
        .unwrap_or_else(|| state_dir.join("health.json"));
    let target = Arc::new(SimulatedTarget::open(Arc::clone(&store), TARGET_SEED)?);

    let deps = PipelineDeps {
        store,
        target,
        health: Arc::new(FileHealthSource::new(health_file)),
        probe: Arc::new(SystemProbe::default()),
        launcher: Arc::new(DryRunLauncher),
        verifier: Arc::new(Ed25519Verifier),
        clock: Arc::new(SystemClock),
    };
    Ok(Pipeline::open(config, deps)?)
}

fn intent(pipeline: &Pipeline, command: IntentCommands) -> Result<()> {
    let registry = pipeline.registry();
    match command {
        IntentCommands::Create {
            proposer,
            risk,
            paths,
            commands,
            environment,
            rollback_plan,
        } => {
            let mut scope = Scope::new();
            scope.paths.extend(paths);
            scope.commands.extend(commands);
            scope.environment.extend(environment);
            print_json(&registry.create_intent(&proposer, risk, scope, &rollback_plan)?)
        }
        IntentCommands::Submit { intent } => print_json(&registry.submit_for_review(intent)?),
        IntentCommands::Show { intent } => print_json(&registry.get(intent)?),
        IntentCommands::List => print_json(&registry.list()),
    }
}

async fn command(control: &ControlPlane, command: OperatorCommand) -> Result<()> {
    let response = control.handle(command).await;
    print_json(&response)?;
    if let Some(error) = response.error {
        bail!("{}: {}", error.kind, error.message);
    }
    Ok(())
}

async fn run_loops(pipeline: Arc<Pipeline>, for_secs: Option<u64>) -> Result<()> {
    let runtime = Runtime::start(pipeline);
    match for_secs {
        Some(secs) => {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(secs)) => {}
                result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?,
    }
    tracing::info!("shutting down");
    let pipeline = Arc::clone(runtime.pipeline());
    runtime.shutdown().await;
    print_json(&pipeline.heartbeats().snapshot())
}

fn keygen(out: &Path) -> Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    std::fs::write(out, hex::encode(key.to_bytes()))
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("{}", hex::encode(key.verifying_key().to_bytes()));
    Ok(())
}

fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let bytes = hex::decode(text.trim()).context("key file is not hex")?;
    let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("key file must hold 32 bytes, found {}", bytes.len());
    };
    Ok(SigningKey::from_bytes(&secret))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
