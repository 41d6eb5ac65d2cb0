#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use level_balance::config::LevelConfig;
use level_balance::embed::EmbeddingBackend;
use level_balance::export::ExportPolicy;
use level_balance::gateway::{ChatGateway, EmbeddingGateway, ProviderGateway};
use level_balance::session::state::Adjustment;
use level_balance::session::store::SessionId;
use level_balance::{BalanceService, SessionStatus, WaveformSnapshot};

#[derive(Parser)]
#[command(name = "level", version, about = "Dataset imbalance analysis and rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// CSV file to analyze
    #[arg(long)]
    input: PathBuf,
    /// Column holding the row text (auto-detected when omitted)
    #[arg(long)]
    text_column: Option<String>,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hashing embedder and no advisor; no network access
    #[arg(long)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a dataset and write the waveform snapshot as JSON
    Analyze {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        out: PathBuf,
    },
    /// Analyze, then ask the advisor for one round of suggestions
    Suggest {
        #[command(flatten)]
        session: SessionArgs,
        /// Free-text request passed to the advisor
        #[arg(long)]
        request: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Analyze, apply adjustments and write the balanced CSV
    Export {
        #[command(flatten)]
        session: SessionArgs,
        /// JSON array of {"id", "newCount"?, "newWeight"?}
        #[arg(long)]
        adjust: Option<PathBuf>,
        #[arg(long)]
        policy: Option<ExportPolicy>,
        #[arg(long)]
        seed: Option<u64>,
        /// Append cluster_id and weight columns
        #[arg(long)]
        annotate: bool,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("level_balance=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { session, out } => {
            let (service, id) = open_session(&session).await?;
            let snapshot = service.waveforms(id).await?;
            write_json(&out, &snapshot)?;
            print_summary(&snapshot);
        }
        Commands::Suggest {
            session,
            request,
            out,
        } => {
            let (service, id) = open_session(&session).await?;
            let outcome = service.request_suggestion(id, request.as_deref()).await?;
            write_json(&out, &outcome.snapshot)?;
            print_summary(&outcome.snapshot);
            if let Some(strategy) = &outcome.snapshot.strategy {
                println!("strategy: {strategy}");
            }
        }
        Commands::Export {
            session,
            adjust,
            policy,
            seed,
            annotate,
            out,
        } => {
            let (service, id) = open_session(&session).await?;
            if let Some(path) = adjust {
                let adjustments: Vec<Adjustment> =
                    serde_json::from_str(&std::fs::read_to_string(path)?)?;
                let snapshot = service.adjust(id, &adjustments).await?;
                print_summary(&snapshot);
            }
            let csv = service.export_csv(id, policy, seed, annotate).await?;
            std::fs::write(&out, &csv)?;
            println!(
                "wrote {} rows to {}",
                csv.lines().count().saturating_sub(1),
                out.display()
            );
        }
    }

    Ok(())
}

async fn open_session(
    args: &SessionArgs,
) -> Result<(BalanceService, SessionId), Box<dyn std::error::Error>> {
    let mut config = LevelConfig::load(args.config.as_deref())?;

    let service = if args.offline {
        config.embedding.backend = EmbeddingBackend::Hashing;
        BalanceService::from_config(config, None, None)?
    } else {
        let gateway = Arc::new(ProviderGateway::from_env()?);
        let chat: Arc<dyn ChatGateway> = gateway.clone();
        let embeddings: Arc<dyn EmbeddingGateway> = gateway;
        BalanceService::from_config(config, Some(chat), Some(embeddings))?
    };

    let upload = std::fs::read(&args.input)?;
    let ticket = service.ingest(&upload, args.text_column.as_deref()).await?;
    eprintln!(
        "[level] session {} ingesting {} rows (text column '{}')",
        ticket.session_id, ticket.rows, ticket.text_column
    );

    match service
        .wait_until_settled(ticket.session_id, Duration::from_millis(50))
        .await?
    {
        SessionStatus::Ready => Ok((service, ticket.session_id)),
        SessionStatus::Failed { message } => Err(format!("ingestion failed: {message}").into()),
        SessionStatus::Processing { .. } => Err("ingestion did not settle".into()),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn print_summary(snapshot: &WaveformSnapshot) {
    println!(
        "{} rows, {} clusters; representation gini {:.3}, selection flatness {:.3}",
        snapshot.base.total_points,
        snapshot.base.peaks.len(),
        snapshot.representation.gini_coefficient,
        snapshot.metrics.flatness_score,
    );
    for peak in &snapshot.user.peaks {
        println!(
            "  [{:>3}] {:<40} {:>6}/{:<6} x{:.2}",
            peak.id, peak.label, peak.selected_count, peak.sample_count, peak.weight
        );
    }
}
