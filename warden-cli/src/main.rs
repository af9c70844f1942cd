use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use warden_core::runtime::{backend_from_config, build_warden};
use warden_core::WardenConfig;
use warden_feedback::{read_entries, verify_ledger, FeedbackLedger};
use warden_policy::{KillSwitch, PolicyDocument};
use warden_types::{FeedbackRecord, Rating, SessionId};

const DEFAULT_LEDGER: &str = "./feedback.jsonl";

#[derive(Parser)]
#[command(name = "warden", about = "Governed natural-language analytics")]
struct Cli {
    /// Runtime configuration (YAML). Falls back to WARDEN_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question and print the response.
    Ask {
        text: String,
        #[arg(long, default_value = "cli")]
        session: String,
        /// Print the state trace after the answer.
        #[arg(long)]
        trace: bool,
    },
    Feedback {
        #[command(subcommand)]
        action: FeedbackCommand,
        /// Ledger file. Defaults to the configured feedback path.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },
}

#[derive(Subcommand)]
enum FeedbackCommand {
    Tail {
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
    /// Append a judgment on an earlier answer.
    Add {
        #[arg(long)]
        request: String,
        #[arg(long)]
        statement: String,
        #[arg(long, value_enum)]
        rating: RatingArg,
        #[arg(long)]
        correction: Option<String>,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Validate a policy document and print it normalised.
    Check { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum RatingArg {
    Positive,
    Negative,
}

impl From<RatingArg> for Rating {
    fn from(arg: RatingArg) -> Self {
        match arg {
            RatingArg::Positive => Rating::Positive,
            RatingArg::Negative => Rating::Negative,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<WardenConfig> {
    match path {
        Some(path) => {
            let mut config = WardenConfig::from_path(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            config.apply_env(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => WardenConfig::load().context("loading config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask {
            text,
            session,
            trace,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let backend = backend_from_config(&config)?;
            let warden = build_warden(&config, KillSwitch::new(), backend).await?;
            let response = warden.handle(&text, &SessionId::new(session)).await;
            println!("{}", response.answer_text);
            if trace {
                println!();
                for event in &response.trace {
                    match &event.note {
                        Some(note) => println!("{} ({note})", event.state),
                        None => println!("{}", event.state),
                    }
                }
                println!("cost: ${}", response.cost);
            }
        }
        Command::Feedback { action, path } => {
            let path = match path {
                Some(path) => path,
                None => load_config(cli.config.as_ref())?
                    .feedback
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER)),
            };
            match action {
                FeedbackCommand::Tail { lines } => {
                    let entries = read_entries(&path)?;
                    let start = entries.len().saturating_sub(lines);
                    for entry in &entries[start..] {
                        let record = &entry.record;
                        println!(
                            "{} {:?} {:<40} {}",
                            record.timestamp.to_rfc3339(),
                            record.rating,
                            record.request_text,
                            record.correction.as_deref().unwrap_or(&record.statement_text)
                        );
                    }
                }
                FeedbackCommand::Verify => {
                    let count = verify_ledger(&path)?;
                    println!("feedback ledger ok ({count} records)");
                }
                FeedbackCommand::Add {
                    request,
                    statement,
                    rating,
                    correction,
                } => {
                    let ledger = FeedbackLedger::open(&path)?;
                    let receipt = ledger.append(FeedbackRecord::new(
                        request,
                        statement,
                        rating.into(),
                        correction,
                    ));
                    if !receipt.persisted {
                        anyhow::bail!("record {} could not be written to {}", receipt.record_id, path.display());
                    }
                    println!("{}", receipt.record_id);
                }
            }
        }
        Command::Policy {
            action: PolicyCommand::Check { file },
        } => {
            let document = PolicyDocument::from_path(&file)
                .with_context(|| format!("checking {}", file.display()))?;
            print!("{}", document.to_yaml()?);
            tracing::info!(version = document.version, "policy document valid");
        }
    }

    Ok(())
}
