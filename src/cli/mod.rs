//! Command line interface over [`RunService`].

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::llm::HttpLlmClient;
use crate::pipeline::PipelineConfig;
use crate::run::RunInputs;
use crate::service::RunService;
use crate::stages::StageName;
use crate::store::{AnalyticsMirror, AnalyticsStore};

#[derive(Debug, Parser)]
#[command(
    name = "draftforge",
    about = "Turn a source document into a fact-checked, graded article",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a run from a source document. Prints the run id.
    New {
        /// Path to the extracted source document text.
        #[arg(long)]
        source: PathBuf,
        /// Working title for the artifact.
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "professional")]
        tone: String,
        #[arg(long, default_value = "technical readers")]
        audience: String,
        /// Target length in words.
        #[arg(long, default_value_t = 1200)]
        word_count: u32,
        /// Extra guidance passed to every stage.
        #[arg(long, default_value = "")]
        instructions: String,
    },
    /// Execute a pending run's pipeline.
    Execute { run_id: Uuid },
    /// Re-enter a finished run at a stage with feedback.
    Feedback {
        run_id: Uuid,
        /// One of: research, write, fact_check, polish.
        #[arg(long)]
        stage: String,
        #[arg(long)]
        text: String,
    },
    /// Print a run's full state as JSON.
    Show { run_id: Uuid },
    /// Print a run's final markdown artifact.
    Export { run_id: Uuid },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();

    let provider = Arc::new(
        HttpLlmClient::from_env().context("failed to build generation client")?,
    );
    let analytics = match &config.database_url {
        Some(url) => {
            let store = AnalyticsStore::connect(url)
                .await
                .context("failed to connect analytics database")?;
            AnalyticsMirror::new(Some(store))
        }
        None => AnalyticsMirror::disabled(),
    };
    let service = RunService::new(config, provider, analytics)?;

    match cli.command {
        Command::New {
            source,
            title,
            tone,
            audience,
            word_count,
            instructions,
        } => {
            let source_text = tokio::fs::read_to_string(&source)
                .await
                .with_context(|| format!("failed to read {}", source.display()))?;
            let state = service
                .create_run(RunInputs {
                    source_text,
                    title,
                    tone,
                    audience,
                    target_word_count: word_count,
                    additional_instructions: instructions,
                })
                .await?;
            println!("{}", state.id);
        }
        Command::Execute { run_id } => {
            let state = service.execute(run_id).await?;
            println!(
                "{} {}",
                state.status.as_str(),
                state
                    .error
                    .as_deref()
                    .unwrap_or("")
            );
        }
        Command::Feedback {
            run_id,
            stage,
            text,
        } => {
            let stage: StageName = stage.parse().map_err(anyhow::Error::from)?;
            let state = service.feedback(run_id, stage, &text).await?;
            println!("{}", state.status.as_str());
        }
        Command::Show { run_id } => {
            let state = service.get_run(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Export { run_id } => {
            let state = service.get_run(run_id).await?;
            match state.steps.final_output {
                Some(artifact) => println!("{}", artifact.markdown),
                None => anyhow::bail!("run {run_id} has no final artifact yet"),
            }
        }
    }
    Ok(())
}
