//! `forge-governor` - inspect governance policy and dry-run proposals.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge_common::logging::init_from_config;
use forge_common::{AutomationLevel, GovernanceConfig};
use forge_governance::{AutomatedAction, DryRunExecutor, ExecutionContext, Governor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Forge Governor - automation governance from the command line.
#[derive(Parser, Debug)]
#[command(name = "forge-governor")]
#[command(version = "0.1.0")]
#[command(about = "Gate automated actions through confidence, safety, and approval policy.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.forge/governance.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the confidence thresholds of every automation level
    Levels,

    /// Dry-run a JSON array of actions through the policy gate
    Evaluate {
        /// File containing the actions
        file: PathBuf,

        /// Override the configured automation level
        #[arg(long)]
        level: Option<AutomationLevel>,

        /// Agent the actions are proposed on behalf of
        #[arg(long, default_value = forge_governance::engine::DEFAULT_AGENT_ID)]
        agent: String,
    },

    /// Match a JSON situation against the configured rules
    Analyze {
        /// File containing the situation context
        file: PathBuf,
    },

    /// Load, validate, and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GovernanceConfig::load_with_env(cli.config.as_deref())?;
    init_from_config(&config.observability);

    match cli.command {
        Commands::Levels => print_levels(&config),
        Commands::Evaluate { file, level, agent } => evaluate(config, &file, level, agent).await,
        Commands::Analyze { file } => analyze(config, &file),
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_levels(config: &GovernanceConfig) -> Result<()> {
    let levels: Vec<Value> = AutomationLevel::ALL
        .iter()
        .map(|level| {
            let t = config.automation.thresholds_for(*level);
            json!({
                "level": level,
                "active": *level == config.automation.level,
                "minimum": t.minimum,
                "caution": t.caution,
                "confident": t.confident,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&levels)?);
    Ok(())
}

async fn evaluate(
    mut config: GovernanceConfig,
    file: &Path,
    level: Option<AutomationLevel>,
    agent: String,
) -> Result<()> {
    let actions: Vec<AutomatedAction> = serde_json::from_value(read_json(file)?)
        .with_context(|| format!("{} must contain an array of actions", file.display()))?;

    // Never touch the system from here.
    config.automation.dry_run = true;
    if let Some(level) = level {
        config.automation.level = level;
    }
    let governor = Governor::new(&config, Arc::new(DryRunExecutor))?;

    tracing::info!(
        count = actions.len(),
        level = %governor.engine().level(),
        "Evaluating actions"
    );

    let mut results = Vec::with_capacity(actions.len());
    for action in actions {
        let action_id = action.id.clone();
        let ctx = ExecutionContext::new().for_agent(agent.clone());
        let result = match governor.propose(action, ctx).await {
            Ok(proposal) => serde_json::to_value(&proposal)?,
            Err(e) => json!({
                "outcome": "rejected",
                "action_id": action_id,
                "code": e.code(),
                "message": e.to_string(),
            }),
        };
        results.push(result);
    }

    let report = json!({
        "level": governor.engine().level(),
        "results": results,
        "statistics": governor.engine().statistics(),
        "pending_approvals": governor.approvals().get_pending(None).len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn analyze(config: GovernanceConfig, file: &Path) -> Result<()> {
    let situation = read_json(file)?;
    let engine = forge_governance::AutomationEngine::new(config.automation, Arc::new(DryRunExecutor))?;
    let candidates = engine.analyze_situation(&situation);
    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}
