use anyhow::Context;
use clap::Parser;
use court_assignment_engine::commands::{self, Cli};
use court_assignment_engine::config::AppConfig;
use court_assignment_engine::{init_tracing, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app = AppConfig::from_env();
    let environment = cli
        .environment
        .as_deref()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| app.environment.clone());

    let engine = Engine::new(app).context("failed to open engine state store")?;
    init_tracing(engine.log_filter(&environment).as_deref());
    tracing::debug!(target: "engine", environment = %environment, "engine ready");

    let output = commands::dispatch(&engine, &environment, cli.command)
        .await
        .with_context(|| format!("command failed for environment {environment}"))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
