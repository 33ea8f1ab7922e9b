use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::metrics::{AssignmentFilter, Pagination};
use crate::Engine;

#[derive(Parser, Debug)]
#[command(name = "court-assignment-engine")]
#[command(version)]
#[command(about = "Geocodes courts and assigns the nearest eligible court to pending lawsuits", long_about = None)]
pub struct Cli {
    #[arg(short, long, env = "ENVIRONMENT", help = "Environment whose configuration and run state are used")]
    pub environment: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Operator start: resume from any state and run once")]
    Start,
    #[command(about = "Stop the bot; scheduled and manual runs stay blocked until the next start")]
    Stop,
    #[command(about = "Show the bot state and last error")]
    Status,
    #[command(about = "Run once now, subject to the same exclusion as scheduled runs")]
    ExecuteOnce {
        #[arg(long, help = "Maximum lawsuits resolved per tenant")]
        limit: Option<usize>,
    },
    #[command(about = "Assignment and court counters per tenant and in total")]
    Stats {
        #[arg(short, long)]
        tenant: Option<String>,
    },
    #[command(about = "List configured tenant databases")]
    Tenants,
    #[command(about = "Drop cached configuration and read it again")]
    ReloadConfig,
    #[command(about = "Check that every tenant database is reachable")]
    TestConnections,
    #[command(about = "Geocoding quota consumption for today and this month")]
    Usage,
    #[command(about = "Zero today's geocoding counter")]
    ResetUsage,
    #[command(about = "Page through persisted assignments of one tenant")]
    Assignments {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long, default_value = "all", value_parser = parse_filter, help = "all, assigned, no_address or error")]
        filter: AssignmentFilter,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    #[command(about = "Trigger scheduled runs periodically inside the configured window")]
    Schedule {
        #[arg(long, default_value = "900", help = "Seconds between triggers")]
        interval_secs: u64,
        #[arg(long, help = "Stop after this many triggers")]
        ticks: Option<u64>,
    },
}

fn parse_filter(value: &str) -> Result<AssignmentFilter, String> {
    AssignmentFilter::parse(value).ok_or_else(|| format!("unknown filter {value}"))
}

pub async fn dispatch(engine: &Engine, environment: &str, command: Command) -> AppResult<Value> {
    match command {
        Command::Start => to_json(&engine.start(environment).await?),
        Command::Stop => to_json(&engine.stop(environment)?),
        Command::Status => to_json(&engine.get_status(environment)?),
        Command::ExecuteOnce { limit } => to_json(&engine.execute_once(environment, limit).await?),
        Command::Stats { tenant } => to_json(&engine.get_stats(environment, tenant.as_deref())?),
        Command::Tenants => to_json(&engine.list_tenants(environment)?),
        Command::ReloadConfig => to_json(&engine.reload_config(environment)?),
        Command::TestConnections => to_json(&engine.test_connections(environment)?),
        Command::Usage => to_json(&engine.api_usage(environment)?),
        Command::ResetUsage => {
            let previous = engine.reset_daily_usage(environment)?;
            Ok(json!({ "environment": environment, "previous_daily_calls": previous }))
        }
        Command::Assignments {
            tenant,
            filter,
            page,
            page_size,
        } => to_json(&engine.list_assignments(
            environment,
            &tenant,
            filter,
            Pagination::new(page, page_size),
        )?),
        Command::Schedule {
            interval_secs,
            ticks,
        } => {
            let completed = schedule(engine, environment, interval_secs, ticks).await?;
            Ok(json!({ "environment": environment, "triggers": completed }))
        }
    }
}

// Stand-in for an external scheduler: one trigger per tick, never queued.
async fn schedule(
    engine: &Engine,
    environment: &str,
    interval_secs: u64,
    ticks: Option<u64>,
) -> AppResult<u64> {
    let mut timer = interval(Duration::from_secs(interval_secs.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut fired = 0_u64;
    loop {
        if ticks.is_some_and(|limit| fired >= limit) {
            return Ok(fired);
        }
        timer.tick().await;
        fired += 1;
        match engine.run_scheduled(environment).await {
            Ok(Some(report)) => {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(None) => {}
            Err(err @ (AppError::ConcurrentRunRejected(_) | AppError::RunBlocked { .. })) => {
                info!(target: "orchestrator", environment, reason = %err, "scheduled trigger not admitted");
            }
            Err(err) => {
                warn!(target: "orchestrator", environment, error = %err, "scheduled run failed");
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> AppResult<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_filters() {
        let cli = Cli::try_parse_from([
            "court-assignment-engine",
            "--environment",
            "qa",
            "assignments",
            "--tenant",
            "cartera_a",
            "--filter",
            "no_address",
            "--page",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.environment.as_deref(), Some("qa"));
        match cli.command {
            Command::Assignments {
                tenant,
                filter,
                page,
                page_size,
            } => {
                assert_eq!(tenant, "cartera_a");
                assert_eq!(filter, AssignmentFilter::NoAddress);
                assert_eq!(page, Some(2));
                assert_eq!(page_size, None);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["court-assignment-engine", "execute-once", "--limit", "5"])
            .unwrap();
        assert!(matches!(cli.command, Command::ExecuteOnce { limit: Some(5) }));
        assert!(Cli::try_parse_from(["court-assignment-engine", "assignments", "-t", "a", "-f", "bogus"]).is_err());
    }
}
