use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::state::StateStore;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Running,
    NoApiCredits,
    Error,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Running => "running",
            BotStatus::NoApiCredits => "no_api_credits",
            BotStatus::Error => "error",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "running" => BotStatus::Running,
            "no_api_credits" => BotStatus::NoApiCredits,
            "error" => BotStatus::Error,
            _ => BotStatus::Stopped,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Operator,
    Manual,
    Scheduled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    QuotaExhausted(String),
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Start,
    Completed,
    QuotaExhausted,
    Failed,
    Stop,
}

// `None` means the event is not accepted in `from`.
pub fn next_status(from: BotStatus, event: Transition) -> Option<BotStatus> {
    use BotStatus::*;
    match (from, event) {
        (Stopped | NoApiCredits | Error, Transition::Start) => Some(Running),
        (Running, Transition::Completed) => Some(Stopped),
        (Running, Transition::QuotaExhausted) => Some(NoApiCredits),
        (Running, Transition::Failed) => Some(Error),
        (_, Transition::Stop) => Some(Stopped),
        _ => None,
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LastError {
    pub message: String,
    pub at: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BotRunState {
    pub environment: String,
    pub status: BotStatus,
    pub paused: bool,
    pub run_id: Option<String>,
    pub last_error: Option<LastError>,
    pub run_started_at: Option<String>,
    pub run_finished_at: Option<String>,
    pub updated_at: Option<String>,
}

impl BotRunState {
    fn initial(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            status: BotStatus::Stopped,
            paused: false,
            run_id: None,
            last_error: None,
            run_started_at: None,
            run_finished_at: None,
            updated_at: None,
        }
    }
}

#[derive(Clone)]
pub struct BotController {
    store: StateStore,
    environment: String,
    stale_after: ChronoDuration,
}

impl BotController {
    pub fn new(store: StateStore, environment: impl Into<String>, stale_after_minutes: i64) -> Self {
        Self {
            store,
            environment: environment.into(),
            stale_after: ChronoDuration::minutes(stale_after_minutes.max(1)),
        }
    }

    pub fn state(&self) -> AppResult<BotRunState> {
        let conn = self.store.lock();
        load_state(&conn, &self.environment)
    }

    pub fn is_current(&self, run_id: &str) -> AppResult<bool> {
        let state = self.state()?;
        Ok(state.status == BotStatus::Running && state.run_id.as_deref() == Some(run_id))
    }

    pub fn begin_run(&self, trigger: RunTrigger) -> AppResult<BotRunState> {
        let now = Utc::now();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = load_state(&tx, &self.environment)?;

        match state.status {
            BotStatus::Running if self.is_stale(&state, now) => {
                warn!(
                    target: "bot_controller",
                    environment = %self.environment,
                    started_at = ?state.run_started_at,
                    "previous run exceeded its time limit; taking over"
                );
            }
            BotStatus::Running => {
                return Err(AppError::ConcurrentRunRejected(self.environment.clone()));
            }
            BotStatus::Stopped if trigger != RunTrigger::Operator && state.paused => {
                return Err(AppError::RunBlocked {
                    environment: self.environment.clone(),
                    reason: "bot was stopped by an operator".to_string(),
                });
            }
            BotStatus::NoApiCredits | BotStatus::Error if trigger != RunTrigger::Operator => {
                return Err(AppError::RunBlocked {
                    environment: self.environment.clone(),
                    reason: format!(
                        "bot is in state {} and needs an operator start",
                        state.status.as_str()
                    ),
                });
            }
            _ => {}
        }

        state.status = BotStatus::Running;
        state.run_id = Some(new_run_id(now));
        if trigger == RunTrigger::Operator {
            state.paused = false;
        }
        state.run_started_at = Some(now.to_rfc3339());
        state.run_finished_at = None;
        state.updated_at = Some(now.to_rfc3339());
        save_state(&tx, &state)?;
        tx.commit()?;

        info!(
            target: "bot_controller",
            environment = %self.environment,
            run_id = state.run_id.as_deref().unwrap_or_default(),
            ?trigger,
            "run admitted"
        );
        Ok(state)
    }

    /// Records the terminal status of run `run_id`. A run that lost ownership
    /// leaves the state alone; a stop issued while it was in flight wins over
    /// completion or quota exhaustion.
    pub fn finish_run(&self, run_id: &str, outcome: &RunOutcome) -> AppResult<BotRunState> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = load_state(&tx, &self.environment)?;

        if state.run_id.as_deref() != Some(run_id) {
            debug!(
                target: "bot_controller",
                environment = %self.environment,
                run_id,
                current = state.run_id.as_deref().unwrap_or_default(),
                "run no longer owns the environment; state left unchanged"
            );
            return Ok(state);
        }

        let event = match outcome {
            RunOutcome::Completed => Transition::Completed,
            RunOutcome::QuotaExhausted(_) => Transition::QuotaExhausted,
            RunOutcome::Failed(_) => Transition::Failed,
        };
        match next_status(state.status, event) {
            Some(next) => {
                state.status = next;
                match outcome {
                    RunOutcome::QuotaExhausted(message) | RunOutcome::Failed(message) => {
                        state.last_error = Some(LastError {
                            message: message.clone(),
                            at: now.clone(),
                        });
                    }
                    RunOutcome::Completed => {}
                }
            }
            None => {
                info!(
                    target: "bot_controller",
                    environment = %self.environment,
                    status = state.status.as_str(),
                    "run finished after stop; keeping current status"
                );
            }
        }
        state.run_finished_at = Some(now.clone());
        state.updated_at = Some(now);
        save_state(&tx, &state)?;
        tx.commit()?;

        match outcome {
            RunOutcome::Failed(message) => warn!(
                target: "bot_controller",
                environment = %self.environment,
                run_id,
                error = %message,
                "run failed"
            ),
            _ => info!(
                target: "bot_controller",
                environment = %self.environment,
                run_id,
                status = state.status.as_str(),
                "run finished"
            ),
        }
        Ok(state)
    }

    // Sets the pause flag: scheduled and manual triggers stay out until an
    // operator starts again.
    pub fn stop(&self) -> AppResult<BotRunState> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = load_state(&tx, &self.environment)?;
        let previous = state.status;
        if let Some(next) = next_status(previous, Transition::Stop) {
            state.status = next;
        }
        state.paused = true;
        state.updated_at = Some(now);
        save_state(&tx, &state)?;
        tx.commit()?;
        info!(
            target: "bot_controller",
            environment = %self.environment,
            from = previous.as_str(),
            "bot stopped"
        );
        Ok(state)
    }

    fn is_stale(&self, state: &BotRunState, now: DateTime<Utc>) -> bool {
        state
            .run_started_at
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|started| now.signed_duration_since(started.with_timezone(&Utc)) > self.stale_after)
            .unwrap_or(true)
    }
}

fn new_run_id(now: DateTime<Utc>) -> String {
    format!("{}-{:08x}", now.format("%Y%m%dT%H%M%S%.3f"), rand::random::<u32>())
}

fn load_state(conn: &Connection, environment: &str) -> AppResult<BotRunState> {
    let state = conn
        .query_row(
            "SELECT status, paused, last_error, last_error_at, run_started_at, run_finished_at, updated_at,
                    run_id
             FROM bot_state WHERE environment = ?1",
            [environment],
            |row| {
                let status: String = row.get(0)?;
                let paused: i64 = row.get(1)?;
                let message: Option<String> = row.get(2)?;
                let at: Option<String> = row.get(3)?;
                Ok(BotRunState {
                    environment: environment.to_string(),
                    status: BotStatus::parse(&status),
                    paused: paused != 0,
                    run_id: row.get(7)?,
                    last_error: message.map(|message| LastError {
                        message,
                        at: at.unwrap_or_default(),
                    }),
                    run_started_at: row.get(4)?,
                    run_finished_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(state.unwrap_or_else(|| BotRunState::initial(environment)))
}

fn save_state(conn: &Connection, state: &BotRunState) -> AppResult<()> {
    let (message, at) = match &state.last_error {
        Some(err) => (Some(err.message.as_str()), Some(err.at.as_str())),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO bot_state
            (environment, status, paused, last_error, last_error_at, run_started_at, run_finished_at, updated_at, run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(environment) DO UPDATE SET
            status = excluded.status,
            run_id = excluded.run_id,
            paused = excluded.paused,
            last_error = excluded.last_error,
            last_error_at = excluded.last_error_at,
            run_started_at = excluded.run_started_at,
            run_finished_at = excluded.run_finished_at,
            updated_at = excluded.updated_at",
        params![
            state.environment,
            state.status.as_str(),
            state.paused as i64,
            message,
            at,
            state.run_started_at,
            state.run_finished_at,
            state.updated_at.clone().unwrap_or_else(|| Utc::now().to_rfc3339()),
            state.run_id,
        ],
    )?;
    Ok(())
}
