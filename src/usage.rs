use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ApiLimits;
use crate::db::now_timestamp;
use crate::errors::{AppError, AppResult};
use crate::state::StateStore;

const WARNING_RATIO: f64 = 0.8;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Period {
    Day,
    Month,
}

impl Period {
    fn as_str(self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Month => "month",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Ok,
    Caution,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeriodUsage {
    pub period_key: String,
    pub calls: u64,
    pub reported: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percentage: f64,
}

impl PeriodUsage {
    fn new(period_key: String, calls: u64, reported: u64, limit: u64) -> Self {
        let percentage = if limit == 0 {
            100.0
        } else {
            ((calls as f64 / limit as f64) * 10000.0).round() / 100.0
        };
        Self {
            period_key,
            calls,
            reported,
            limit,
            remaining: limit.saturating_sub(calls),
            percentage,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageSnapshot {
    pub environment: String,
    pub daily: PeriodUsage,
    pub monthly: PeriodUsage,
    pub level: UsageLevel,
}

/// Persistent per-environment quota for external geocoding calls.
///
/// `calls` counts reservations, so every attempt that may reach the provider
/// is accounted for before it is made. `reported` counts the calls that came
/// back with an answer.
#[derive(Clone)]
pub struct UsageTracker {
    store: StateStore,
    environment: String,
    limits: ApiLimits,
    offset: FixedOffset,
    clock: Clock,
}

impl UsageTracker {
    pub fn new(
        store: StateStore,
        environment: impl Into<String>,
        limits: ApiLimits,
        utc_offset_minutes: i32,
    ) -> AppResult<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            AppError::Config(format!("invalid utc offset {utc_offset_minutes} minutes"))
        })?;
        Ok(Self {
            store,
            environment: environment.into(),
            limits,
            offset,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Reserves `n` calls against both limits, or nothing at all.
    pub fn try_reserve(&self, n: u64) -> AppResult<bool> {
        let (day_key, month_key) = self.period_keys();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let day_calls = read_counter(&tx, &self.environment, Period::Day, &day_key)?.0;
        let month_calls = read_counter(&tx, &self.environment, Period::Month, &month_key)?.0;

        if day_calls + n > self.limits.daily_max || month_calls + n > self.limits.monthly_max {
            debug!(
                target: "api_usage",
                environment = %self.environment,
                day_calls,
                month_calls,
                requested = n,
                "quota reservation denied"
            );
            return Ok(false);
        }

        bump(&tx, &self.environment, Period::Day, &day_key, "reserved", n)?;
        bump(&tx, &self.environment, Period::Month, &month_key, "reserved", n)?;
        tx.commit()?;

        let month_after = month_calls + n;
        let threshold = (self.limits.monthly_max as f64 * WARNING_RATIO).ceil() as u64;
        if month_calls < threshold && month_after >= threshold {
            warn!(
                target: "api_usage",
                environment = %self.environment,
                month_calls = month_after,
                monthly_max = self.limits.monthly_max,
                "monthly geocoding usage crossed 80%"
            );
        }
        Ok(true)
    }

    pub fn report(&self, used: u64) -> AppResult<()> {
        if used == 0 {
            return Ok(());
        }
        let (day_key, month_key) = self.period_keys();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        bump(&tx, &self.environment, Period::Day, &day_key, "reported", used)?;
        bump(&tx, &self.environment, Period::Month, &month_key, "reported", used)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remaining_today(&self) -> AppResult<u64> {
        let (day_key, _) = self.period_keys();
        let conn = self.store.lock();
        let (calls, _) = read_counter(&conn, &self.environment, Period::Day, &day_key)?;
        Ok(self.limits.daily_max.saturating_sub(calls))
    }

    pub fn remaining_this_month(&self) -> AppResult<u64> {
        let (_, month_key) = self.period_keys();
        let conn = self.store.lock();
        let (calls, _) = read_counter(&conn, &self.environment, Period::Month, &month_key)?;
        Ok(self.limits.monthly_max.saturating_sub(calls))
    }

    pub fn snapshot(&self) -> AppResult<UsageSnapshot> {
        let (day_key, month_key) = self.period_keys();
        let conn = self.store.lock();
        let (day_calls, day_reported) =
            read_counter(&conn, &self.environment, Period::Day, &day_key)?;
        let (month_calls, month_reported) =
            read_counter(&conn, &self.environment, Period::Month, &month_key)?;
        drop(conn);

        let daily = PeriodUsage::new(day_key, day_calls, day_reported, self.limits.daily_max);
        let monthly = PeriodUsage::new(
            month_key,
            month_calls,
            month_reported,
            self.limits.monthly_max,
        );
        let level = usage_level(&daily, &monthly);
        Ok(UsageSnapshot {
            environment: self.environment.clone(),
            daily,
            monthly,
            level,
        })
    }

    // Zeroes today's counter. The month keeps what was already spent.
    pub fn reset_today(&self) -> AppResult<u64> {
        let (day_key, _) = self.period_keys();
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (previous, _) = read_counter(&tx, &self.environment, Period::Day, &day_key)?;
        tx.execute(
            "UPDATE api_usage SET reserved = 0, reported = 0, updated_at = ?4
             WHERE environment = ?1 AND period = ?2 AND period_key = ?3",
            params![self.environment, Period::Day.as_str(), day_key, now_timestamp()],
        )?;
        tx.commit()?;
        info!(
            target: "api_usage",
            environment = %self.environment,
            previous,
            "daily usage counter reset"
        );
        Ok(previous)
    }

    fn period_keys(&self) -> (String, String) {
        let local = (self.clock)().with_timezone(&self.offset);
        (
            local.format("%Y-%m-%d").to_string(),
            local.format("%Y-%m").to_string(),
        )
    }
}

fn usage_level(daily: &PeriodUsage, monthly: &PeriodUsage) -> UsageLevel {
    if monthly.remaining == 0 {
        UsageLevel::Critical
    } else if monthly.percentage >= WARNING_RATIO * 100.0 || daily.remaining == 0 {
        UsageLevel::Warning
    } else if daily.percentage >= WARNING_RATIO * 100.0 {
        UsageLevel::Caution
    } else {
        UsageLevel::Ok
    }
}

fn read_counter(
    conn: &Connection,
    environment: &str,
    period: Period,
    key: &str,
) -> AppResult<(u64, u64)> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT reserved, reported FROM api_usage
             WHERE environment = ?1 AND period = ?2 AND period_key = ?3",
            params![environment, period.as_str(), key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row
        .map(|(reserved, reported)| (reserved.max(0) as u64, reported.max(0) as u64))
        .unwrap_or((0, 0)))
}

fn bump(
    conn: &Connection,
    environment: &str,
    period: Period,
    key: &str,
    column: &str,
    amount: u64,
) -> AppResult<()> {
    let (reserved, reported) = match column {
        "reserved" => (amount as i64, 0_i64),
        _ => (0_i64, amount as i64),
    };
    conn.execute(
        "INSERT INTO api_usage (environment, period, period_key, reserved, reported, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(environment, period, period_key) DO UPDATE SET
            reserved = reserved + excluded.reserved,
            reported = reported + excluded.reported,
            updated_at = excluded.updated_at",
        params![
            environment,
            period.as_str(),
            key,
            reserved,
            reported,
            now_timestamp()
        ],
    )?;
    Ok(())
}
