use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

use crate::error::Error;
use crate::model::{Message, Status};

/// One `(date, hour, status)` activity cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsCell {
    pub date: NaiveDate,
    pub hour: u32,
    pub status: Status,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourlySlot {
    pub hour: u32,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySlot {
    pub date: NaiveDate,
    pub incoming: u64,
    pub sent: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub by_status: BTreeMap<Status, u64>,
    pub last_24h: u64,
    pub last_7d: u64,
    pub hourly: Vec<HourlySlot>,
    pub daily: Vec<DailySlot>,
}

/// Running counters per status and per hour/day. A derived projection of the
/// message store: authoritative enough for the admin read path, recomputable
/// via [`Stats::initialize_from_messages`] at any time.
#[derive(Clone)]
pub enum Stats {
    Relational(SqlStats),
    KeyValue(KvStats),
}

impl Stats {
    pub async fn increment(&self, status: Status, at: DateTime<Utc>) -> Result<(), Error> {
        match self {
            Stats::Relational(s) => s.bump_cell(status, at, 1).await,
            Stats::KeyValue(s) => {
                s.bump(status, at, 1);
                Ok(())
            }
        }
    }

    /// Counters clamp at zero; decrementing an absent cell is a no-op.
    pub async fn decrement(&self, status: Status, at: DateTime<Utc>) -> Result<(), Error> {
        match self {
            Stats::Relational(s) => s.bump_cell(status, at, -1).await,
            Stats::KeyValue(s) => {
                s.bump(status, at, -1);
                Ok(())
            }
        }
    }

    /// All-time total, bumped only on genuine creation. The relational
    /// backend derives its total from the messages table instead.
    pub fn bump_total(&self) {
        if let Stats::KeyValue(s) = self {
            s.inner.lock().expect("stats lock").total += 1;
        }
    }

    /// The only path that shrinks the total is an explicit delete.
    pub fn drop_total(&self) {
        if let Stats::KeyValue(s) = self {
            let mut inner = s.inner.lock().expect("stats lock");
            inner.total = (inner.total - 1).max(0);
        }
    }

    pub async fn get(&self) -> Result<StatsSnapshot, Error> {
        let now = Utc::now();
        match self {
            Stats::Relational(s) => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
                    .fetch_one(&s.pool)
                    .await?;

                let rows: Vec<(String, i64)> =
                    sqlx::query_as("SELECT status, COUNT(*) FROM messages GROUP BY status")
                        .fetch_all(&s.pool)
                        .await?;
                let mut by_status = BTreeMap::new();
                for (status, count) in rows {
                    by_status.insert(status.parse::<Status>()?, count.max(0) as u64);
                }

                let cells = s.cells_since(now.date_naive() - Duration::days(7)).await?;
                Ok(assemble(total.max(0) as u64, by_status, &cells, now))
            }
            Stats::KeyValue(s) => {
                let inner = s.inner.lock().expect("stats lock");
                let by_status = inner
                    .totals
                    .iter()
                    .filter(|(_, count)| **count > 0)
                    .map(|(status, count)| (*status, *count as u64))
                    .collect();
                let cells = inner
                    .cells
                    .iter()
                    .map(|((date, hour, status), count)| StatsCell {
                        date: *date,
                        hour: *hour,
                        status: *status,
                        count: *count,
                    })
                    .collect::<Vec<_>>();
                Ok(assemble(inner.total.max(0) as u64, by_status, &cells, now))
            }
        }
    }

    /// Rebuilds every counter from the message store. Documented recovery
    /// path after a crash between a message write and a counter write.
    pub async fn initialize_from_messages(&self, messages: &[Message]) -> Result<(), Error> {
        self.reset().await?;

        match self {
            Stats::Relational(s) => {
                for msg in messages {
                    s.bump_cell(Status::Created, msg.created_at, 1).await?;
                    if msg.status != Status::Created {
                        s.bump_cell(msg.status, msg.updated_at, 1).await?;
                    }
                }
            }
            Stats::KeyValue(s) => {
                let mut inner = s.inner.lock().expect("stats lock");
                for msg in messages {
                    inner.bump(Status::Created, msg.created_at, 1);
                    if msg.status != Status::Created {
                        inner.bump(msg.status, msg.updated_at, 1);
                    }
                    // totals track the current status, not the activity cells
                    *inner.totals.entry(msg.status).or_default() += 1;
                    inner.total += 1;
                }
            }
        }

        Ok(())
    }

    pub async fn reset(&self) -> Result<(), Error> {
        match self {
            Stats::Relational(s) => {
                sqlx::query("DELETE FROM message_stats")
                    .execute(&s.pool)
                    .await?;
            }
            Stats::KeyValue(s) => {
                let mut inner = s.inner.lock().expect("stats lock");
                inner.cells.clear();
                inner.totals.clear();
                inner.total = 0;
            }
        }
        Ok(())
    }

    pub async fn cells(&self) -> Result<Vec<StatsCell>, Error> {
        match self {
            Stats::Relational(s) => {
                s.cells_since(NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"))
                    .await
            }
            Stats::KeyValue(s) => {
                let inner = s.inner.lock().expect("stats lock");
                Ok(inner
                    .cells
                    .iter()
                    .map(|((date, hour, status), count)| StatsCell {
                        date: *date,
                        hour: *hour,
                        status: *status,
                        count: *count,
                    })
                    .collect())
            }
        }
    }
}

#[derive(Clone)]
pub struct SqlStats {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct CellRow {
    date: String,
    hour: i64,
    status: String,
    count: i64,
}

impl SqlStats {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn bump_cell(&self, status: Status, at: DateTime<Utc>, delta: i64) -> Result<(), Error> {
        let date = at.date_naive().to_string();
        let hour = at.hour() as i64;

        if delta > 0 {
            sqlx::query(
                "
                INSERT INTO message_stats (date, hour, status, count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (date, hour, status) DO UPDATE SET count = count + $4
                ",
            )
            .bind(&date)
            .bind(hour)
            .bind(status.as_str())
            .bind(delta)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "
                UPDATE message_stats SET count = MAX(count + $4, 0)
                WHERE date = $1 AND hour = $2 AND status = $3
                ",
            )
            .bind(&date)
            .bind(hour)
            .bind(status.as_str())
            .bind(delta)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn cells_since(&self, date: NaiveDate) -> Result<Vec<StatsCell>, Error> {
        let rows: Vec<CellRow> = sqlx::query_as(
            "SELECT date, hour, status, count FROM message_stats WHERE date >= $1",
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StatsCell {
                    date: row
                        .date
                        .parse()
                        .map_err(|e| Error::internal(eyre::eyre!("bad stats date: {e}")))?,
                    hour: row.hour.clamp(0, 23) as u32,
                    status: row.status.parse()?,
                    count: row.count,
                })
            })
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct KvStats {
    inner: Arc<Mutex<KvStatsInner>>,
}

#[derive(Default)]
struct KvStatsInner {
    cells: HashMap<(NaiveDate, u32, Status), i64>,
    totals: HashMap<Status, i64>,
    total: i64,
}

impl KvStatsInner {
    fn bump(&mut self, status: Status, at: DateTime<Utc>, delta: i64) {
        let key = (at.date_naive(), at.hour(), status);
        let cell = self.cells.entry(key).or_default();
        *cell = (*cell + delta).max(0);
    }
}

impl KvStats {
    fn bump(&self, status: Status, at: DateTime<Utc>, delta: i64) {
        let mut inner = self.inner.lock().expect("stats lock");
        inner.bump(status, at, delta);
        let total = inner.totals.entry(status).or_default();
        *total = (*total + delta).max(0);
    }
}

fn cell_instant(cell: &StatsCell) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &cell
            .date
            .and_hms_opt(cell.hour, 0, 0)
            .unwrap_or_else(|| cell.date.and_hms_opt(0, 0, 0).expect("midnight exists")),
    )
}

fn assemble(
    total: u64,
    by_status: BTreeMap<Status, u64>,
    cells: &[StatsCell],
    now: DateTime<Utc>,
) -> StatsSnapshot {
    let day_ago = now - Duration::hours(24);
    let week_ago = now.date_naive() - Duration::days(6);

    let last_24h = cells
        .iter()
        .filter(|c| cell_instant(c) > day_ago && cell_instant(c) <= now)
        .map(|c| c.count.max(0) as u64)
        .sum();

    let last_7d = cells
        .iter()
        .filter(|c| c.date >= week_ago)
        .map(|c| c.count.max(0) as u64)
        .sum();

    // 24 hour-of-day slots ending at the current hour, oldest first
    let hourly = (0..24)
        .rev()
        .map(|back| {
            let slot = now - Duration::hours(back);
            let count = cells
                .iter()
                .filter(|c| c.date == slot.date_naive() && c.hour == slot.hour())
                .map(|c| c.count.max(0) as u64)
                .sum();
            HourlySlot {
                hour: slot.hour(),
                count,
            }
        })
        .collect();

    // 7 calendar days ending today, oldest first
    let daily = (0..7)
        .rev()
        .map(|back| {
            let date = now.date_naive() - Duration::days(back);
            let sum_for = |status: Status| {
                cells
                    .iter()
                    .filter(|c| c.date == date && c.status == status)
                    .map(|c| c.count.max(0) as u64)
                    .sum()
            };
            DailySlot {
                date,
                incoming: sum_for(Status::Created),
                sent: sum_for(Status::Sent),
            }
        })
        .collect();

    StatsSnapshot {
        total,
        by_status,
        last_24h,
        last_7d,
        hourly,
        daily,
    }
}
