//! Durable event rows per client and the queries behind the statistics.
//!
//! Two row shapes share the `logs` table:
//!
//! - **counted** rows (`CPO`, `CIE`, `COT`): one row per distinct payload,
//!   `count` incremented on repeat through the unique `(id, type, data)`
//!   index;
//! - **scalar** rows (`FIT`, `LIT`, `INA`, `CCU`): exactly one row per client
//!   and type, created by [`EventLog::client_setup`] and rewritten in place.
//!
//! `data` is always bound as a blob so that equality in the unique index
//! never depends on how a value was typed.

use chrono::{Duration, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use super::database::Database;
use crate::application::statistics::{
    format_timestamp, idle_gap, is_space_key, parse_cpu_series, parse_intervals, parse_timestamp,
    ActivityWindow, ClientStatistics, CpuSeries, Histogram, InactivitySeries, CPU_BATCH_DELIMITER,
    MAX_CPU_BATCHES, MAX_HISTOGRAM_ENTRIES, MAX_IDLE_INTERVALS,
};

/// Row types stored in `logs.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    ProcessOpen,
    InputEvent,
    IpContact,
    FirstInput,
    LastInput,
    InactiveIntervals,
    CpuUsage,
}

impl LogKind {
    pub const SCALARS: [LogKind; 4] = [
        LogKind::FirstInput,
        LogKind::LastInput,
        LogKind::InactiveIntervals,
        LogKind::CpuUsage,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LogKind::ProcessOpen => "CPO",
            LogKind::InputEvent => "CIE",
            LogKind::IpContact => "COT",
            LogKind::FirstInput => "FIT",
            LogKind::LastInput => "LIT",
            LogKind::InactiveIntervals => "INA",
            LogKind::CpuUsage => "CCU",
        }
    }

    pub const fn is_counted(self) -> bool {
        matches!(
            self,
            LogKind::ProcessOpen | LogKind::InputEvent | LogKind::IpContact
        )
    }
}

/// Borrowing view over the `logs` table.
#[derive(Debug, Clone, Copy)]
pub struct EventLog<'a> {
    db: &'a Database,
    idle_threshold: Duration,
}

impl<'a> EventLog<'a> {
    pub fn new(db: &'a Database, idle_threshold: Duration) -> Self {
        Self { db, idle_threshold }
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Creates the empty scalar rows for `id`.  Idempotent.
    pub fn client_setup(&self, id: i64) -> bool {
        self.db.run("client setup", |conn| {
            setup(conn, id)?;
            Ok(true)
        })
    }

    /// Increments the counted row `(id, kind, data)`, inserting it with
    /// count 1 on first sight.
    pub fn record(&self, id: i64, kind: LogKind, data: &[u8]) -> bool {
        if !kind.is_counted() {
            warn!(kind = kind.as_str(), "refusing counted write to a scalar row type");
            return false;
        }
        self.db.run("record event", |conn| {
            increment(conn, id, kind, data)?;
            Ok(true)
        })
    }

    /// Records an input event at `now` together with the idle bookkeeping:
    /// a gap above the idle threshold since the last input is appended to the
    /// inactive intervals, the first input time is set once, and the last
    /// input time always moves to `now`.
    pub fn record_input(&self, id: i64, data: &[u8], now: NaiveDateTime) -> bool {
        let threshold = self.idle_threshold;
        self.db.run("record input", |conn| {
            let stamp = format_timestamp(now);

            if let Some(last) = parse_timestamp(&scalar(conn, id, LogKind::LastInput)?) {
                if let Some(gap) = idle_gap(last, now, threshold) {
                    debug!(id, minutes = gap.minutes, "client was idle");
                    let mut intervals = scalar(conn, id, LogKind::InactiveIntervals)?;
                    intervals.push_str(&gap.to_record());
                    set_scalar(conn, id, LogKind::InactiveIntervals, &intervals)?;
                }
            }
            if scalar(conn, id, LogKind::FirstInput)?.is_empty() {
                set_scalar(conn, id, LogKind::FirstInput, &stamp)?;
            }
            set_scalar(conn, id, LogKind::LastInput, &stamp)?;

            increment(conn, id, LogKind::InputEvent, data)?;
            Ok(true)
        })
    }

    /// Appends one batch of `core,usage[,ts]` samples to the CPU series.
    pub fn append_cpu_usage(&self, id: i64, batch: &str) -> bool {
        self.db.run("append cpu usage", |conn| {
            let mut series = scalar(conn, id, LogKind::CpuUsage)?;
            series.push_str(batch.trim_end_matches(CPU_BATCH_DELIMITER));
            series.push(CPU_BATCH_DELIMITER);
            set_scalar(conn, id, LogKind::CpuUsage, &series)?;
            Ok(true)
        })
    }

    /// Deletes every row of `id`, scalar rows included.
    pub fn clear_client(&self, id: i64) -> bool {
        self.db.run("clear client", |conn| {
            conn.execute("DELETE FROM logs WHERE id = ?1", params![id])?;
            Ok(true)
        })
    }

    /// Wipes every log row and re-creates the scalar rows of every known
    /// identity, then reclaims the freed space.
    pub fn erase_all(&self) -> bool {
        let erased = self.db.run("erase all logs", |conn| {
            let removed = conn.execute("DELETE FROM logs", [])?;
            let ids: Vec<i64> = {
                let mut stmt = conn.prepare("SELECT id FROM uid ORDER BY id")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            for id in &ids {
                setup(conn, *id)?;
            }
            debug!(removed, clients = ids.len(), "log rows erased");
            Ok(true)
        });
        if erased {
            self.db.vacuum();
        }
        erased
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// `(payload, count)` pairs of a counted type, most frequent first.
    pub fn histogram(&self, id: i64, kind: LogKind) -> Histogram {
        to_histogram(self.db.run("histogram", |conn| counted_rows(conn, id, kind)))
    }

    /// First/last input and the idle intervals as seen at `now`.
    pub fn activity_window(&self, id: i64, now: NaiveDateTime) -> ActivityWindow {
        let threshold = self.idle_threshold;
        self.db
            .transaction("activity window", |conn| {
                window_at(conn, id, now, threshold)
            })
            .unwrap_or_else(|_| ActivityWindow::new(None, None, Vec::new(), now, threshold))
    }

    pub fn words_per_minute(&self, id: i64, now: NaiveDateTime) -> u64 {
        let words = self.db.run("space count", |conn| space_count(conn, id));
        self.activity_window(id, now).words_per_minute(words)
    }

    pub fn active_percentage(&self, id: i64, now: NaiveDateTime) -> u32 {
        self.activity_window(id, now).active_percentage()
    }

    pub fn cpu_usage(&self, id: i64) -> CpuSeries {
        let blob = self.db.run("cpu usage", |conn| scalar(conn, id, LogKind::CpuUsage));
        parse_cpu_series(&blob, MAX_CPU_BATCHES)
    }

    /// Everything a manager's stats screen needs, read in one transaction.
    pub fn client_stats(&self, id: i64, now: NaiveDateTime) -> ClientStatistics {
        let threshold = self.idle_threshold;
        self.db.run("client stats", |conn| {
            let window = window_at(conn, id, now, threshold)?;

            Ok(ClientStatistics {
                processes: to_histogram(counted_rows(conn, id, LogKind::ProcessOpen)?),
                inactivity: InactivitySeries::from_intervals(&window.intervals, MAX_IDLE_INTERVALS),
                wpm: window.words_per_minute(space_count(conn, id)?),
                cpu_usage: parse_cpu_series(
                    &scalar(conn, id, LogKind::CpuUsage)?,
                    MAX_CPU_BATCHES,
                ),
                ips: to_histogram(counted_rows(conn, id, LogKind::IpContact)?),
            })
        })
    }
}

fn to_histogram(rows: Vec<(Vec<u8>, u64)>) -> Histogram {
    let counts = rows
        .into_iter()
        .map(|(data, count)| (String::from_utf8_lossy(&data).into_owned(), count))
        .collect();
    Histogram::from_counts(counts, MAX_HISTOGRAM_ENTRIES)
}

// ── SQL helpers ──────────────────────────────────────────────────────────────

fn setup(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    for kind in LogKind::SCALARS {
        conn.execute(
            "INSERT INTO logs (id, type, data)
             SELECT ?1, ?2, ?3
             WHERE NOT EXISTS (SELECT 1 FROM logs WHERE id = ?1 AND type = ?2)",
            params![id, kind.as_str(), &b""[..]],
        )?;
    }
    Ok(())
}

fn increment(conn: &Connection, id: i64, kind: LogKind, data: &[u8]) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO logs (id, type, data) VALUES (?1, ?2, ?3)
         ON CONFLICT (id, type, data) DO UPDATE SET count = count + 1",
        params![id, kind.as_str(), data],
    )?;
    Ok(())
}

fn data_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        _ => String::new(),
    })
}

fn data_bytes(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<u8>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => bytes.to_vec(),
        _ => Vec::new(),
    })
}

fn scalar(conn: &Connection, id: i64, kind: LogKind) -> rusqlite::Result<String> {
    Ok(conn
        .query_row(
            "SELECT data FROM logs WHERE id = ?1 AND type = ?2",
            params![id, kind.as_str()],
            |row| data_text(row, 0),
        )
        .optional()?
        .unwrap_or_default())
}

fn set_scalar(conn: &Connection, id: i64, kind: LogKind, value: &str) -> rusqlite::Result<()> {
    let updated = conn.execute(
        "UPDATE logs SET data = ?3 WHERE id = ?1 AND type = ?2",
        params![id, kind.as_str(), value.as_bytes()],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO logs (id, type, data) VALUES (?1, ?2, ?3)",
            params![id, kind.as_str(), value.as_bytes()],
        )?;
    }
    Ok(())
}

fn counted_rows(conn: &Connection, id: i64, kind: LogKind) -> rusqlite::Result<Vec<(Vec<u8>, u64)>> {
    let mut stmt = conn.prepare("SELECT data, count FROM logs WHERE id = ?1 AND type = ?2")?;
    let rows = stmt.query_map(params![id, kind.as_str()], |row| {
        Ok((data_bytes(row, 0)?, row.get::<_, i64>(1)?.max(0) as u64))
    })?;
    rows.collect()
}

fn space_count(conn: &Connection, id: i64) -> rusqlite::Result<u64> {
    Ok(counted_rows(conn, id, LogKind::InputEvent)?
        .into_iter()
        .filter(|(data, _)| is_space_key(data))
        .map(|(_, count)| count)
        .sum())
}

fn window_at(
    conn: &Connection,
    id: i64,
    now: NaiveDateTime,
    threshold: Duration,
) -> rusqlite::Result<ActivityWindow> {
    Ok(ActivityWindow::new(
        parse_timestamp(&scalar(conn, id, LogKind::FirstInput)?),
        parse_timestamp(&scalar(conn, id, LogKind::LastInput)?),
        parse_intervals(&scalar(conn, id, LogKind::InactiveIntervals)?),
        now,
        threshold,
    ))
}

// ── Tests ────────────────────────────────────────────────────────────────────
