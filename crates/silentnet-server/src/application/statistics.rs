//! Pure statistics over the stored event data.
//!
//! Nothing here touches the database: the event log reads raw rows and hands
//! them to these functions, which keeps the arithmetic testable with plain
//! values.  All timestamps are local wall-clock [`NaiveDateTime`]s rendered
//! as [`TIMESTAMP_FORMAT`].

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

/// Wire and storage format of every timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Linux `KEY_SPACE`: input events with this key code count as words.
pub const SPACE_KEY_CODE: &str = "57";

/// Separator between inactive intervals in the stored blob.
const INTERVAL_TERMINATOR: char = ';';

/// Separator between CPU sample batches in the stored blob.
pub const CPU_BATCH_DELIMITER: char = '|';

/// Most histogram entries returned for one client.
pub const MAX_HISTOGRAM_ENTRIES: usize = 25;

/// Most recent CPU batches included in a stats document.
pub const MAX_CPU_BATCHES: usize = 20;

/// Most recent inactive intervals included in a stats document.
pub const MAX_IDLE_INTERVALS: usize = 50;

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

fn minutes_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_seconds() as f64 / 60.0
}

// ── Idle detection ───────────────────────────────────────────────────────────

/// One period without input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdleInterval {
    pub start: NaiveDateTime,
    pub minutes: f64,
    /// `true` for the still-open gap at query time; never persisted.
    pub provisional: bool,
}

impl IdleInterval {
    /// Renders the interval as stored: `start,minutes;`.
    pub fn to_record(&self) -> String {
        format!(
            "{},{:.2}{INTERVAL_TERMINATOR}",
            format_timestamp(self.start),
            self.minutes
        )
    }
}

/// Returns the interval to record when input arrives at `now` after the
/// previous input at `last`, or `None` if the gap is within `threshold`.
pub fn idle_gap(last: NaiveDateTime, now: NaiveDateTime, threshold: Duration) -> Option<IdleInterval> {
    if now - last > threshold {
        Some(IdleInterval {
            start: last,
            minutes: minutes_between(last, now),
            provisional: false,
        })
    } else {
        None
    }
}

/// Parses the stored `start,minutes;start,minutes;…` blob.  Malformed entries
/// are skipped.
pub fn parse_intervals(blob: &str) -> Vec<IdleInterval> {
    blob.split(INTERVAL_TERMINATOR)
        .filter_map(|entry| {
            let (start, minutes) = entry.rsplit_once(',')?;
            Some(IdleInterval {
                start: parse_timestamp(start)?,
                minutes: minutes.trim().parse().ok()?,
                provisional: false,
            })
        })
        .collect()
}

fn recorded_idle_minutes(intervals: &[IdleInterval]) -> f64 {
    intervals
        .iter()
        .filter(|i| !i.provisional)
        .map(|i| i.minutes)
        .sum()
}

/// Activity window of one client: first input, last input and every idle
/// interval (the provisional one, if any, last).
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityWindow {
    pub first_input: Option<NaiveDateTime>,
    pub last_input: Option<NaiveDateTime>,
    pub intervals: Vec<IdleInterval>,
}

impl ActivityWindow {
    /// Builds the window, appending a provisional interval when the client
    /// has been idle longer than `threshold` at `now`.
    pub fn new(
        first_input: Option<NaiveDateTime>,
        last_input: Option<NaiveDateTime>,
        mut intervals: Vec<IdleInterval>,
        now: NaiveDateTime,
        threshold: Duration,
    ) -> Self {
        if let Some(last) = last_input {
            if let Some(mut open) = idle_gap(last, now, threshold) {
                open.provisional = true;
                intervals.push(open);
            }
        }
        Self {
            first_input,
            last_input,
            intervals,
        }
    }

    /// Minutes between first and last input minus recorded idle time, never
    /// negative.
    pub fn active_minutes(&self) -> f64 {
        match (self.first_input, self.last_input) {
            (Some(first), Some(last)) => {
                (minutes_between(first, last) - recorded_idle_minutes(&self.intervals)).max(0.0)
            }
            _ => 0.0,
        }
    }

    /// Recorded plus provisional idle time.
    pub fn idle_minutes(&self) -> f64 {
        self.intervals.iter().map(|i| i.minutes).sum()
    }

    /// `words / active_minutes` with active minutes floored at one.
    pub fn words_per_minute(&self, words: u64) -> u64 {
        let active = (self.active_minutes().floor() as u64).max(1);
        words / active
    }

    /// Share of observed time spent active, 0..=100.  100 when nothing has
    /// been observed yet.
    pub fn active_percentage(&self) -> u32 {
        let active = self.active_minutes();
        let idle = self.idle_minutes();
        let total = active + idle;
        if total <= 0.0 {
            return 100;
        }
        (active / total * 100.0).round().clamp(0.0, 100.0) as u32
    }
}

/// `true` if an input payload (`device␟keycode`) is a space key press.
pub fn is_space_key(payload: &[u8]) -> bool {
    payload
        .rsplit(|b| *b == 0x1F)
        .next()
        .and_then(|code| std::str::from_utf8(code).ok())
        .map(|code| code.trim() == SPACE_KEY_CODE)
        .unwrap_or(false)
}

// ── CPU usage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct CpuSample {
    core: u32,
    usage: f64,
    timestamp: Option<String>,
}

fn parse_sample(raw: &str) -> Option<CpuSample> {
    let mut parts = raw.trim().splitn(3, ',');
    let core = parts.next()?.trim().parse().ok()?;
    let usage = parts.next()?.trim().parse().ok()?;
    let timestamp = parts
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Some(CpuSample {
        core,
        usage,
        timestamp,
    })
}

/// Per-core usage series for the stats document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuSeries {
    /// Sample timestamps in arrival order, consecutive duplicates collapsed.
    pub labels: Vec<String>,
    pub data: CpuData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuData {
    /// Core ids, ascending.
    pub cores: Vec<u32>,
    /// `usage[i]` holds every sample of `cores[i]` in arrival order.
    pub usage: Vec<Vec<f64>>,
}

/// Parses the stored `batch|batch|…` blob (each batch `core,usage[,ts];…`),
/// keeping only the most recent `max_batches`.
pub fn parse_cpu_series(blob: &str, max_batches: usize) -> CpuSeries {
    let batches: Vec<&str> = blob
        .split(CPU_BATCH_DELIMITER)
        .filter(|b| !b.trim().is_empty())
        .collect();
    let recent = &batches[batches.len().saturating_sub(max_batches)..];

    let mut per_core: std::collections::BTreeMap<u32, Vec<f64>> = Default::default();
    let mut labels: Vec<String> = Vec::new();
    for sample in recent.iter().flat_map(|b| b.split(';')).filter_map(parse_sample) {
        per_core.entry(sample.core).or_default().push(sample.usage);
        if let Some(ts) = sample.timestamp {
            if labels.last() != Some(&ts) {
                labels.push(ts);
            }
        }
    }

    let (cores, usage) = per_core.into_iter().unzip();
    CpuSeries {
        labels,
        data: CpuData { cores, usage },
    }
}

// ── Histograms ───────────────────────────────────────────────────────────────

/// `(label, count)` pairs in chart-ready form.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Histogram {
    pub labels: Vec<String>,
    pub data: Vec<u64>,
}

impl Histogram {
    /// Sorts by count (descending, ties by label) and keeps the top `limit`.
    pub fn from_counts(mut counts: Vec<(String, u64)>, limit: usize) -> Self {
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        let (labels, data) = counts.into_iter().unzip();
        Self { labels, data }
    }
}

// ── Stats document ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InactivitySeries {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
    /// Parallel to `labels`: marks the still-open interval.
    pub provisional: Vec<bool>,
}

impl InactivitySeries {
    pub fn from_intervals(intervals: &[IdleInterval], limit: usize) -> Self {
        let recent = &intervals[intervals.len().saturating_sub(limit)..];
        Self {
            labels: recent.iter().map(|i| format_timestamp(i.start)).collect(),
            data: recent
                .iter()
                .map(|i| (i.minutes * 100.0).round() / 100.0)
                .collect(),
            provisional: recent.iter().map(|i| i.provisional).collect(),
        }
    }
}

/// The JSON document returned for a `get-client-stats` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStatistics {
    pub processes: Histogram,
    pub inactivity: InactivitySeries,
    pub wpm: u64,
    pub cpu_usage: CpuSeries,
    pub ips: Histogram,
}

impl ClientStatistics {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("valid timestamp")
    }

    fn five_minutes() -> Duration {
        Duration::minutes(5)
    }

    // ── Idle detection ───────────────────────────────────────────────────────

    #[test]
    fn test_idle_gap_records_interval_after_six_minutes() {
        // Arrange
        let last = ts("2024-05-01 09:00:00");
        let now = ts("2024-05-01 09:06:00");

        // Act
        let gap = idle_gap(last, now, five_minutes()).expect("gap above threshold");

        // Assert
        assert_eq!(gap.start, last);
        assert!((gap.minutes - 6.0).abs() < f64::EPSILON);
        assert_eq!(gap.to_record(), "2024-05-01 09:00:00,6.00;");
    }

    #[test]
    fn test_idle_gap_ignores_four_minutes() {
        let last = ts("2024-05-01 09:00:00");
        assert_eq!(idle_gap(last, ts("2024-05-01 09:04:00"), five_minutes()), None);
    }

    #[test]
    fn test_idle_gap_at_exact_threshold_is_not_idle() {
        let last = ts("2024-05-01 09:00:00");
        assert_eq!(idle_gap(last, ts("2024-05-01 09:05:00"), five_minutes()), None);
    }

    #[test]
    fn test_parse_intervals_skips_garbage_entries() {
        let blob = "2024-05-01 09:00:00,6.00;nonsense;2024-05-01 10:00:00,7.50;";
        let intervals = parse_intervals(blob);
        assert_eq!(intervals.len(), 2);
        assert!((intervals[1].minutes - 7.5).abs() < f64::EPSILON);
    }

    // ── WPM and active percentage ────────────────────────────────────────────

    #[test]
    fn test_words_per_minute_subtracts_recorded_idle() {
        // Arrange: first T, last T+10, one 2-minute idle interval, 24 spaces.
        let window = ActivityWindow::new(
            Some(ts("2024-05-01 09:00:00")),
            Some(ts("2024-05-01 09:10:00")),
            parse_intervals("2024-05-01 09:02:00,2.00;"),
            ts("2024-05-01 09:11:00"),
            five_minutes(),
        );

        // Act / Assert
        assert!((window.active_minutes() - 8.0).abs() < f64::EPSILON);
        assert_eq!(window.words_per_minute(24), 3);
    }

    #[test]
    fn test_words_per_minute_excludes_provisional_interval() {
        // Queried an hour after the last input: the open gap must not reduce
        // the active time used for typing speed.
        let window = ActivityWindow::new(
            Some(ts("2024-05-01 09:00:00")),
            Some(ts("2024-05-01 09:10:00")),
            Vec::new(),
            ts("2024-05-01 10:10:00"),
            five_minutes(),
        );
        assert!(window.intervals[0].provisional);
        assert_eq!(window.words_per_minute(50), 5);
    }

    #[test]
    fn test_words_per_minute_floors_active_time_at_one_minute() {
        let window = ActivityWindow::new(
            Some(ts("2024-05-01 09:00:00")),
            Some(ts("2024-05-01 09:00:20")),
            Vec::new(),
            ts("2024-05-01 09:00:30"),
            five_minutes(),
        );
        assert_eq!(window.words_per_minute(7), 7);
    }

    #[test]
    fn test_active_percentage_without_any_data_is_100() {
        let window = ActivityWindow::new(None, None, Vec::new(), ts("2024-05-01 09:00:00"), five_minutes());
        assert_eq!(window.active_percentage(), 100);
    }

    #[test]
    fn test_active_percentage_includes_provisional_idle() {
        // Arrange: 10 minutes active, then idle for 10 minutes at query time.
        let window = ActivityWindow::new(
            Some(ts("2024-05-01 09:00:00")),
            Some(ts("2024-05-01 09:10:00")),
            Vec::new(),
            ts("2024-05-01 09:20:00"),
            five_minutes(),
        );

        // Act / Assert
        assert_eq!(window.active_percentage(), 50);
    }

    #[test]
    fn test_is_space_key_reads_last_field() {
        assert!(is_space_key(b"keyboard\x1f57"));
        assert!(is_space_key(b"57"));
        assert!(!is_space_key(b"keyboard\x1f157"));
        assert!(!is_space_key(b"keyboard\x1f30"));
    }

    // ── CPU usage ────────────────────────────────────────────────────────────

    #[test]
    fn test_parse_cpu_series_groups_by_sorted_core() {
        // Arrange
        let blob = "1,40.0,10:00:00;0,10.0,10:00:00|0,20.0,10:00:05;1,50.0,10:00:05|";

        // Act
        let series = parse_cpu_series(blob, MAX_CPU_BATCHES);

        // Assert
        assert_eq!(series.data.cores, vec![0, 1]);
        assert_eq!(series.data.usage, vec![vec![10.0, 20.0], vec![40.0, 50.0]]);
        assert_eq!(series.labels, vec!["10:00:00", "10:00:05"]);
    }

    #[test]
    fn test_parse_cpu_series_keeps_only_recent_batches() {
        let blob = "0,1.0|0,2.0|0,3.0|";
        let series = parse_cpu_series(blob, 2);
        assert_eq!(series.data.usage, vec![vec![2.0, 3.0]]);
        assert!(series.labels.is_empty());
    }

    #[test]
    fn test_parse_cpu_series_of_empty_blob_is_empty() {
        assert_eq!(parse_cpu_series("", MAX_CPU_BATCHES), CpuSeries::default());
    }

    // ── Histograms and document ──────────────────────────────────────────────

    #[test]
    fn test_histogram_orders_most_frequent_first_and_truncates() {
        let counts = vec![
            ("b".to_string(), 2),
            ("a".to_string(), 2),
            ("c".to_string(), 9),
            ("d".to_string(), 1),
        ];
        let hist = Histogram::from_counts(counts, 3);
        assert_eq!(hist.labels, vec!["c", "a", "b"]);
        assert_eq!(hist.data, vec![9, 2, 2]);
    }

    #[test]
    fn test_stats_document_has_expected_shape() {
        // Arrange
        let stats = ClientStatistics {
            wpm: 3,
            ..Default::default()
        };

        // Act
        let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();

        // Assert
        assert_eq!(json["wpm"], 3);
        assert!(json["processes"]["labels"].is_array());
        assert!(json["inactivity"]["provisional"].is_array());
        assert!(json["cpu_usage"]["data"]["cores"].is_array());
        assert!(json["ips"]["data"].is_array());
    }
}
