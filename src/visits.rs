//! Access log analytics behind the `report-visits-by-ip` action.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use log::{debug, info};
use thiserror::Error;

use crate::logscan::ReverseLines;

/// How far back the report looks.
pub const REPORT_WINDOW_MINUTES: i64 = 20;

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S";
const TIMESTAMP_OFFSET_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot extract a client address from an empty line")]
    EmptyLine,
    #[error("failed to read access log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRecord {
    pub address: String,
    pub count: u64,
}

/// The bracketed timestamp of a combined log line in UTC, or `None` for
/// lines that do not look like one.
///
/// A `+hhmm`/`-hhmm` offset in the fifth field is honoured; without one the
/// time is taken to be UTC already.
pub fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let mut fields = line.split_whitespace().skip(3);
    let raw = fields.next()?.strip_prefix('[')?;
    if let Some(raw) = raw.strip_suffix(']') {
        return parse_naive(raw);
    }

    match fields.next().and_then(|f| f.strip_suffix(']')) {
        Some(offset) if offset.starts_with(['+', '-']) => {
            DateTime::parse_from_str(&format!("{raw} {offset}"), TIMESTAMP_OFFSET_FORMAT)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        }
        _ => parse_naive(raw),
    }
}

fn parse_naive(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|ts| ts.and_utc())
}

/// The client address, i.e. the first field of the line.
pub fn client_address(line: &str) -> Result<&str, ScanError> {
    line.split_whitespace().next().ok_or(ScanError::EmptyLine)
}

/// Counts requests per client address over the trailing `window`.
///
/// Lines must arrive newest first. Malformed lines are skipped; the scan
/// stops at the first well-formed line older than the window, so only the
/// tail of the log is ever read. The result is ordered by descending
/// count, ties by address.
pub fn summarize<I>(lines: I, now: DateTime<Utc>, window: TimeDelta) -> Result<Vec<VisitRecord>, ScanError>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: HashMap<String, u64> = HashMap::new();
    let recent = lines
        .into_iter()
        .filter(|line| line.split_whitespace().count() >= 4)
        .filter_map(|line| line_timestamp(&line).map(|ts| (line, ts)))
        .take_while(|(_, ts)| now.signed_duration_since(*ts) <= window);

    for (line, _) in recent {
        let address = client_address(&line)?;
        *counts.entry(address.to_string()).or_insert(0) += 1;
    }

    let mut records: Vec<VisitRecord> = counts
        .into_iter()
        .map(|(address, count)| VisitRecord { address, count })
        .collect();
    records.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.address.cmp(&b.address)));
    Ok(records)
}

/// Renders the records as a two column table.
pub fn format_table(records: &[VisitRecord]) -> String {
    const IP_HEADER: &str = "IP";
    const COUNT_HEADER: &str = "Requests";

    let ip_width = records
        .iter()
        .map(|r| r.address.len())
        .chain(std::iter::once(IP_HEADER.len()))
        .max()
        .unwrap_or(IP_HEADER.len());
    let count_width = records
        .iter()
        .map(|r| r.count.to_string().len())
        .chain(std::iter::once(COUNT_HEADER.len()))
        .max()
        .unwrap_or(COUNT_HEADER.len());

    let mut out = format!("{IP_HEADER:<ip_width$}  {COUNT_HEADER:>count_width$}\n");
    out.push_str(&format!("{}  {}\n", "-".repeat(ip_width), "-".repeat(count_width)));
    for record in records {
        out.push_str(&format!(
            "{:<ip_width$}  {:>count_width$}\n",
            record.address, record.count
        ));
    }
    out
}

/// Runs the `report-visits-by-ip` action against the access log.
pub fn report_visits_by_ip(log_path: &Path, now: DateTime<Utc>) -> Result<String, ScanError> {
    let io_err = |source| ScanError::Io {
        path: log_path.display().to_string(),
        source,
    };
    let scanner = ReverseLines::open(log_path).map_err(io_err)?;

    let mut read_error = None;
    let lines = scanner.map_while(|line| match line {
        Ok(line) => Some(line),
        Err(e) => {
            read_error = Some(e);
            None
        }
    });
    let records = summarize(lines, now, TimeDelta::minutes(REPORT_WINDOW_MINUTES))?;
    if let Some(e) = read_error {
        return Err(io_err(e));
    }

    debug!("Access log scan found {} distinct clients", records.len());
    info!("Reported visits for {} client address(es)", records.len());
    Ok(format_table(&records))
}
