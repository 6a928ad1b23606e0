use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ProcessKind;

const LOG_SUFFIX: &str = "jsonl";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: String,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

fn file_prefix(process: ProcessKind) -> String {
    format!("taskline.{}", process.as_str())
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), a
/// compact console layer and a daily JSONL file under `logs_dir`.
///
/// Files of the same process older than `retention_days` are pruned first.
/// The returned guard must be held for as long as file output is wanted.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = file_prefix(process);
    let today = Utc::now().date_naive();
    let pruned_files = prune_expired_logs(logs_dir, &prefix, today, retention_days)?;

    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let jsonl = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console = tracing_subscriber::fmt::layer().compact().with_target(true);

    // A second init in the same process (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(jsonl)
        .try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.display().to_string(),
            file_prefix: prefix,
            retention_days,
            pruned_files,
            initialized_at: Utc::now(),
        },
    ))
}

/// Date stamped into a rolled file name `<prefix>.YYYY-MM-DD.jsonl`.
fn rolled_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    today: NaiveDate,
    retention_days: u64,
) -> anyhow::Result<usize> {
    let oldest_kept = today - chrono::Duration::days(retention_days as i64);
    let mut pruned = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| rolled_file_date(name, prefix))
            .is_some_and(|date| date < oldest_kept);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_names_parse_per_process() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).expect("date");
        assert_eq!(
            rolled_file_date("taskline.server.2024-03-09.jsonl", "taskline.server"),
            Some(date)
        );
        assert_eq!(
            rolled_file_date("taskline.dispatcher.2024-03-09.jsonl", "taskline.server"),
            None
        );
        assert_eq!(rolled_file_date("taskline.server.latest.jsonl", "taskline.server"), None);
    }

    #[test]
    fn prune_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let today = NaiveDate::from_ymd_opt(2024, 3, 20).expect("date");
        let expired = dir.path().join("taskline.server.2024-03-01.jsonl");
        let recent = dir.path().join("taskline.server.2024-03-15.jsonl");
        let foreign = dir.path().join("taskline.dispatcher.2024-03-01.jsonl");
        for path in [&expired, &recent, &foreign] {
            fs::write(path, "{}\n").expect("write");
        }

        let pruned =
            prune_expired_logs(dir.path(), "taskline.server", today, 7).expect("prune");
        assert_eq!(pruned, 1);
        assert!(!expired.exists());
        assert!(recent.exists());
        assert!(foreign.exists());
    }
}
