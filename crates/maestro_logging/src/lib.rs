//! Logging bootstrap for Maestro binaries.
//!
//! The daemon is long-lived and its interesting events cluster around
//! run boundaries, so logs are kept as one file per day
//! (`<app>-YYYYMMDD.log`) under the Maestro home directory. The writer
//! rolls over at the first write past midnight UTC and prunes day
//! files older than the retention window on each rollover.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "maestro=info,maestrod=info";

/// Day files older than this are pruned at rollover.
const KEEP_DAYS: i64 = 14;

/// Logging configuration shared by Maestro binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing: a per-day file layer and a stderr layer. The
/// file layer honors RUST_LOG; the console stays quiet unless verbose.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = DailyLogWriter::open(log_dir, config.app_name)
        .context("Failed to open the daily log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The Maestro home directory: ~/.maestro (or $MAESTRO_HOME).
pub fn maestro_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("MAESTRO_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".maestro")
}

/// The logs directory: ~/.maestro/logs
pub fn logs_dir() -> PathBuf {
    maestro_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn day_file_name(app: &str, date: NaiveDate) -> String {
    format!("{}-{}.log", app, date.format("%Y%m%d"))
}

/// Parse the date out of a day-file name produced by [`day_file_name`]
/// for this app; foreign files yield None and are left alone.
fn day_file_date(app: &str, file_name: &str) -> Option<NaiveDate> {
    let stamp = file_name
        .strip_prefix(app)?
        .strip_prefix('-')?
        .strip_suffix(".log")?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
}

struct OpenDay {
    date: NaiveDate,
    file: File,
}

struct WriterState {
    dir: PathBuf,
    app: String,
    current: Option<OpenDay>,
}

impl WriterState {
    fn file_for_today(&mut self) -> io::Result<&mut File> {
        let today = Utc::now().date_naive();
        let stale = match &self.current {
            Some(open) => open.date != today,
            None => true,
        };
        if stale {
            let rolled_over = self.current.take().is_some();
            let path = self.dir.join(day_file_name(&self.app, today));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some(OpenDay { date: today, file });
            if rolled_over {
                // Best effort: a failed prune must not lose the line
                // being written.
                let _ = prune_old_days(&self.dir, &self.app, today);
            }
        }
        // The option was just populated above when empty.
        match self.current.as_mut() {
            Some(open) => Ok(&mut open.file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file unavailable")),
        }
    }
}

fn prune_old_days(dir: &Path, app: &str, today: NaiveDate) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(date) = day_file_date(app, name) {
            if (today - date).num_days() > KEEP_DAYS {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

/// Writes tracing output into the current day's file, rolling over and
/// pruning as dates change. The fmt layer owns one instance and
/// borrows a [`DailyLogHandle`] from it per event.
pub struct DailyLogWriter {
    state: Mutex<WriterState>,
}

impl DailyLogWriter {
    fn open(dir: PathBuf, app: &str) -> Result<Self> {
        let writer = Self {
            state: Mutex::new(WriterState {
                dir,
                app: sanitize_app_name(app),
                current: None,
            }),
        };
        // Open eagerly so a bad directory fails at startup, not at the
        // first log line.
        writer
            .state
            .lock()
            .unwrap()
            .file_for_today()
            .context("opening today's log file")?;
        Ok(writer)
    }
}

/// Borrowing writer handle the fmt layer asks for per event.
pub struct DailyLogHandle<'a> {
    writer: &'a DailyLogWriter,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for DailyLogWriter {
    type Writer = DailyLogHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyLogHandle { writer: self }
    }
}

impl Write for DailyLogHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .writer
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file_for_today()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .writer
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file_for_today()?.flush()
    }
}

fn sanitize_app_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_file_names_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 2).unwrap();
        let name = day_file_name("maestrod", date);
        assert_eq!(name, "maestrod-20260802.log");
        assert_eq!(day_file_date("maestrod", &name), Some(date));

        // Foreign files are not ours to touch.
        assert_eq!(day_file_date("maestrod", "maestrod.log"), None);
        assert_eq!(day_file_date("maestrod", "other-20260802.log"), None);
        assert_eq!(day_file_date("maestrod", "maestrod-notadate.log"), None);
    }

    #[test]
    fn writes_land_in_todays_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let writer = DailyLogWriter::open(tmp.path().to_path_buf(), "test").unwrap();

        use tracing_subscriber::fmt::MakeWriter;
        writer.make_writer().write_all(b"hello\n").unwrap();

        let today = Utc::now().date_naive();
        let path = tmp.path().join(day_file_name("test", today));
        assert_eq!(fs::read_to_string(path).unwrap(), "hello\n");
    }

    #[test]
    fn prune_removes_only_expired_own_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 8, 2).unwrap();
        let old = today - chrono::Duration::days(KEEP_DAYS + 1);
        let recent = today - chrono::Duration::days(1);

        for name in [
            day_file_name("test", old),
            day_file_name("test", recent),
            day_file_name("other", old),
            "unrelated.txt".to_string(),
        ] {
            fs::write(tmp.path().join(name), "x").unwrap();
        }

        prune_old_days(tmp.path(), "test", today).unwrap();

        assert!(!tmp.path().join(day_file_name("test", old)).exists());
        assert!(tmp.path().join(day_file_name("test", recent)).exists());
        assert!(tmp.path().join(day_file_name("other", old)).exists());
        assert!(tmp.path().join("unrelated.txt").exists());
    }

    #[test]
    fn app_names_are_sanitized() {
        assert_eq!(sanitize_app_name("maestro d/1"), "maestro_d_1");
    }
}
