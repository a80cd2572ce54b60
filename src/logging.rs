//! File-backed log handles.
//!
//! [`custom_logger`] returns a [`FileLogger`] that owns its log file. Events
//! emitted through the handle (or by any `tracing` macro inside
//! [`FileLogger::in_scope`]) are appended to the file as
//! `<timestamp> — <LEVEL>: <message>`. The file is closed when the handle is
//! dropped.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::error::{EsinetError, EsinetResult};

/// `<timestamp> — <LEVEL>: <fields>` on one line.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        SystemTime.format_time(&mut writer)?;
        write!(writer, " — {}: ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Handle to a log file opened in append mode.
pub struct FileLogger {
    path: PathBuf,
    dispatch: Dispatch,
}

impl fmt::Debug for FileLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLogger").field("path", &self.path).finish()
    }
}

/// Open (or create) `path` for appending and return a logger writing to it.
///
/// Events below `level` are discarded.
pub fn custom_logger(path: impl AsRef<Path>, level: Level) -> EsinetResult<FileLogger> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| EsinetError::io(&path, e))?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(Mutex::new(file))
        .event_format(LineFormat)
        .finish();

    Ok(FileLogger {
        path,
        dispatch: Dispatch::new(subscriber),
    })
}

impl FileLogger {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with this logger as the thread's default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn error(&self, message: &str) {
        self.in_scope(|| tracing::error!("{message}"));
    }

    pub fn warn(&self, message: &str) {
        self.in_scope(|| tracing::warn!("{message}"));
    }

    pub fn info(&self, message: &str) {
        self.in_scope(|| tracing::info!("{message}"));
    }

    pub fn debug(&self, message: &str) {
        self.in_scope(|| tracing::debug!("{message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn log_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("esinet-{name}-{}.log", std::process::id()));
        fs::remove_file(&path).ok();
        path
    }

    #[test]
    fn test_writes_formatted_line() {
        let path = log_path("format");
        {
            let logger = custom_logger(&path, Level::DEBUG).expect("logger");
            logger.info("Here is some info written to the file");
            assert_eq!(logger.path(), path.as_path());
        }
        let text = fs::read_to_string(&path).expect("read log");
        let line = text.lines().next().expect("one line");
        assert!(line.ends_with(" — INFO: Here is some info written to the file"));
        // timestamp first, e.g. 2024-01-01T00:00:00.000000Z
        assert!(line.chars().next().is_some_and(|c| c.is_ascii_digit()));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_level_filter() {
        let path = log_path("level");
        {
            let logger = custom_logger(&path, Level::WARN).expect("logger");
            logger.debug("hidden");
            logger.info("hidden");
            logger.warn("shown");
            logger.in_scope(|| tracing::error!(code = 3, "macro event"));
        }
        let text = fs::read_to_string(&path).expect("read log");
        assert!(!text.contains("hidden"));
        assert!(text.contains("WARN: shown"));
        assert!(text.contains("ERROR: macro event"));
        assert_eq!(text.lines().count(), 2);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_appends_across_loggers() {
        let path = log_path("append");
        custom_logger(&path, Level::DEBUG).expect("logger").info("first");
        custom_logger(&path, Level::DEBUG).expect("logger").info("second");
        let text = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
        fs::remove_file(path).ok();
    }
}
