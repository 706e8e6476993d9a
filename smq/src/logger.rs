use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use slog::{o, Drain};

use smq_conf::logging::To;

use crate::Result;

pub use slog::Logger;

/// Routes `log` records into `logger`, letting through `level` and above.
pub fn logger_init(logger: &Logger, level: slog::Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow::Error::msg(format!("logger init error, {}", e)))?;
    log::set_max_level(slog_to_log_level(level).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Builds the root logger: terminal-style lines written to the console,
/// the log file, both or nowhere, filtered by `level` and drained on a
/// background thread.
pub fn config_logger(filename: String, to: To, level: slog::Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator).build().fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    filename: String,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => open_file(&self.filename)?,
        };
        Ok(self.file.insert(file))
    }
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                self.console.write_all(buf)?;
                self.file()?.write(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => self.file()?.flush()?,
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| io::Error::new(e.kind(), format!("logger file config error, filename: {}, {}", filename, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(slog_to_log_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_to_log_level(log_to_slog_level(log::Level::Debug)), log::Level::Debug);
    }

    #[test]
    fn file_target() {
        let path = std::env::temp_dir().join(format!("smq-logger-test-{}.log", std::process::id()));
        let filename = path.to_string_lossy().into_owned();
        {
            let logger = config_logger(filename.clone(), To::File, slog::Level::Info);
            slog::info!(logger, "kept");
            slog::debug!(logger, "filtered");
        }
        // dropping the async drain flushes it
        std::thread::sleep(std::time::Duration::from_millis(50));
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        std::fs::remove_file(&path).ok();
        assert!(content.contains("kept"));
        assert!(!content.contains("filtered"));
    }

    #[test]
    fn unwritable_file_is_an_error() {
        let mut w = WriteFilter::new("/nonexistent-dir/smq.log".into(), To::File);
        assert!(w.write(b"x").is_err());
        let mut off = WriteFilter::new("/nonexistent-dir/smq.log".into(), To::Off);
        assert_eq!(off.write(b"xyz").unwrap(), 3);
    }
}
