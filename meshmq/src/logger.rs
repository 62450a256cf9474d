use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use slog::{o, Drain};

use crate::conf::logging::{Level, To};
use crate::conf::Settings;
use crate::Result;

pub use slog::Logger;

/// Builds the logger described by the `[log]` section and installs it.
pub fn init_logger(settings: &Settings) -> Result<()> {
    let logger = config_logger(settings.log.filename(), settings.log.to, settings.log.level);
    logger_init(logger, settings.log.level)?;
    settings.logs();
    Ok(())
}

/// Routes records of the `log` facade into `logger`.
///
/// Fails when another logger is already installed for the process.
pub fn logger_init(logger: Logger, level: Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger)))
        .map_err(|e| anyhow::Error::msg(format!("logger init error, {}", e)))?;
    log::set_max_level(slog_log_to_level(level.inner()).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
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

fn slog_log_to_level(level: slog::Level) -> log::Level {
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

/// Builds the root logger: `date LEVEL module.line | msg` lines, filtered by `level`,
/// written to the console and/or `filename` according to `to`, behind an async drain.
pub fn config_logger(filename: String, to: To, level: Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|io: &mut dyn io::Write| {
            write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .use_custom_header_print(print_line_header)
        .use_original_order()
        .build()
        .fuse();

    let drain = LevelFilter { drain, level: level.inner() }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

fn print_line_header(
    fn_timestamp: &dyn slog_term::ThreadSafeTimestampFn<Output = io::Result<()>>,
    mut rd: &mut dyn slog_term::RecordDecorator,
    record: &slog::Record,
    _use_file_location: bool,
) -> io::Result<bool> {
    rd.start_timestamp()?;
    fn_timestamp(&mut rd)?;

    rd.start_whitespace()?;
    write!(rd, " ")?;
    rd.start_level()?;
    write!(rd, "{}", record.level().as_short_str())?;

    rd.start_whitespace()?;
    write!(rd, " ")?;
    rd.start_location()?;
    write!(rd, "{}.{}", record.module(), record.line())?;

    rd.start_whitespace()?;
    write!(rd, " | ")?;
    rd.start_msg()?;
    let msg = record.msg().to_string();
    write!(rd, "{}", msg)?;
    Ok(!msg.is_empty())
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
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
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
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {}, {:?}", filename, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(slog_log_to_level(slog::Level::Warning), log::Level::Warn);
        assert_eq!(log_to_slog_level(log::Level::Debug), slog::Level::Debug);
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join(format!("meshmq-logger-test-{}.log", std::process::id()));
        let filename = path.to_string_lossy().to_string();
        {
            let mut w = WriteFilter::new(filename.clone(), To::File);
            w.write_all(b"hello\n").expect("write");
            w.flush().expect("flush");
        }
        let content = std::fs::read_to_string(&path).expect("read");
        let _ = std::fs::remove_file(&path);
        assert_eq!(content, "hello\n");

        let mut off = WriteFilter::new(String::new(), To::Off);
        assert_eq!(off.write(b"dropped").expect("write"), 7);
    }

    #[test]
    fn test_config_logger() {
        let logger = config_logger(String::new(), To::Off, slog::Level::Info.into());
        slog::info!(logger, "started"; "node" => 1);
    }

    #[test]
    fn test_line_layout() {
        let path = std::env::temp_dir().join(format!("meshmq-logger-layout-{}.log", std::process::id()));
        let filename = path.to_string_lossy().to_string();
        {
            let logger = config_logger(filename, To::File, slog::Level::Info.into());
            slog::info!(logger, "started"; "node" => 1);
            slog::debug!(logger, "filtered");
        }
        let content = std::fs::read_to_string(&path).expect("read");
        let _ = std::fs::remove_file(&path);

        let line = content.lines().next().expect("one line");
        assert!(line.contains(" INFO meshmq::logger::tests."), "{}", line);
        assert!(line.contains(" | started"), "{}", line);
        assert!(line.contains("node: 1"), "{}", line);
        assert!(!content.contains("filtered"));
    }

    #[test]
    fn test_init_logger() {
        let mut inner = crate::conf::Inner::default();
        inner.log.to = To::Off;
        let settings = Settings::from(inner);
        assert!(init_logger(&settings).is_ok());
        assert!(init_logger(&settings).is_err());
    }
}
