//! Logging setup. A thin wrapper over `env_logger` -- the same
//! combination the vendored SSH library itself reaches for in its own
//! dev-dependencies -- configured from [`crate::config::Config`]
//! instead of the `RUST_LOG` environment variable alone.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use log::LevelFilter;

use crate::config::Config;

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Initializes the global logger. Safe to call once at process start;
/// panics (via `env_logger`) if a logger is already installed.
pub fn init(config: &Config) {
    let level = parse_level(&config.log_level);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if let Some(path) = &config.log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                // This env_logger version has no `Target::Pipe`, so the
                // format callback becomes the tee point: write the
                // formatted record to stderr and the file ourselves
                // and leave `buf` untouched.
                let tee = Mutex::new(TeeWriter::new(file));
                builder.format(move |buf, record| {
                    let line = format!(
                        "[{} {} {}] {}\n",
                        buf.timestamp(),
                        record.level(),
                        record.target(),
                        record.args()
                    );
                    tee.lock().unwrap().write_all(line.as_bytes())
                });
            }
            Err(e) => {
                // Fall back to stderr; report the failure once the
                // fallback logger itself is live.
                builder.init();
                log::error!("failed to open log file {}: {}, logging to stderr", path, e);
                return;
            }
        }
    }
    builder.init();

    if config.pprof {
        log::warn!("config enables pprof, but this build does not start a profiling server");
    }
}

/// A writer that duplicates everything to both stderr and a file,
/// used when `logFile` is set but console output should be kept too.
/// Exposed for tests exercising the write-duplication behavior in
/// isolation from the global logger singleton.
pub struct TeeWriter<W> {
    file: W,
}

impl<W: Write> TeeWriter<W> {
    pub fn new(file: W) -> Self {
        TeeWriter { file }
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_recognizes_all_named_levels() {
        assert_eq!(parse_level("trace"), LevelFilter::Trace);
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("error"), LevelFilter::Error);
        assert_eq!(parse_level("off"), LevelFilter::Off);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn tee_writer_duplicates_into_the_file() {
        let mut buf = Vec::new();
        {
            let mut tee = TeeWriter::new(&mut buf);
            tee.write_all(b"hello\n").unwrap();
        }
        assert_eq!(buf, b"hello\n");
    }
}
