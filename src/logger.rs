//! Logging setup.
//!
//! Built on `tracing`. Output goes to stdout, to a file, or to syslog, at a
//! configured [`LogLevel`]; `RUST_LOG` overrides the level when set.
//!
//! | `logfile` | Destination |
//! |-----------|-------------|
//! | `None` | stdout, with ANSI colors |
//! | `":syslog:"` | `/dev/log` or `/var/run/syslog`, prefixed `entry-guards:` |
//! | a path | that file, appended through a non-blocking writer |
//!
//! Notice has no tracing counterpart and is logged at info.
//!
//! ```rust,no_run
//! use entry_guards_rs::{logger, LogLevel};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "entry-guards-rs started");
//! ```

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();
static FILE_WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// `tracing` filter directive for a level.
pub fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, and
/// [`Error::Config`] if no syslog socket exists or a global subscriber is
/// already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => init_syslog(env_filter)?,
        Some(path) => init_file_logger(Path::new(path), env_filter)?,
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = ["/dev/log", "/var/run/syslog"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| Error::Config("no syslog socket found".to_string()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter::connect(syslog_path))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))
}

/// Sends each formatted line as one datagram. Drops output if the socket
/// cannot be reached.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = UnixDatagram::unbound().and_then(|sock| {
            sock.connect(path)?;
            Ok(sock)
        });
        Self { socket: socket.ok() }
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(socket) = &self.socket {
            let msg = format!("entry-guards: {}", String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("invalid log file: {}", path.display())))?;

    // Surface permission problems here rather than on the writer thread.
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
    let _ = FILE_WRITER_GUARD.set(guard);
    Ok(())
}

/// Logs `message` at `level`.
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info | LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// [`plog`] with `format!` arguments.
///
/// ```rust
/// use entry_guards_rs::{plog_fmt, LogLevel};
///
/// plog_fmt!(LogLevel::Notice, "{} primary guards", 3);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(LogLevel::Debug), "debug");
        assert_eq!(filter_directive(LogLevel::Notice), "info");
        assert_eq!(filter_directive(LogLevel::Error), "error");
    }

    #[test]
    fn test_syslog_writer_without_socket_discards() {
        let mut w = SyslogWriter { socket: None };
        assert_eq!(w.write(b"hello").unwrap(), 5);
        w.flush().unwrap();
    }

    #[test]
    fn test_plog_without_subscriber() {
        plog(LogLevel::Notice, "no subscriber installed");
        plog_fmt!(LogLevel::Warn, "value {}", 1);
    }
}
