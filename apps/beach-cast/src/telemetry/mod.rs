use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub const PERF_ENV: &str = "BEACH_CAST_PERF";

/// Samples per label between two `beach_cast::perf` log lines.
const REPORT_EVERY: u64 = 256;

fn flag_set(var: &str) -> bool {
    std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
}

static PERF_ON: Lazy<bool> = Lazy::new(|| flag_set(PERF_ENV));

static COUNTERS: Lazy<Mutex<HashMap<&'static str, Counter>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct Counter {
    samples: u64,
    busy: Duration,
    peak: Duration,
    bytes: u64,
}

impl Counter {
    fn add(&mut self, elapsed: Option<Duration>, bytes: u64) -> bool {
        self.samples += 1;
        self.bytes += bytes;
        if let Some(elapsed) = elapsed {
            self.busy += elapsed;
            self.peak = self.peak.max(elapsed);
        }
        self.samples % REPORT_EVERY == 0
    }

    fn mean(&self) -> Duration {
        match u32::try_from(self.samples) {
            Ok(n) if n > 0 => self.busy / n,
            _ => Duration::ZERO,
        }
    }
}

fn sample(label: &'static str, elapsed: Option<Duration>, bytes: u64) {
    let mut counters = COUNTERS.lock();
    let counter = counters.entry(label).or_default();
    if counter.add(elapsed, bytes) {
        tracing::info!(
            target: "beach_cast::perf",
            label,
            samples = counter.samples,
            mean_us = counter.mean().as_micros() as u64,
            peak_us = counter.peak.as_micros() as u64,
            bytes = counter.bytes,
        );
    }
}

/// Adds `bytes` to the counter for `label` when perf counters are on.
pub fn record_bytes(label: &'static str, bytes: usize) {
    if *PERF_ON {
        sample(label, None, bytes as u64);
    }
}

/// Times a scope into the counter for `label`; `None` unless `BEACH_CAST_PERF` is set.
pub struct PerfGuard {
    label: &'static str,
    start: Instant,
}

impl PerfGuard {
    pub fn new(label: &'static str) -> Option<Self> {
        PERF_ON.then(|| Self {
            label,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        sample(self.label, Some(self.start.elapsed()), 0);
    }
}

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "BEACH_CAST_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "BEACH_CAST_TRACE_DEPS";

    /// Chatty dependencies held at `info` when our own code traces.
    const NOISY_DEPS: &str = "tokio_tungstenite=info,tungstenite=info,mio=info,yrs=info";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        /// `EnvFilter` directives for this level.
        fn directives(self, quiet_deps: bool) -> String {
            match self {
                LogLevel::Error => "error".into(),
                LogLevel::Warn => "warn".into(),
                LogLevel::Info => "info".into(),
                LogLevel::Debug => "info,beach_cast=debug".into(),
                LogLevel::Trace if quiet_deps => format!("info,beach_cast=trace,{NOISY_DEPS}"),
                LogLevel::Trace => "trace".into(),
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("logger already claimed: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Repeated calls after a success do nothing.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let quiet_deps = config.level == LogLevel::Trace && !super::flag_set(TRACE_DEPS_ENV);
        let filter = match std::env::var(FILTER_ENV) {
            Ok(custom) => EnvFilter::new(custom),
            Err(_) => EnvFilter::new(config.level.directives(quiet_deps)),
        };

        // stdout is reserved for the sidecar protocol.
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    /// Frame bytes as `offset: hex | ascii` rows for trace logs.
    pub fn hexdump(bytes: &[u8]) -> String {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(bytes.len() * 4);
        for (row, chunk) in bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:06x}:", row * 16);
            for byte in chunk {
                let _ = write!(out, " {byte:02x}");
            }
            out.push_str(&"   ".repeat(16 - chunk.len()));
            out.push_str(" | ");
            for &byte in chunk {
                out.push(if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                });
            }
            out.push('\n');
        }
        out
    }

}
