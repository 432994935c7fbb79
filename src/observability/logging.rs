//! Structured logging system using tracing crate
//!
//! Output format is chosen once at startup; verbosity follows the device
//! debug level and can be changed at runtime through `LogLevelHandle`
//! (shell `debug <n>` command or the `debugLevel` twin property).
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: debug level 0-5 or a level name (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span events (true/false) - defaults to false
//! - `RUST_LOG`: Override per-target filtering (follows env_logger format)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=4 ./cloudsync run
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt as stdfmt;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Device debug level as exposed on the shell and in the twin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DebugLevel {
    None = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl DebugLevel {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(DebugLevel::None),
            1 => Some(DebugLevel::Error),
            2 => Some(DebugLevel::Warn),
            3 => Some(DebugLevel::Info),
            4 => Some(DebugLevel::Debug),
            5 => Some(DebugLevel::Trace),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Accepts a number or a level name
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(n) = s.trim().parse::<u8>() {
            return Self::from_u8(n);
        }
        match s.trim().to_uppercase().as_str() {
            "OFF" | "NONE" => Some(DebugLevel::None),
            "ERROR" => Some(DebugLevel::Error),
            "WARN" => Some(DebugLevel::Warn),
            "INFO" => Some(DebugLevel::Info),
            "DEBUG" => Some(DebugLevel::Debug),
            "TRACE" => Some(DebugLevel::Trace),
            _ => None,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            DebugLevel::None => LevelFilter::OFF,
            DebugLevel::Error => LevelFilter::ERROR,
            DebugLevel::Warn => LevelFilter::WARN,
            DebugLevel::Info => LevelFilter::INFO,
            DebugLevel::Debug => LevelFilter::DEBUG,
            DebugLevel::Trace => LevelFilter::TRACE,
        }
    }

    fn from_filter(filter: LevelFilter) -> Self {
        match filter.into_level() {
            None => DebugLevel::None,
            Some(tracing::Level::ERROR) => DebugLevel::Error,
            Some(tracing::Level::WARN) => DebugLevel::Warn,
            Some(tracing::Level::INFO) => DebugLevel::Info,
            Some(tracing::Level::DEBUG) => DebugLevel::Debug,
            Some(_) => DebugLevel::Trace,
        }
    }

    /// One step more verbose, saturating at trace
    pub fn raised(self, steps: u8) -> Self {
        Self::from_u8(self.as_u8().saturating_add(steps).min(5)).unwrap_or(DebugLevel::Trace)
    }
}

/// Runtime control over the active verbosity
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<LevelFilter, Registry>,
}

impl LogLevelHandle {
    pub fn set(&self, level: DebugLevel) -> Result<(), reload::Error> {
        self.inner.modify(|filter| *filter = level.level_filter())
    }

    pub fn current(&self) -> Option<DebugLevel> {
        self.inner.clone_current().map(DebugLevel::from_filter)
    }
}

impl stdfmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("current", &self.current())
            .finish()
    }
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Install the global subscriber and return its level handle
pub fn init_logging(
    level: DebugLevel,
    format: LogFormat,
    include_spans: bool,
) -> Result<LogLevelHandle, TryInitError> {
    let (level_layer, handle) = reload::Layer::new(level.level_filter());

    // Dependencies stay at warn; this crate is bounded by the reloadable level
    let mut filter = EnvFilter::new("warn");
    if let Ok(directive) = format!("{}=trace", env!("CARGO_CRATE_NAME")).parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        filter = EnvFilter::new(rust_log);
    }

    let subscriber = tracing_subscriber::registry().with(level_layer).with(filter);

    match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init()?,
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init()?,
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init()?,
    }

    Ok(LogLevelHandle { inner: handle })
}

/// Initialize logging from environment variables
pub fn init_default_logging() -> Result<LogLevelHandle, TryInitError> {
    let level = env::var("LOG_LEVEL")
        .ok()
        .and_then(|value| DebugLevel::parse(&value))
        .unwrap_or(DebugLevel::Info);

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, LogFormat::parse(&format), include_spans)
}

/// Span covering one engine tick
#[macro_export]
macro_rules! engine_span {
    ($($field:tt)*) => {
        tracing::debug_span!("engine_tick", $($field)*)
    };
}

/// Span covering one twin reconciliation pass
#[macro_export]
macro_rules! twin_span {
    ($($field:tt)*) => {
        tracing::info_span!("twin_reconcile", $($field)*)
    };
}

pub use {engine_span, twin_span};
