//! Process-wide leveled logger for the node.
//!
//! Records go to stderr as text or JSON lines, and optionally into a bounded in-memory
//! ring that tests and the status reporter can inspect.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    /// Unrecoverable failure of a long-running component.
    Critical = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRIT",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let level = match raw.trim().to_ascii_lowercase().as_str() {
            "crit" | "critical" => Self::Critical,
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        };
        Some(level)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Critical,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

/// A record kept by the in-memory capture ring.
#[derive(Clone, Debug)]
pub struct Captured {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

struct Settings {
    level: AtomicU8,
    json: AtomicBool,
    timestamps: AtomicBool,
    stderr: AtomicBool,
}

static SETTINGS: Settings = Settings {
    level: AtomicU8::new(Level::Info as u8),
    json: AtomicBool::new(false),
    timestamps: AtomicBool::new(true),
    stderr: AtomicBool::new(true),
};

struct Capture {
    enabled: AtomicBool,
    capacity: AtomicUsize,
    ring: OnceLock<Mutex<VecDeque<Captured>>>,
}

static CAPTURE: Capture = Capture {
    enabled: AtomicBool::new(false),
    capacity: AtomicUsize::new(0),
    ring: OnceLock::new(),
};

pub fn init(config: LogConfig) {
    SETTINGS.level.store(config.level as u8, Ordering::Relaxed);
    SETTINGS
        .json
        .store(matches!(config.format, Format::Json), Ordering::Relaxed);
    SETTINGS
        .timestamps
        .store(config.timestamps, Ordering::Relaxed);
}

pub fn current_level() -> Level {
    Level::from_u8(SETTINGS.level.load(Ordering::Relaxed))
}

pub fn set_stderr_enabled(enabled: bool) {
    SETTINGS.stderr.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        CAPTURE.enabled.store(false, Ordering::Relaxed);
        return;
    }
    CAPTURE.capacity.store(capacity, Ordering::Relaxed);
    CAPTURE
        .ring
        .get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(1024))));
    CAPTURE.enabled.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    CAPTURE.enabled.store(false, Ordering::Relaxed);
}

pub fn clear_captured() {
    if let Some(Ok(mut ring)) = CAPTURE.ring.get().map(Mutex::lock) {
        ring.clear();
    }
}

/// Returns up to `limit` of the most recent captured records, oldest first.
pub fn captured(limit: usize) -> Vec<Captured> {
    let Some(Ok(ring)) = CAPTURE.ring.get().map(Mutex::lock) else {
        return Vec::new();
    };
    let skip = ring.len().saturating_sub(limit);
    ring.iter().skip(skip).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= SETTINGS.level.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms = u64::try_from(now.as_millis()).unwrap_or(u64::MAX);
    let capture = CAPTURE.enabled.load(Ordering::Relaxed);
    let json = SETTINGS.json.load(Ordering::Relaxed);
    let rendered = (json || capture).then(|| args.to_string());

    if SETTINGS.stderr.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        if json {
            let record = json!({
                "ts_ms": ts_ms,
                "level": level.as_str(),
                "target": target,
                "file": file,
                "line": line,
                "msg": rendered.as_deref().unwrap_or_default(),
            });
            let _ = writeln!(out, "{record}");
        } else {
            if SETTINGS.timestamps.load(Ordering::Relaxed) {
                let _ = write!(out, "{} ", Rfc3339(now));
            }
            let _ = writeln!(out, "{:<5} {target}: {args}", level.as_str());
        }
    }

    if capture {
        push_captured(Captured {
            ts_ms,
            level,
            target,
            msg: rendered.unwrap_or_default(),
        });
    }
}

fn push_captured(record: Captured) {
    let capacity = CAPTURE.capacity.load(Ordering::Relaxed);
    let Some(Ok(mut ring)) = CAPTURE.ring.get().map(Mutex::lock) else {
        return;
    };
    ring.push_back(record);
    while ring.len() > capacity {
        ring.pop_front();
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_critical {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Critical, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// UTC wall clock rendered as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
struct Rfc3339(Duration);

impl fmt::Display for Rfc3339 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        let (year, month, day) = date_from_unix_days((secs / 86_400) as i64);
        let rem = secs % 86_400;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            rem / 3600,
            (rem / 60) % 60,
            rem % 60,
            self.0.subsec_millis()
        )
    }
}

// Proleptic Gregorian conversion over 400-year eras.
fn date_from_unix_days(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = (if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    }) as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
