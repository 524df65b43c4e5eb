//! Command line and `stakd.conf` handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stakd_consensus::Network;
use stakd_log as logging;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "stakd.conf";
pub const DEFAULT_COIN_CACHE_ITEMS: usize = 200_000;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;

const SUPPORTED_CONF_KEYS: [&str; 13] = [
    "backend",
    "coincache",
    "dbcache",
    "flushinterval",
    "import",
    "logformat",
    "loglevel",
    "logtimestamps",
    "network",
    "regtest",
    "stakecache",
    "statusinterval",
    "testnet",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub import: Option<PathBuf>,
    pub coin_cache_items: usize,
    pub flush_interval: Duration,
    pub stake_cache_items: usize,
    pub status_interval_secs: u64,
    pub db_cache_bytes: Option<u64>,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    /// Keys found in the conf file that this build does not understand.
    pub unsupported_conf_keys: Vec<String>,
}

impl Config {
    pub fn log_config(&self) -> logging::LogConfig {
        logging::LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: self.log_timestamps,
        }
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Values given on the command line. Anything left unset falls back to the conf file,
/// then to the built-in default.
#[derive(Debug, Default)]
struct CliOptions {
    backend: Option<Backend>,
    data_dir: Option<PathBuf>,
    conf_path: Option<PathBuf>,
    network: Option<Network>,
    import: Option<PathBuf>,
    coin_cache_items: Option<usize>,
    flush_interval_secs: Option<u64>,
    stake_cache_items: Option<usize>,
    status_interval_secs: Option<u64>,
    db_cache_mb: Option<u64>,
    log_level: Option<logging::Level>,
    log_format: Option<logging::Format>,
    log_timestamps: Option<bool>,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CliOptions::default();
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {name}\n{}", usage()))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let raw = value("--backend")?;
                cli.backend = Some(
                    Backend::parse(&raw)
                        .ok_or_else(|| format!("invalid backend '{raw}'\n{}", usage()))?,
                );
            }
            "--data-dir" => cli.data_dir = Some(PathBuf::from(value("--data-dir")?)),
            "--conf" => cli.conf_path = Some(PathBuf::from(value("--conf")?)),
            "--network" => {
                let raw = value("--network")?;
                cli.network = Some(
                    Network::parse(&raw)
                        .ok_or_else(|| format!("invalid network '{raw}'\n{}", usage()))?,
                );
            }
            "--testnet" => cli.network = Some(Network::Testnet),
            "--regtest" => cli.network = Some(Network::Regtest),
            "--import" => cli.import = Some(PathBuf::from(value("--import")?)),
            "--coin-cache-items" => {
                cli.coin_cache_items = Some(parse_number(&value("--coin-cache-items")?, "--coin-cache-items")?);
            }
            "--flush-interval-secs" => {
                cli.flush_interval_secs =
                    Some(parse_number(&value("--flush-interval-secs")?, "--flush-interval-secs")?);
            }
            "--stake-cache-items" => {
                cli.stake_cache_items =
                    Some(parse_number(&value("--stake-cache-items")?, "--stake-cache-items")?);
            }
            "--status-interval-secs" => {
                cli.status_interval_secs =
                    Some(parse_number(&value("--status-interval-secs")?, "--status-interval-secs")?);
            }
            "--db-cache-mb" => {
                cli.db_cache_mb = Some(parse_number(&value("--db-cache-mb")?, "--db-cache-mb")?);
            }
            "--log-level" => {
                let raw = value("--log-level")?;
                cli.log_level = Some(
                    logging::Level::parse(&raw)
                        .ok_or_else(|| format!("invalid log level '{raw}'\n{}", usage()))?,
                );
            }
            "--log-format" => {
                let raw = value("--log-format")?;
                cli.log_format = Some(
                    logging::Format::parse(&raw)
                        .ok_or_else(|| format!("invalid log format '{raw}'\n{}", usage()))?,
                );
            }
            "--no-log-timestamps" => cli.log_timestamps = Some(false),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    resolve(cli).map(|config| CliAction::Run(Box::new(config)))
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, String> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value '{raw}' for {name}\n{}", usage()))
}

fn resolve(cli: CliOptions) -> Result<Config, String> {
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = cli
        .conf_path
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = load_conf(&conf_path)?.unwrap_or_default();
    let conf_file = conf_path.display().to_string();
    let last = |key: &str| conf.get(key).and_then(|values| values.last()).map(String::as_str);
    let conf_number = |key: &str| -> Result<Option<u64>, String> {
        last(key)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| format!("invalid {key} '{raw}' in {conf_file}"))
            })
            .transpose()
    };
    let conf_flag = |key: &str| -> Result<Option<bool>, String> {
        last(key)
            .map(|raw| {
                parse_conf_bool(raw).ok_or_else(|| format!("invalid {key} value '{raw}' in {conf_file}"))
            })
            .transpose()
    };

    let conf_network = match last("network") {
        Some(raw) => Some(
            Network::parse(raw).ok_or_else(|| format!("invalid network '{raw}' in {conf_file}"))?,
        ),
        None if conf_flag("regtest")? == Some(true) => Some(Network::Regtest),
        None if conf_flag("testnet")? == Some(true) => Some(Network::Testnet),
        None => None,
    };
    let conf_backend = last("backend")
        .map(|raw| Backend::parse(raw).ok_or_else(|| format!("invalid backend '{raw}' in {conf_file}")))
        .transpose()?;
    let conf_level = last("loglevel")
        .map(|raw| {
            logging::Level::parse(raw).ok_or_else(|| format!("invalid loglevel '{raw}' in {conf_file}"))
        })
        .transpose()?;
    let conf_format = last("logformat")
        .map(|raw| {
            logging::Format::parse(raw)
                .ok_or_else(|| format!("invalid logformat '{raw}' in {conf_file}"))
        })
        .transpose()?;

    let coin_cache_items = match cli.coin_cache_items {
        Some(items) => items,
        None => conf_number("coincache")?.map_or(DEFAULT_COIN_CACHE_ITEMS, |items| items as usize),
    };
    let stake_cache_items = match cli.stake_cache_items {
        Some(items) => items,
        None => conf_number("stakecache")?.map_or(
            stakd_chainstate::stake::DEFAULT_STAKE_CACHE_ITEMS,
            |items| items as usize,
        ),
    };
    let flush_interval_secs = match cli.flush_interval_secs {
        Some(secs) => secs,
        None => conf_number("flushinterval")?.unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
    };
    let status_interval_secs = match cli.status_interval_secs {
        Some(secs) => secs,
        None => conf_number("statusinterval")?.unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
    };
    let db_cache_mb = match cli.db_cache_mb {
        Some(mb) => Some(mb),
        None => conf_number("dbcache")?,
    };
    let log_timestamps = match cli.log_timestamps {
        Some(enabled) => enabled,
        None => conf_flag("logtimestamps")?.unwrap_or(true),
    };

    let mut unsupported_conf_keys: Vec<String> = conf
        .keys()
        .filter(|key| !SUPPORTED_CONF_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();
    unsupported_conf_keys.sort();

    Ok(Config {
        backend: cli.backend.or(conf_backend).unwrap_or(Backend::Fjall),
        network: cli.network.or(conf_network).unwrap_or(Network::Mainnet),
        import: cli.import.or_else(|| last("import").map(PathBuf::from)),
        coin_cache_items,
        flush_interval: Duration::from_secs(flush_interval_secs),
        stake_cache_items,
        status_interval_secs,
        db_cache_bytes: db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
        log_level: cli.log_level.or(conf_level).unwrap_or(logging::Level::Info),
        log_format: cli.log_format.or(conf_format).unwrap_or(logging::Format::Text),
        log_timestamps,
        unsupported_conf_keys,
        data_dir,
        conf_path,
    })
}

/// Reads a `key=value` conf file. A missing file is not an error.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(&['#', ';'][..]) {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  stakd [options]",
        "  stakd <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h                    Print this help and exit",
        "  --version, -V                 Print version and exit",
        "  --data-dir <path>             Data directory (default: data)",
        "  --conf <path>                 Config file (default: <data-dir>/stakd.conf)",
        "  --network <name>              mainnet|testnet|regtest (default: mainnet)",
        "  --testnet, --regtest          Shorthand for --network",
        "  --backend <memory|fjall>      Coin store backend (default: fjall)",
        "  --import <file>               Block file to connect; its first block is genesis",
        "  --coin-cache-items <n>        Coin cache soft bound (default: 200000)",
        "  --flush-interval-secs <n>     Minimum seconds between cache flushes (default: 60)",
        "  --stake-cache-items <n>       Stake metadata window (default: 5000)",
        "  --status-interval-secs <n>    Status line interval, 0 disables (default: 15)",
        "  --db-cache-mb <n>             Fjall block cache size",
        "  --log-level <level>           crit|error|warn|info|debug|trace (default: info)",
        "  --log-format <text|json>      Log line format (default: text)",
        "  --no-log-timestamps           Omit timestamps from log lines",
        "",
        "Config file keys:",
        "  backend, coincache, dbcache, flushinterval, import, logformat, loglevel,",
        "  logtimestamps, network, regtest, stakecache, statusinterval, testnet",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(raw: &[&str]) -> Config {
        match parse_args_from(args(raw)).expect("parse args") {
            CliAction::Run(config) => *config,
            other => panic!("expected run action, got {other:?}"),
        }
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["--data-dir", "x", "-V"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn defaults_without_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = run_config(&["--data-dir", dir.path().to_str().expect("utf8 path")]);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.coin_cache_items, DEFAULT_COIN_CACHE_ITEMS);
        assert_eq!(config.flush_interval, Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS));
        assert_eq!(config.conf_path, dir.path().join(CONF_FILE_NAME));
        assert!(config.import.is_none());
        assert!(config.log_timestamps);
    }

    #[test]
    fn conf_fills_gaps_and_cli_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\nregtest=1\nbackend=memory\ncoincache=10 ; small\nloglevel=debug\nrpcuser=ignored\n",
        )
        .expect("write conf");
        let config = run_config(&[
            "--data-dir",
            dir.path().to_str().expect("utf8 path"),
            "--coin-cache-items",
            "25",
            "--no-log-timestamps",
        ]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.coin_cache_items, 25);
        assert_eq!(config.log_level, logging::Level::Debug);
        assert!(!config.log_timestamps);
        assert_eq!(config.unsupported_conf_keys, vec!["rpcuser".to_string()]);
    }

    #[test]
    fn rejects_bad_values() {
        let err = parse_args_from(args(&["--backend", "rocks"])).expect_err("bad backend");
        assert!(err.starts_with("invalid backend 'rocks'"));
        let err = parse_args_from(args(&["--flush-interval-secs"])).expect_err("missing value");
        assert!(err.starts_with("missing value for --flush-interval-secs"));
        let err = parse_args_from(args(&["--bogus"])).expect_err("unknown flag");
        assert!(err.starts_with("unknown argument '--bogus'"));
    }

    #[test]
    fn conf_bool_values() {
        assert_eq!(parse_conf_bool(""), Some(true));
        assert_eq!(parse_conf_bool("No"), Some(false));
        assert_eq!(parse_conf_bool("maybe"), None);
    }
}
