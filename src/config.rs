use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Bind address used when a SOCKS5 endpoint leaves `Address` empty
pub const DEFAULT_SOCKS_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BUFFER_SIZE: usize = 4_096;
pub const MIN_BUFFER_SIZE: usize = 256;
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "SOCKS5 proxy over HTTP CONNECT tunnels",
    long_about = "soh runs one SOCKS5 listener per configured proxy pair and satisfies every \
CONNECT request by opening an HTTP CONNECT tunnel through that pair's upstream HTTP proxy.\n\n\
All listeners, credentials and upstreams are read from a JSON config file."
)]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(short = 'c', long = "config", default_value = "config.json", value_name = "PATH")]
    pub config: PathBuf,
}

/// Errors raised while loading the config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fail to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("fail to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration:{}", render_violations(.0))]
    Invalid(Vec<Violation>),
}

fn render_violations(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("\n  - {}", v)).collect()
}

/// A single problem found by [`RawConfig::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("no log directory specified (Log.Dir)")]
    MissingLogDir,

    #[error("unknown log level {0:?} (Log.Level)")]
    UnknownLogLevel(String),

    #[error("{name} must be at least {} bytes, got {size}", MIN_BUFFER_SIZE)]
    BufferTooSmall { name: &'static str, size: usize },

    #[error("Settings.DialTimeout must be greater than zero")]
    ZeroDialTimeout,

    #[error("no proxy defined (Proxies is empty)")]
    NoProxies,

    #[error("Proxies[{pair}].{side}.Port {port} is out of range (1-65534)")]
    InvalidPort {
        pair: usize,
        side: &'static str,
        port: i64,
    },

    #[error("Proxies[{pair}].HTTP.Address must not be empty")]
    EmptyHttpAddress { pair: usize },

    #[error("Proxies[{second}] duplicates socks address {addr} of Proxies[{first}]")]
    DuplicateSocks {
        addr: String,
        first: usize,
        second: usize,
    },
}

/// Config file as written on disk, before defaults and validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawConfig {
    pub log: RawLog,
    pub settings: RawSettings,
    pub proxies: Vec<RawProxyPair>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawLog {
    pub dir: String,
    pub level: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawSettings {
    pub read_buffer_size: Option<usize>,
    pub write_buffer_size: Option<usize>,
    /// Seconds
    pub dial_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawProxyPair {
    pub socks: RawEndpoint,
    #[serde(rename = "HTTP")]
    pub http: RawEndpoint,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawEndpoint {
    pub address: String,
    pub port: i64,
    pub user: String,
    pub pass: String,
}

/// A SOCKS5 listen endpoint or an HTTP upstream endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// `address:port`, with IPv6 literals bracketed
    pub fn host_port(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// One SOCKS5 listener and the upstream HTTP proxy it tunnels through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPair {
    pub socks: ProxyEndpoint,
    pub http: ProxyEndpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: LevelFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub dial_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
        }
    }
}

/// Validated configuration; every listener can be started from it
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub log: LogSettings,
    pub settings: Settings,
    pub proxies: Vec<ProxyPair>,
}

impl Config {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw = RawConfig::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        raw.validate().map_err(ConfigError::Invalid)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn valid_port(port: i64) -> Option<u16> {
    if port > 0 && port < 0xffff {
        u16::try_from(port).ok()
    } else {
        None
    }
}

impl RawConfig {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Apply defaults and check every invariant, collecting all violations
    /// rather than stopping at the first one.
    pub fn validate(self) -> Result<Config, Vec<Violation>> {
        let mut violations = Vec::new();

        if self.log.dir.is_empty() {
            violations.push(Violation::MissingLogDir);
        }
        let level = if self.log.level.is_empty() {
            LevelFilter::INFO
        } else {
            LevelFilter::from_str(&self.log.level).unwrap_or_else(|_| {
                violations.push(Violation::UnknownLogLevel(self.log.level.clone()));
                LevelFilter::INFO
            })
        };

        let read_buffer_size = self.settings.read_buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let write_buffer_size = self.settings.write_buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        for (name, size) in [
            ("Settings.ReadBufferSize", read_buffer_size),
            ("Settings.WriteBufferSize", write_buffer_size),
        ] {
            if size < MIN_BUFFER_SIZE {
                violations.push(Violation::BufferTooSmall { name, size });
            }
        }
        let dial_timeout = self.settings.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT_SECS);
        if dial_timeout == 0 {
            violations.push(Violation::ZeroDialTimeout);
        }

        if self.proxies.is_empty() {
            violations.push(Violation::NoProxies);
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut proxies = Vec::with_capacity(self.proxies.len());
        for (index, pair) in self.proxies.iter().enumerate() {
            let socks_port = valid_port(pair.socks.port);
            if socks_port.is_none() {
                violations.push(Violation::InvalidPort {
                    pair: index,
                    side: "Socks",
                    port: pair.socks.port,
                });
            }
            let http_port = valid_port(pair.http.port);
            if http_port.is_none() {
                violations.push(Violation::InvalidPort {
                    pair: index,
                    side: "HTTP",
                    port: pair.http.port,
                });
            }
            if pair.http.address.is_empty() {
                violations.push(Violation::EmptyHttpAddress { pair: index });
            }

            let (Some(socks_port), Some(http_port)) = (socks_port, http_port) else {
                continue;
            };
            let socks = ProxyEndpoint {
                address: non_empty(&pair.socks.address)
                    .unwrap_or_else(|| DEFAULT_SOCKS_ADDRESS.to_string()),
                port: socks_port,
                username: non_empty(&pair.socks.user),
                password: non_empty(&pair.socks.pass),
            };
            let http = ProxyEndpoint {
                address: pair.http.address.clone(),
                port: http_port,
                username: non_empty(&pair.http.user),
                password: non_empty(&pair.http.pass),
            };

            let key = socks.host_port();
            if let Some(&first) = seen.get(&key) {
                violations.push(Violation::DuplicateSocks {
                    addr: key,
                    first,
                    second: index,
                });
                continue;
            }
            seen.insert(key, index);
            proxies.push(ProxyPair { socks, http });
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        Ok(Config {
            log: LogSettings {
                dir: PathBuf::from(self.log.dir),
                level,
            },
            settings: Settings {
                read_buffer_size,
                write_buffer_size,
                dial_timeout: Duration::from_secs(dial_timeout),
            },
            proxies,
        })
    }
}
