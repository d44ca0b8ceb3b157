use crate::error::ConfigError;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Global server configuration.
///
/// Deserialized from a JSON file whose keys are PascalCase, matching the
/// deployed config files. `records` and `blocks` are seeded inline and
/// extended from `records_file` / `block_file` during [`Config::load`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Port the DNS service binds to (UDP and TCP)
    pub port: u16,

    /// Host the DNS service binds to; also named in the synthesized NS record
    pub listen_host: String,

    /// Zone this instance is authoritative for
    pub name: String,

    /// Shared secret for the management API
    pub secret: String,

    /// Port the management API binds to
    pub http_port: u16,

    /// Upstream resolvers, in fallback priority order
    pub nameservers: Vec<Nameserver>,

    /// Blocklist files ingested at load time
    pub block_file: Vec<String>,

    /// Hosts files ingested at load time
    pub records_file: Vec<String>,

    /// Owned records, hostname to IPv4 address
    pub records: HashMap<String, String>,

    /// Blocklist fragments
    pub blocks: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1053,
            listen_host: "127.0.0.1".to_string(),
            name: String::new(),
            secret: String::new(),
            http_port: 8081,
            nameservers: vec![],
            block_file: vec![],
            records_file: vec![],
            records: HashMap::new(),
            blocks: vec![],
        }
    }
}

/// An upstream resolver that answers for names we do not own.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Nameserver {
    /// host:port of the upstream resolver
    pub address: SocketAddr,

    /// Per-exchange timeout; zero means the library default, never infinite
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub transport: Transport,
}

/// Transport used for one upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    /// Parse a transport string; an empty value defaults to tcp.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "" | "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Transport {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Transport::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load configuration from a JSON file and ingest the referenced
    /// hosts and blocklist files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = serde_json::from_str(&raw)?;

        for hosts_file in config.records_file.clone() {
            for (hostname, address) in parse_hosts_file(&hosts_file)? {
                debug!("+ {} => {}", hostname, address);
                config.records.insert(hostname, address);
            }
        }

        for block_file in config.block_file.clone() {
            let fragments = parse_blocklist_file(&block_file)?;
            debug!(
                "loaded {} blocklist fragment(s) from {}",
                fragments.len(),
                block_file
            );
            config.blocks.extend(fragments);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingZone);
        }
        if self.listen_host.is_empty() {
            return Err(ConfigError::MissingListenHost);
        }
        if self.nameservers.is_empty() {
            return Err(ConfigError::NoNameservers);
        }
        Ok(())
    }

    /// DNS bind address as a host:port string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }

    /// Management API bind address as a host:port string.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.http_port)
    }
}

/// Parse a hosts file into (hostname, address) pairs.
///
/// Lines are `<ipv4> <hostname>`; `#` starts a comment. Malformed lines are
/// skipped rather than fatal so a half-edited hosts file cannot take the
/// server down. Ingested hostnames are stored fully qualified.
pub fn parse_hosts_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut records = Vec::new();
    for line in raw.lines() {
        let line = strip_comment(line);
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(address), Some(hostname)) = (fields.next(), fields.next()) else {
            warn!("skipping malformed hosts line {:?}", line);
            continue;
        };

        if address.parse::<Ipv4Addr>().is_err() {
            warn!("skipping hosts line with bad address {:?}", address);
            continue;
        }
        if !is_valid_hostname(hostname) {
            warn!("skipping hosts line with bad hostname {:?}", hostname);
            continue;
        }

        let hostname = if hostname.ends_with('.') {
            hostname.to_string()
        } else {
            format!("{hostname}.")
        };
        records.push((hostname, address.to_string()));
    }

    Ok(records)
}

/// Parse a blocklist file into substring fragments, one per line.
pub fn parse_blocklist_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    Ok(raw
        .lines()
        .map(strip_comment)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect())
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

fn is_valid_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// Parse a Go-style duration string such as "2s", "500ms" or "1m".
fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    const UNITS: &[(&str, u64)] = &[("ms", 1), ("s", 1000), ("m", 60_000), ("h", 3_600_000)];

    let input = input.trim();
    if input.is_empty() || input == "0" {
        return Ok(Duration::ZERO);
    }

    for (unit, millis_per_unit) in UNITS {
        if let Some(value) = input.strip_suffix(unit) {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let value: u64 = value
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(input.to_string()))?;
            return Ok(Duration::from_millis(value * millis_per_unit));
        }
    }

    Err(ConfigError::InvalidTimeout(input.to_string()))
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    parse_duration(&s).map_err(serde::de::Error::custom)
}
