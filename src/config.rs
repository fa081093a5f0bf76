//! Configuration module for the muxline server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::chat::{PayloadCodec, PayloadFormat};
use crate::protocols::hash::HashAlgorithm;
use crate::runtime::{Framing, LengthHeader, ReactorSettings};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Protocol served on the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Login and file deletion commands
    Ftp,
    /// Mail submission with a DATA transfer phase
    Smtp,
    /// Answer every frame with itself
    Echo,
    /// Answer every frame with its characters reversed
    Reverse,
    /// Answer every frame with its hex digest (MD5 by default)
    Hash,
    /// JSON or XML chat messages, length-prefixed
    Chat,
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "muxline")]
#[command(version)]
#[command(about = "A multiplexed line and message protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP address to bind to (e.g., 127.0.0.1:2000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// UDP address for datagram requests
    #[arg(short = 'u', long)]
    pub udp_listen: Option<String>,

    /// Protocol to serve
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<Protocol>,

    /// Maximum concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Frame delimiter for line protocols; accepts \r \n \t \\ escapes
    #[arg(short = 'd', long)]
    pub delimiter: Option<String>,

    /// Length header for message framing
    #[arg(long, value_enum)]
    pub length_header: Option<LengthHeader>,

    /// Idle timeout in seconds (0 = never)
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Digest returned by the hash protocol
    #[arg(long, value_enum)]
    pub hash_algorithm: Option<HashAlgorithm>,

    /// Chat payload format
    #[arg(long, value_enum)]
    pub chat_format: Option<PayloadFormat>,

    /// zlib-compress chat payloads
    #[arg(long)]
    pub deflate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub ftp: FtpConfig,
    #[serde(default)]
    pub hash: HashConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub udp_listen: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            udp_listen: None,
            protocol: default_protocol(),
            max_connections: default_max_connections(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    /// Delimiter, escapes already decoded by the TOML parser
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Switches echo, reverse and hash to length-prefixed frames;
    /// chat always uses one (decimal when unset)
    pub length_header: Option<LengthHeader>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    #[serde(default = "default_reads_per_event")]
    pub reads_per_event: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            length_header: None,
            max_frame_size: default_max_frame_size(),
            read_size: default_read_size(),
            reads_per_event: default_reads_per_event(),
        }
    }
}

/// Timeout configuration
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    /// Seconds without a complete frame before eviction (0 = never)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// FTP configuration
#[derive(Debug, Deserialize)]
pub struct FtpConfig {
    /// Directory `DELE` operates in
    #[serde(default = "default_ftp_root")]
    pub root: PathBuf,
    /// Accepted credentials; empty accepts any password
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            root: default_ftp_root(),
            users: HashMap::new(),
        }
    }
}

/// Hash protocol configuration
#[derive(Debug, Default, Deserialize)]
pub struct HashConfig {
    #[serde(default)]
    pub algorithm: HashAlgorithm,
}

/// Chat protocol configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub format: PayloadFormat,
    /// zlib-compress every payload in both directions
    #[serde(default)]
    pub deflate: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:2000".to_string()
}

fn default_protocol() -> Protocol {
    Protocol::Ftp
}

fn default_max_connections() -> usize {
    1024
}

fn default_delimiter() -> String {
    "\r\n".to_string()
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_read_size() -> usize {
    4096
}

fn default_reads_per_event() -> usize {
    16
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_ftp_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub udp_listen: Option<SocketAddr>,
    pub protocol: Protocol,
    pub max_connections: usize,
    pub delimiter: Vec<u8>,
    pub length_header: Option<LengthHeader>,
    pub max_frame_size: usize,
    pub read_size: usize,
    pub reads_per_event: usize,
    pub idle_timeout: Option<Duration>,
    pub tick_interval: Duration,
    pub ftp_root: PathBuf,
    pub ftp_users: HashMap<String, String>,
    pub hash_algorithm: HashAlgorithm,
    pub chat_format: PayloadFormat,
    pub chat_deflate: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name (if any).
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
            }
            None => TomlConfig::default(),
        };
        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen = parse_addr(&cli.listen.unwrap_or(file.server.listen))?;
        let udp_listen = cli
            .udp_listen
            .or(file.server.udp_listen)
            .map(|addr| parse_addr(&addr))
            .transpose()?;

        let delimiter = match cli.delimiter {
            Some(text) => unescape(&text),
            None => file.framing.delimiter.into_bytes(),
        };

        let idle_secs = cli.idle_timeout.unwrap_or(file.timeouts.idle_timeout);

        let config = Config {
            listen,
            udp_listen,
            protocol: cli.protocol.unwrap_or(file.server.protocol),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            delimiter,
            length_header: cli.length_header.or(file.framing.length_header),
            max_frame_size: file.framing.max_frame_size,
            read_size: file.framing.read_size,
            reads_per_event: file.framing.reads_per_event,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            tick_interval: Duration::from_millis(file.timeouts.tick_interval_ms),
            ftp_root: file.ftp.root,
            ftp_users: file.ftp.users,
            hash_algorithm: cli.hash_algorithm.unwrap_or(file.hash.algorithm),
            chat_format: cli.chat_format.unwrap_or(file.chat.format),
            chat_deflate: cli.deflate || file.chat.deflate,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delimiter.is_empty() {
            return Err(ConfigError::Invalid("delimiter must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be non-zero"));
        }
        if self.read_size == 0 || self.reads_per_event == 0 {
            return Err(ConfigError::Invalid(
                "read_size and reads_per_event must be non-zero",
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn reactor_settings(&self) -> ReactorSettings {
        ReactorSettings {
            max_connections: self.max_connections,
            max_frame_size: self.max_frame_size,
            read_size: self.read_size,
            reads_per_event: self.reads_per_event,
            idle_timeout: self.idle_timeout,
            tick_interval: self.tick_interval,
            ..ReactorSettings::default()
        }
    }

    pub fn chat_codec(&self) -> PayloadCodec {
        PayloadCodec::new(self.chat_format, self.chat_deflate)
    }

    /// Framing for the configured protocol.
    pub fn framing(&self) -> Framing {
        let delimited = Framing::Delimiter(Bytes::copy_from_slice(&self.delimiter));
        match self.protocol {
            Protocol::Ftp | Protocol::Smtp => delimited,
            Protocol::Echo | Protocol::Reverse | Protocol::Hash => match self.length_header {
                Some(header) => Framing::LengthPrefixed(header),
                None => delimited,
            },
            Protocol::Chat => {
                Framing::LengthPrefixed(self.length_header.unwrap_or(LengthHeader::Decimal))
            }
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))
}

/// Decode `\r`, `\n`, `\t`, `\0` and `\\` escapes typed on a command line.
/// Unknown escapes are kept verbatim.
pub fn unescape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => out.extend_from_slice(&[b'\\', other]),
            None => out.push(b'\\'),
        }
    }
    out
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::from_args(CliArgs::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:2000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.protocol, Protocol::Ftp);
        assert_eq!(config.delimiter, b"\r\n");
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.udp_listen, None);
        assert_eq!(config.framing(), Framing::crlf());
        assert_eq!(config.hash_algorithm, HashAlgorithm::Md5);
        assert_eq!(config.chat_codec(), PayloadCodec::default());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:2100"
            udp_listen = "0.0.0.0:2101"
            protocol = "chat"
            max_connections = 8

            [framing]
            length_header = "u16"
            max_frame_size = 1024

            [timeouts]
            idle_timeout = 0

            [ftp]
            root = "/srv/ftp"
            users = { alice = "secret" }

            [hash]
            algorithm = "sha256"

            [chat]
            format = "xml"
            deflate = true

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert_eq!(config.listen.port(), 2100);
        assert_eq!(config.udp_listen.map(|a| a.port()), Some(2101));
        assert_eq!(config.protocol, Protocol::Chat);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.ftp_root, PathBuf::from("/srv/ftp"));
        assert_eq!(config.ftp_users.get("alice").map(String::as_str), Some("secret"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.framing(), Framing::LengthPrefixed(LengthHeader::U16));
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.chat_codec(), PayloadCodec::new(PayloadFormat::Xml, true));

        let settings = config.reactor_settings();
        assert_eq!(settings.max_connections, 8);
        assert_eq!(settings.max_frame_size, 1024);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nprotocol = \"smtp\"\n[logging]\nlevel = \"warn\"").unwrap();

        let cli = CliArgs {
            config: Some(file.path().to_path_buf()),
            protocol: Some(Protocol::Echo),
            delimiter: Some("\\n".to_string()),
            length_header: Some(LengthHeader::U32),
            chat_format: Some(PayloadFormat::Xml),
            deflate: true,
            ..CliArgs::default()
        };
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.protocol, Protocol::Echo);
        assert_eq!(config.chat_codec(), PayloadCodec::new(PayloadFormat::Xml, true));
        assert_eq!(config.delimiter, b"\n");
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.framing(), Framing::LengthPrefixed(LengthHeader::U32));
    }

    #[test]
    fn test_invalid_values() {
        let cli = CliArgs {
            listen: Some("not an address".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidAddress(_))
        ));

        let cli = CliArgs {
            delimiter: Some(String::new()),
            ..CliArgs::default()
        };
        assert!(matches!(Config::from_args(cli), Err(ConfigError::Invalid(_))));

        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/muxline.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(Config::from_args(cli), Err(ConfigError::FileRead(..))));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("\\r\\n"), b"\r\n");
        assert_eq!(unescape("||"), b"||");
        assert_eq!(unescape("a\\\\b\\q"), b"a\\b\\q");
        assert_eq!(unescape("\\"), b"\\");
    }
}
