//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::tokens::SECRET_LEN;
use crate::domain::allow_list::AllowList;
use crate::domain::credentials::BearerToken;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagport";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 5;
const DEFAULT_TOKEN_EXPIRATION_SECS: u64 = 60;
const DEFAULT_CACHE_PATH: &str = "/tmp";
const DEFAULT_CACHE_EXPIRATION_SECS: u64 = 10;
const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_GITHUB_TIMEOUT_SECS: u64 = 30;

/// Command-line arguments for the tagport binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagport",
    version,
    about = "Terraform module registry backed by GitHub tags"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGPORT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the registry HTTP service.
    Serve(Box<ServeArgs>),
    /// Seal or open download tokens with the configured secret.
    Token(TokenArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long download tokens stay valid.
    #[arg(long = "proxy-token-expiration-seconds", value_name = "SECONDS")]
    pub proxy_token_expiration_seconds: Option<u64>,

    /// Toggle the version and archive cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the archive cache directory.
    #[arg(long = "cache-path", value_name = "PATH")]
    pub cache_path: Option<PathBuf>,

    /// Override the version-list TTL; 0 keeps entries forever.
    #[arg(long = "cache-expiration-seconds", value_name = "SECONDS")]
    pub cache_expiration_seconds: Option<u64>,

    /// Override the interval between cache sweeps.
    #[arg(long = "cache-cleanup-interval-seconds", value_name = "SECONDS")]
    pub cache_cleanup_interval_seconds: Option<u64>,

    /// Override the GitHub API base URL.
    #[arg(long = "github-api-url", value_name = "URL")]
    pub github_api_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "github-timeout-seconds", value_name = "SECONDS")]
    pub github_timeout_seconds: Option<u64>,

    /// Override the repository allow-list (`owner:repo1,repo2;owner2:repo3`).
    #[arg(long = "github-repositories", value_name = "LIST")]
    pub github_repositories: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TokenCommand {
    /// Seal a bearer credential into a download token.
    Encode {
        #[arg(value_name = "CREDENTIAL")]
        credential: String,
    },
    /// Open a download token and print the credential it carries.
    Decode {
        #[arg(value_name = "TOKEN")]
        token: String,
    },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub github: GithubSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// AES-256 key material for download tokens.
#[derive(Clone)]
pub struct ProxySecret([u8; SECRET_LEN]);

impl ProxySecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ProxySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxySecret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub secret: ProxySecret,
    pub token_expiration: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub path: PathBuf,
    /// `None` keeps version lists until they are overwritten.
    pub expiration: Option<Duration>,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GithubSettings {
    pub api_url: Url,
    pub token: Option<BearerToken>,
    pub timeout: Duration,
    pub allow_list: AllowList,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TAGPORT").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Token(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    proxy: RawProxySettings,
    cache: RawCacheSettings,
    github: RawGithubSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.proxy_token_expiration_seconds {
            self.proxy.token_expiration_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(path) = overrides.cache_path.as_ref() {
            self.cache.path = Some(path.clone());
        }
        if let Some(seconds) = overrides.cache_expiration_seconds {
            self.cache.expiration_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_cleanup_interval_seconds {
            self.cache.cleanup_interval_seconds = Some(seconds);
        }
        if let Some(url) = overrides.github_api_url.as_ref() {
            self.github.api_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.github_timeout_seconds {
            self.github.timeout_seconds = Some(seconds);
        }
        if let Some(list) = overrides.github_repositories.as_ref() {
            self.github.repositories = Some(RawRepositories::Compact(list.clone()));
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            proxy,
            cache,
            github,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let proxy = build_proxy_settings(proxy)?;
        let cache = build_cache_settings(cache)?;
        let github = build_github_settings(github)?;

        Ok(Self {
            server,
            logging,
            proxy,
            cache,
            github,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_seconds(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_proxy_settings(proxy: RawProxySettings) -> Result<ProxySettings, LoadError> {
    let encoded = proxy
        .secret
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("proxy.secret", "must be set"))?;

    let decoded = BASE64
        .decode(encoded.as_bytes())
        .map_err(|err| LoadError::invalid("proxy.secret", format!("invalid base64: {err}")))?;
    let secret: [u8; SECRET_LEN] = decoded.try_into().map_err(|bytes: Vec<u8>| {
        LoadError::invalid(
            "proxy.secret",
            format!("must decode to {SECRET_LEN} bytes, got {}", bytes.len()),
        )
    })?;

    let expiration_secs = proxy
        .token_expiration_seconds
        .unwrap_or(DEFAULT_TOKEN_EXPIRATION_SECS);
    let token_expiration = positive_seconds(expiration_secs, "proxy.token_expiration_seconds")?;

    Ok(ProxySettings {
        secret: ProxySecret(secret),
        token_expiration,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let path = cache
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.path", "path must not be empty"));
    }

    let expiration_secs = cache
        .expiration_seconds
        .unwrap_or(DEFAULT_CACHE_EXPIRATION_SECS);
    let expiration = (expiration_secs > 0).then(|| Duration::from_secs(expiration_secs));

    let interval_secs = cache
        .cleanup_interval_seconds
        .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS);
    let cleanup_interval = positive_seconds(interval_secs, "cache.cleanup_interval_seconds")?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(false),
        path,
        expiration,
        cleanup_interval,
    })
}

fn build_github_settings(github: RawGithubSettings) -> Result<GithubSettings, LoadError> {
    let raw_url = github
        .api_url
        .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string());
    let api_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("github.api_url", format!("invalid url: {err}")))?;
    if !matches!(api_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "github.api_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = github
        .timeout_seconds
        .unwrap_or(DEFAULT_GITHUB_TIMEOUT_SECS);
    let timeout = positive_seconds(timeout_secs, "github.timeout_seconds")?;

    let allow_list = match github.repositories {
        None => AllowList::allow_all(),
        Some(RawRepositories::Compact(value)) => value
            .parse()
            .map_err(|err| LoadError::invalid("github.repositories", format!("{err}")))?,
        Some(RawRepositories::Table(table)) => AllowList::from_map(table),
    };

    Ok(GithubSettings {
        api_url,
        token: github.token.and_then(BearerToken::new),
        timeout,
        allow_list,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawProxySettings {
    secret: Option<String>,
    token_expiration_seconds: Option<u64>,
}

impl fmt::Debug for RawProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawProxySettings")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("token_expiration_seconds", &self.token_expiration_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    expiration_seconds: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawGithubSettings {
    api_url: Option<String>,
    token: Option<String>,
    timeout_seconds: Option<u64>,
    repositories: Option<RawRepositories>,
}

impl fmt::Debug for RawGithubSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawGithubSettings")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout_seconds", &self.timeout_seconds)
            .field("repositories", &self.repositories)
            .finish()
    }
}

/// Allow-list as either a table of `owner = ["repo", ...]` or the compact
/// string form accepted from the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRepositories {
    Compact(String),
    Table(HashMap<String, Vec<String>>),
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}
