//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, DeliveryMode};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "imgcache";
const ENV_PREFIX: &str = "IMGCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BACKEND_ROOT: &str = "cache";
const DEFAULT_SOURCE_ROOT: &str = "images";
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TRANSFORM_TIMEOUT_MS: u64 = 30_000;
const MAX_PATH_PREFIX_DEPTH: usize = 16;

/// Command-line arguments for the imgcache binary.
#[derive(Debug, Parser)]
#[command(name = "imgcache", version, about = "Request-time image transform cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "IMGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve images over HTTP.
    Serve(Box<ServeArgs>),
    /// Run one trim sweep against the configured backend and exit.
    Trim(TrimArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the artifact freshness horizon in days.
    #[arg(long = "cache-max-age-days", value_name = "DAYS")]
    pub max_age_days: Option<u32>,

    /// Override the cache backend root directory.
    #[arg(long = "backend-root", value_name = "PATH")]
    pub backend_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

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

    /// Override artifact delivery (redirect|stream).
    #[arg(long = "cache-delivery-mode", value_name = "MODE")]
    pub delivery_mode: Option<String>,

    /// Toggle background trim sweeps.
    #[arg(
        long = "cache-trim-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub trim_enabled: Option<bool>,

    /// Override the source image directory.
    #[arg(long = "source-root", value_name = "PATH")]
    pub source_root: Option<PathBuf>,

    /// Fetch source images from this origin instead of a directory.
    #[arg(long = "source-base-url", value_name = "URL")]
    pub source_base_url: Option<String>,

    /// Pipe sources through this program instead of passing them through.
    #[arg(long = "transform-program", value_name = "PATH")]
    pub transform_program: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct TrimArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub backend: BackendSettings,
    pub source: SourceSettings,
    pub transform: TransformSettings,
    pub cors: CorsSettings,
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

/// `[cache]` section; see [`CacheConfig`] for the meaning of each field.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_age_days: u32,
    pub trim_enabled: bool,
    pub delivery_mode: DeliveryMode,
    pub path_prefix_depth: usize,
    pub head_check_timeout_ms: u64,
    pub index_ttl_secs: u64,
    pub index_capacity: NonZeroUsize,
    pub trim_interval_secs: u64,
    pub trim_page_size: NonZeroUsize,
    pub backend_timeout_ms: u64,
    pub read_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub root: PathBuf,
    /// Where clients can fetch stored artifacts directly; required for redirect delivery.
    pub public_base_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSettings {
    Filesystem { root: PathBuf },
    Http { base_url: Url, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformSettings {
    Passthrough {
        timeout: Duration,
    },
    Command {
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
    },
}

impl TransformSettings {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Passthrough { timeout } | Self::Command { timeout, .. } => *timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorsSettings {
    pub allow_origins: Vec<String>,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("cors.allow_origins")
            .with_list_parse_key("transform.args"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Trim(args)) => raw.apply_cache_overrides(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    backend: RawBackendSettings,
    source: RawSourceSettings,
    transform: RawTransformSettings,
    cors: RawCorsSettings,
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
        if let Some(mode) = overrides.delivery_mode.as_ref() {
            self.cache.delivery_mode = Some(mode.clone());
        }
        if let Some(enabled) = overrides.trim_enabled {
            self.cache.trim_enabled = Some(enabled);
        }
        if let Some(root) = overrides.source_root.as_ref() {
            self.source.kind = Some("filesystem".to_string());
            self.source.root = Some(root.clone());
        }
        if let Some(base_url) = overrides.source_base_url.as_ref() {
            self.source.kind = Some("http".to_string());
            self.source.base_url = Some(base_url.clone());
        }
        if let Some(program) = overrides.transform_program.as_ref() {
            self.transform.kind = Some("command".to_string());
            self.transform.program = Some(program.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(days) = overrides.max_age_days {
            self.cache.max_age_days = Some(days);
        }
        if let Some(root) = overrides.backend_root.as_ref() {
            self.backend.kind = Some(BackendKind::Filesystem);
            self.backend.root = Some(root.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            backend,
            source,
            transform,
            cors,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let backend = build_backend_settings(backend)?;
        let source = build_source_settings(source)?;
        let transform = build_transform_settings(transform)?;
        let cors = build_cors_settings(cors);

        if cache.delivery_mode == DeliveryMode::Redirect && backend.public_base_url.is_none() {
            return Err(LoadError::invalid(
                "backend.public_base_url",
                "redirect delivery needs a public base URL",
            ));
        }

        Ok(Self {
            server,
            logging,
            cache,
            backend,
            source,
            transform,
            cors,
        })
    }

    /// Immutable cache configuration shared by the backend, orchestrator and trim scheduler.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
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
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let max_age_days = cache.max_age_days.unwrap_or(defaults.max_age_days);
    if max_age_days == 0 {
        return Err(LoadError::invalid(
            "cache.max_age_days",
            "must be greater than zero",
        ));
    }

    let delivery_mode = match cache.delivery_mode {
        Some(mode) => DeliveryMode::from_str(&mode)
            .map_err(|reason| LoadError::invalid("cache.delivery_mode", reason))?,
        None => defaults.delivery_mode,
    };

    let path_prefix_depth = cache
        .path_prefix_depth
        .unwrap_or(defaults.path_prefix_depth);
    if path_prefix_depth > MAX_PATH_PREFIX_DEPTH {
        return Err(LoadError::invalid(
            "cache.path_prefix_depth",
            format!("must be at most {MAX_PATH_PREFIX_DEPTH}"),
        ));
    }

    let head_check_timeout_ms = positive(
        cache.head_check_timeout_ms.unwrap_or(defaults.head_check_timeout_ms),
        "cache.head_check_timeout_ms",
    )?;
    let index_ttl_secs = positive(
        cache.index_ttl_seconds.unwrap_or(defaults.index_ttl_secs),
        "cache.index_ttl_seconds",
    )?;
    let trim_interval_secs = positive(
        cache
            .trim_interval_seconds
            .unwrap_or(defaults.trim_interval_secs),
        "cache.trim_interval_seconds",
    )?;
    let backend_timeout_ms = positive(
        cache.backend_timeout_ms.unwrap_or(defaults.backend_timeout_ms),
        "cache.backend_timeout_ms",
    )?;

    let index_capacity = non_zero_usize(
        cache.index_capacity.unwrap_or(defaults.index_capacity as u64),
        "cache.index_capacity",
    )?;
    let trim_page_size = non_zero_usize(
        cache.trim_page_size.unwrap_or(defaults.trim_page_size as u64),
        "cache.trim_page_size",
    )?;

    let read_retries = cache.read_retries.unwrap_or(defaults.read_retries);
    if read_retries == 0 {
        return Err(LoadError::invalid(
            "cache.read_retries",
            "must allow at least one attempt",
        ));
    }

    Ok(CacheSettings {
        max_age_days,
        trim_enabled: cache.trim_enabled.unwrap_or(defaults.trim_enabled),
        delivery_mode,
        path_prefix_depth,
        head_check_timeout_ms,
        index_ttl_secs,
        index_capacity,
        trim_interval_secs,
        trim_page_size,
        backend_timeout_ms,
        read_retries,
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = backend.kind.unwrap_or(BackendKind::Filesystem);
    let root = backend
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKEND_ROOT));
    if kind == BackendKind::Filesystem && root.as_os_str().is_empty() {
        return Err(LoadError::invalid("backend.root", "path must not be empty"));
    }

    let public_base_url = backend
        .public_base_url
        .filter(|value| !value.trim().is_empty())
        .map(|value| parse_url(&value, "backend.public_base_url"))
        .transpose()?;

    Ok(BackendSettings {
        kind,
        root,
        public_base_url,
    })
}

fn build_source_settings(source: RawSourceSettings) -> Result<SourceSettings, LoadError> {
    let kind = source.kind.unwrap_or_else(|| "filesystem".to_string());
    match kind.trim().to_ascii_lowercase().as_str() {
        "filesystem" => {
            let root = source
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_ROOT));
            if root.as_os_str().is_empty() {
                return Err(LoadError::invalid("source.root", "path must not be empty"));
            }
            Ok(SourceSettings::Filesystem { root })
        }
        "http" => {
            let base_url = source
                .base_url
                .ok_or_else(|| LoadError::invalid("source.base_url", "required for http sources"))
                .and_then(|value| parse_url(&value, "source.base_url"))?;
            let timeout_ms = positive(
                source.timeout_ms.unwrap_or(DEFAULT_SOURCE_TIMEOUT_MS),
                "source.timeout_ms",
            )?;
            Ok(SourceSettings::Http {
                base_url,
                timeout: Duration::from_millis(timeout_ms),
            })
        }
        other => Err(LoadError::invalid(
            "source.kind",
            format!("unknown source kind `{other}`"),
        )),
    }
}

fn build_transform_settings(
    transform: RawTransformSettings,
) -> Result<TransformSettings, LoadError> {
    let timeout_ms = positive(
        transform.timeout_ms.unwrap_or(DEFAULT_TRANSFORM_TIMEOUT_MS),
        "transform.timeout_ms",
    )?;
    let timeout = Duration::from_millis(timeout_ms);

    let kind = transform.kind.unwrap_or_else(|| "passthrough".to_string());
    match kind.trim().to_ascii_lowercase().as_str() {
        "passthrough" => Ok(TransformSettings::Passthrough { timeout }),
        "command" => {
            let program = transform
                .program
                .filter(|path| !path.as_os_str().is_empty())
                .ok_or_else(|| {
                    LoadError::invalid("transform.program", "required for command transforms")
                })?;
            Ok(TransformSettings::Command {
                program,
                args: transform.args.unwrap_or_default(),
                timeout,
            })
        }
        other => Err(LoadError::invalid(
            "transform.kind",
            format!("unknown transform kind `{other}`"),
        )),
    }
}

fn build_cors_settings(cors: RawCorsSettings) -> CorsSettings {
    let allow_origins = cors
        .allow_origins
        .unwrap_or_default()
        .into_iter()
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect();
    CorsSettings { allow_origins }
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_age_days: Option<u32>,
    trim_enabled: Option<bool>,
    delivery_mode: Option<String>,
    path_prefix_depth: Option<usize>,
    head_check_timeout_ms: Option<u64>,
    index_ttl_seconds: Option<u64>,
    index_capacity: Option<u64>,
    trim_interval_seconds: Option<u64>,
    trim_page_size: Option<u64>,
    backend_timeout_ms: Option<u64>,
    read_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<BackendKind>,
    root: Option<PathBuf>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSourceSettings {
    kind: Option<String>,
    root: Option<PathBuf>,
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTransformSettings {
    kind: Option<String>,
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCorsSettings {
    allow_origins: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    Url::parse(value.trim()).map_err(|err| LoadError::invalid(key, format!("invalid URL: {err}")))
}

fn positive(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
