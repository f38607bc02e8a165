use crate::error::{CacheError, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the index inside the cache root unless configured otherwise.
pub const DEFAULT_INDEX_FILE_NAME: &str = "recently_used";

/// File name of the running-instance lock, placed next to the cache root.
pub const DEFAULT_MAIN_LOCK_FILE_NAME: &str = "instance.lock";

/// Size budget for cached artifacts.
///
/// Configured in megabytes. A negative or unparsable value means unlimited, in which
/// case a clean pass only removes entries marked for deletion or missing on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheSizeLimit {
    #[default]
    Unlimited,
    Bytes(u64),
}

impl CacheSizeLimit {
    pub fn from_megabytes(megabytes: i64) -> Self {
        match u64::try_from(megabytes) {
            Ok(mb) => Self::Bytes(mb.saturating_mul(1 << 20)),
            Err(_) => Self::Unlimited,
        }
    }

    /// Parse a megabyte count as found in configuration text.
    pub fn parse_megabytes(value: &str) -> Self {
        match value.trim().parse::<i64>() {
            Ok(mb) => Self::from_megabytes(mb),
            Err(err) => {
                tracing::warn!(
                    target = "jnlp.cache",
                    value,
                    error = %err,
                    "unparsable cache size limit; treating the cache as unlimited"
                );
                Self::Unlimited
            }
        }
    }

    pub fn max_bytes(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Bytes(bytes) => Some(*bytes),
        }
    }
}

impl Serialize for CacheSizeLimit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Unlimited => serializer.serialize_i64(-1),
            Self::Bytes(bytes) => serializer.serialize_u64(bytes >> 20),
        }
    }
}

impl<'de> Deserialize<'de> for CacheSizeLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Megabytes(i64),
            Text(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Megabytes(mb) => Self::from_megabytes(mb),
            Repr::Text(text) => Self::parse_megabytes(&text),
        })
    }
}

/// Logging settings for applications embedding the cache.
///
/// The cache itself only emits `tracing` events (target `jnlp.cache`); installing a
/// subscriber is up to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    /// The effective filter; `RUST_LOG`, when set, is merged after the configured
    /// directives.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let config_directives = Self::normalize_level_directives(&self.level);
        let fallback = || {
            tracing_subscriber::EnvFilter::try_new(&config_directives).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            })
        };

        match std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
        {
            Some(env_directives) => {
                tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(&env_directives))
                    .unwrap_or_else(|_| fallback())
            }
            None => fallback(),
        }
    }

    /// Install a global `fmt` subscriber writing to stderr. Returns `false` when a
    /// global subscriber is already set.
    pub fn try_init(&self) -> bool {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_writer(std::io::stderr);
        let result = if self.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        result.is_ok()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

/// Where the cache lives and how large it may grow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
    pub index_file: PathBuf,
    /// Lock file held (shared) by every running launcher; destructive operations
    /// only proceed when they can lock it exclusively.
    pub main_lock_file: PathBuf,
    pub max_size: CacheSizeLimit,
    /// Descriptor path of the application currently being launched, recorded in new
    /// `.info` files.
    pub launch_jnlp_path: Option<String>,
    pub logging: LoggingConfig,
}

/// On-disk form of [`CacheConfig`]; every field except the root is optional.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheConfigFile {
    cache_root: PathBuf,
    #[serde(default)]
    index_file: Option<PathBuf>,
    #[serde(default)]
    main_lock_file: Option<PathBuf>,
    #[serde(default)]
    max_size_mb: CacheSizeLimit,
    #[serde(default)]
    launch_jnlp_path: Option<String>,
    #[serde(default)]
    logging: LoggingConfig,
}

impl CacheConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let cache_root = cache_root.into();
        Self {
            index_file: cache_root.join(DEFAULT_INDEX_FILE_NAME),
            main_lock_file: default_main_lock_file(&cache_root),
            cache_root,
            max_size: CacheSizeLimit::Unlimited,
            launch_jnlp_path: None,
            logging: LoggingConfig::default(),
        }
    }

    /// `JNLP_CACHE_DIR` overrides the default root (`~/.cache/jnlp/cache`);
    /// `JNLP_CACHE_MAX_SIZE_MB` sets the size budget.
    pub fn from_env() -> Result<Self, CacheError> {
        let root = match std::env::var_os("JNLP_CACHE_DIR") {
            Some(root) => PathBuf::from(root),
            None => default_cache_root()?,
        };
        let mut config = Self::new(root);
        if let Ok(max) = std::env::var("JNLP_CACHE_MAX_SIZE_MB") {
            config.max_size = CacheSizeLimit::parse_megabytes(&max);
        }
        Ok(config)
    }

    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let file: CacheConfigFile = toml::from_str(text)?;
        let mut config = Self::new(file.cache_root);
        if let Some(index_file) = file.index_file {
            config.index_file = index_file;
        }
        if let Some(main_lock_file) = file.main_lock_file {
            config.main_lock_file = main_lock_file;
        }
        config.max_size = file.max_size_mb;
        config.launch_jnlp_path = file.launch_jnlp_path;
        config.logging = file.logging;
        Ok(config)
    }

    pub fn with_index_file(mut self, index_file: impl Into<PathBuf>) -> Self {
        self.index_file = index_file.into();
        self
    }

    pub fn with_main_lock_file(mut self, main_lock_file: impl Into<PathBuf>) -> Self {
        self.main_lock_file = main_lock_file.into();
        self
    }

    pub fn with_max_size(mut self, max_size: CacheSizeLimit) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_launch_jnlp_path(mut self, jnlp_path: impl Into<String>) -> Self {
        self.launch_jnlp_path = Some(jnlp_path.into());
        self
    }
}

fn default_main_lock_file(cache_root: &Path) -> PathBuf {
    match cache_root.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(DEFAULT_MAIN_LOCK_FILE_NAME),
        _ => cache_root.join(DEFAULT_MAIN_LOCK_FILE_NAME),
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".cache").join("jnlp").join("cache"))
}
