use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache management and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("resource {url} is not cacheable")]
    NotCacheable { url: String },

    #[error("invalid version {value:?}")]
    InvalidVersion { value: String },

    #[error("invalid cache id filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("path {path} is not under cache root {cache_root}")]
    PathNotUnderCacheRoot { path: PathBuf, cache_root: PathBuf },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors produced while loading a cache configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a snippet of the source text; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}
