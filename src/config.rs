//! Configuration surface.

use std::sync::Arc;

use crate::prelude::*;

/// A side-effect-free-by-contract debug sink. The cache calls this in
/// addition to (not instead of) its own `tracing` events, so a host can
/// thread cache diagnostics into whatever logging fabric it already has
/// without standing up a `tracing` subscriber.
pub trait CacheLogger: Send + Sync {
    fn debug(&self, message: &str);
}

/// Recognized configuration options. `Config` is a plain data holder —
/// constructing one never touches the filesystem; validation and directory
/// creation happen in [`crate::cache::Cache::new`].
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Absolute path to the cache directory. Must exist or be creatable.
    pub dir: PathBuf,
    /// Size budget in bytes. Zero means "compute a dynamic default".
    #[serde(default)]
    pub max_size: u64,
    /// Optional debug sink; not (de)serializable, so it defaults to `None`
    /// when a `Config` is loaded from e.g. a TOML/JSON file.
    #[serde(skip)]
    pub logger: Option<Arc<dyn CacheLogger>>,
}

impl Config {
    pub fn new(dir: impl Into<PathBuf>) -> Config {
        Config {
            dir: dir.into(),
            max_size: 0,
            logger: None,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn CacheLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub(crate) fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{message}");
        if let Some(logger) = &self.logger {
            logger.debug(message);
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("dir", &self.dir)
            .field("max_size", &self.max_size)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserializes_without_logger() {
        let json = r#"{"dir": "/tmp/cache", "max_size": 1024}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.max_size, 1024);
        assert!(config.logger.is_none());
    }

    #[test]
    fn default_max_size_is_zero() {
        let config = Config::new("/tmp/cache");
        assert_eq!(config.max_size, 0);
    }
}
