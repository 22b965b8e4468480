use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Object store bulk deletes accept at most this many keys per call.
pub const MAX_PURGE_BATCH: usize = 1000;

/// MySQL caps a prepared statement at 65535 placeholders, one per hash.
pub const MAX_RESOLVER_BATCH: usize = 65_535;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl DatabaseConfig {
    fn mysql(database: &str) -> Self {
        Self {
            dsn: format!("mysql://reader@localhost:3306/{database}"),
        }
    }
}

/// Local cache used to resume a sweep across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dsn: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://cleaner.sqlite"),
        }
    }
}

/// Blob object store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `s3://key:secret@host[:port]/bucket`, `file:///path` or `memory://`
    pub dsn: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("memory://"),
            region: None,
        }
    }
}

/// Chain-indexing hub used to double-check spent claims.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainConfig {
    pub address: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Applies to the request write and to the response read separately.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            address: String::from("s-hub1.odysee.com:50001"),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Stream ids fetched per window query.
    pub window_size: i64,
    /// Runs of this many consecutive empty windows are reported as stalls.
    pub stalled_window_warning: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            window_size: 10_000,
            stalled_window_warning: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Exact maximum number of hashes per claim index query.
    pub batch_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { batch_size: 10_000 }
    }
}

/// Blob purge configuration.
///
/// Deletion is irreversible, so `dry_run` is on until explicitly disabled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurgeConfig {
    pub batch_size: usize,
    /// Purge workers per available core.
    pub worker_multiplier: usize,
    pub dry_run: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_PURGE_BATCH,
            worker_multiplier: 4,
            dry_run: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Reflector metadata database (MySQL, read-only)
    pub reflector: DatabaseConfig,
    /// Chainquery claim index (MySQL, read-only)
    pub chainquery: DatabaseConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub chain: ChainConfig,
    pub reader: ReaderConfig,
    pub resolver: ResolverConfig,
    pub purge: PurgeConfig,
    /// Worker pool size override; defaults to the available parallelism.
    pub workers: Option<usize>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            reflector: DatabaseConfig::mysql("reflector"),
            chainquery: DatabaseConfig::mysql("chainquery"),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            chain: ChainConfig::default(),
            reader: ReaderConfig::default(),
            resolver: ResolverConfig::default(),
            purge: PurgeConfig::default(),
            workers: None,
        }
    }
}

impl Configuration {
    pub const ENV_PREFIX: &'static str = "REFLECTOR_GC__";
    pub const DEFAULT_FILE: &'static str = "reflector-gc.toml";

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(Self::DEFAULT_FILE))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Size of CPU-bound and query worker pools.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn purge_worker_count(&self) -> usize {
        self.worker_count() * self.purge.worker_multiplier.max(1)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reflector.dsn.is_empty() {
            anyhow::bail!("reflector.dsn cannot be empty");
        }
        if self.chainquery.dsn.is_empty() {
            anyhow::bail!("chainquery.dsn cannot be empty");
        }
        if self.cache.dsn.is_empty() {
            anyhow::bail!("cache.dsn cannot be empty");
        }
        if self.storage.dsn.is_empty() {
            anyhow::bail!("storage.dsn cannot be empty");
        }
        if self.reader.window_size <= 0 {
            anyhow::bail!(
                "reader.window_size must be positive, got {}",
                self.reader.window_size
            );
        }
        if self.resolver.batch_size == 0 || self.resolver.batch_size > MAX_RESOLVER_BATCH {
            anyhow::bail!(
                "resolver.batch_size must be between 1 and {MAX_RESOLVER_BATCH}, got {}",
                self.resolver.batch_size
            );
        }
        if self.purge.batch_size == 0 || self.purge.batch_size > MAX_PURGE_BATCH {
            anyhow::bail!(
                "purge.batch_size must be between 1 and {MAX_PURGE_BATCH}, got {}",
                self.purge.batch_size
            );
        }
        if self.workers == Some(0) {
            anyhow::bail!("workers must be positive when set");
        }
        if self.chain.connect_timeout.is_zero() || self.chain.io_timeout.is_zero() {
            anyhow::bail!("chain timeouts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert!(config.purge.dry_run, "purge must default to dry-run");
        assert_eq!(config.purge.batch_size, MAX_PURGE_BATCH);
        assert_eq!(config.reader.window_size, 10_000);
        assert_eq!(config.cache.dsn, "sqlite://cleaner.sqlite");
        assert_eq!(config.chain.io_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_oversized_purge_batch_is_invalid() {
        let config = Configuration {
            purge: PurgeConfig {
                batch_size: MAX_PURGE_BATCH + 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolver_batch_bounds() {
        let oversized = Configuration {
            resolver: ResolverConfig {
                batch_size: MAX_RESOLVER_BATCH + 1,
            },
            ..Default::default()
        };
        assert!(oversized.validate().is_err());

        let largest = Configuration {
            resolver: ResolverConfig {
                batch_size: MAX_RESOLVER_BATCH,
            },
            ..Default::default()
        };
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn test_zero_window_is_invalid() {
        let config = Configuration {
            reader: ReaderConfig {
                window_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_counts() {
        let config = Configuration {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.purge_worker_count(), 12);
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gc.toml",
                r#"
                [reflector]
                dsn = "mysql://user:pw@db:3306/reflector"

                [chain]
                address = "127.0.0.1:50001"
                connect_timeout = "500ms"
                io_timeout = "1s"

                [purge]
                batch_size = 500
                worker_multiplier = 2
                dry_run = false
                "#,
            )?;
            jail.set_env("REFLECTOR_GC__RESOLVER__BATCH_SIZE", "25000");

            let config = Configuration::load_from_path(Path::new("gc.toml"))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.reflector.dsn, "mysql://user:pw@db:3306/reflector");
            assert_eq!(config.chain.connect_timeout, Duration::from_millis(500));
            assert_eq!(config.purge.batch_size, 500);
            assert!(!config.purge.dry_run);
            assert_eq!(config.resolver.batch_size, 25_000);
            // untouched sections keep their defaults
            assert_eq!(config.cache.dsn, "sqlite://cleaner.sqlite");
            Ok(())
        });
    }
}
