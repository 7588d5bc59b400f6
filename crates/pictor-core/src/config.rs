//! Configuration module
//!
//! Everything is read from the environment (a `.env` file is honoured in
//! development) with typed defaults, then checked by [`Config::validate`].

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::settings::PipelineSettings;
use crate::storage_types::StorageBackend;

const DB_MAX_CONNECTIONS: u32 = 20;
const DB_TIMEOUT_SECS: u64 = 30;

const POOL_WORKERS: usize = 4;
const POOL_QUEUE_CAPACITY: usize = 256;
const POOL_SUBMIT_ATTEMPTS: u32 = 3;
const POOL_SUBMIT_RETRY_DELAY_MS: u64 = 100;
const POOL_SUBMIT_TIMEOUT_SECS: u64 = 5;
const POOL_SHUTDOWN_GRACE_SECS: u64 = 30;

const CACHE_CAPACITY: usize = 1024;
const CACHE_FETCH_TIMEOUT_MS: u64 = 5000;

/// Smallest chunk a client may choose unless the whole file fits in one.
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 20 * 1024 * 1024;
/// Ceiling on `ceil(total_size / chunk_size)`.
pub const MAX_CHUNK_COUNT: u64 = 10_000;
const MAX_CONCURRENT_SESSIONS: usize = 1000;
const CHUNK_SIZE_TOLERANCE: u64 = 1024;
const SESSION_EXPIRY_HOURS: u64 = 24;
const SESSION_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
const MAX_FILE_SIZE_MB: u64 = 500;

/// Bounded task pool sizing and submission policy.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// `try_submit_with_retry` attempts used by producers.
    pub submit_attempts: u32,
    pub submit_retry_delay: Duration,
    /// Wait bound for `submit_blocking`.
    pub submit_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: POOL_WORKERS,
            queue_capacity: POOL_QUEUE_CAPACITY,
            submit_attempts: POOL_SUBMIT_ATTEMPTS,
            submit_retry_delay: Duration::from_millis(POOL_SUBMIT_RETRY_DELAY_MS),
            submit_timeout: Duration::from_secs(POOL_SUBMIT_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(POOL_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Chunked upload limits.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub scratch_dir: PathBuf,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_chunk_count: u64,
    pub max_file_size: u64,
    pub max_concurrent_sessions: usize,
    /// Extra bytes a chunk may carry beyond its declared size.
    pub chunk_size_tolerance: u64,
    pub session_expiry: Duration,
    pub sweep_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: env::temp_dir().join("pictor-uploads"),
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            max_chunk_count: MAX_CHUNK_COUNT,
            max_file_size: MAX_FILE_SIZE_MB * 1024 * 1024,
            max_concurrent_sessions: MAX_CONCURRENT_SESSIONS,
            chunk_size_tolerance: CHUNK_SIZE_TOLERANCE,
            session_expiry: Duration::from_secs(SESSION_EXPIRY_HOURS * 60 * 60),
            sweep_interval: Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    /// Postgres URL. In-memory stores are used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub storage_backend: StorageBackend,
    pub local_storage_path: PathBuf,
    pub pool: PoolConfig,
    pub cache_capacity: usize,
    pub cache_fetch_timeout: Duration,
    pub upload: UploadConfig,
    /// Initial pipeline settings; the running service may change them later.
    pub pipeline: PipelineSettings,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());

        let storage_backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse::<StorageBackend>()?;

        let local_storage_path = PathBuf::from(
            env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./data/storage".to_string()),
        );

        let pool_defaults = PoolConfig::default();
        let pool = PoolConfig {
            workers: env_or("POOL_WORKERS", pool_defaults.workers),
            queue_capacity: env_or("POOL_QUEUE_CAPACITY", pool_defaults.queue_capacity),
            submit_attempts: env_or("POOL_SUBMIT_ATTEMPTS", pool_defaults.submit_attempts),
            submit_retry_delay: Duration::from_millis(env_or(
                "POOL_SUBMIT_RETRY_DELAY_MS",
                POOL_SUBMIT_RETRY_DELAY_MS,
            )),
            submit_timeout: env_secs("POOL_SUBMIT_TIMEOUT_SECS", pool_defaults.submit_timeout),
            shutdown_grace: env_secs("POOL_SHUTDOWN_GRACE_SECS", pool_defaults.shutdown_grace),
        };

        let upload_defaults = UploadConfig::default();
        let upload = UploadConfig {
            scratch_dir: env::var("UPLOAD_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(upload_defaults.scratch_dir),
            min_chunk_size: env_or("UPLOAD_MIN_CHUNK_SIZE", upload_defaults.min_chunk_size),
            max_chunk_size: env_or("UPLOAD_MAX_CHUNK_SIZE", upload_defaults.max_chunk_size),
            max_chunk_count: env_or("UPLOAD_MAX_CHUNK_COUNT", upload_defaults.max_chunk_count),
            max_file_size: env_or("UPLOAD_MAX_FILE_SIZE_MB", MAX_FILE_SIZE_MB) * 1024 * 1024,
            max_concurrent_sessions: env_or(
                "UPLOAD_MAX_CONCURRENT_SESSIONS",
                upload_defaults.max_concurrent_sessions,
            ),
            chunk_size_tolerance: env_or(
                "UPLOAD_CHUNK_SIZE_TOLERANCE",
                upload_defaults.chunk_size_tolerance,
            ),
            session_expiry: Duration::from_secs(
                env_or("UPLOAD_SESSION_EXPIRY_HOURS", SESSION_EXPIRY_HOURS) * 60 * 60,
            ),
            sweep_interval: env_secs("UPLOAD_SWEEP_INTERVAL_SECS", upload_defaults.sweep_interval),
        };

        let pipeline_defaults = PipelineSettings::default();
        let thumbnail_sizes = match env::var("THUMBNAIL_SIZES") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<u32>()
                        .map_err(|e| anyhow::anyhow!("Invalid THUMBNAIL_SIZES entry '{}': {}", s, e))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => pipeline_defaults.thumbnail_sizes.clone(),
        };
        let pipeline = PipelineSettings {
            webp_enabled: env_bool("WEBP_ENABLED", pipeline_defaults.webp_enabled),
            webp_quality: env_or("WEBP_QUALITY", pipeline_defaults.webp_quality),
            thumbnails_enabled: env_bool("THUMBNAILS_ENABLED", pipeline_defaults.thumbnails_enabled),
            thumbnail_sizes,
            thumbnail_quality: env_or("THUMBNAIL_QUALITY", pipeline_defaults.thumbnail_quality),
            max_retries: env_or("DERIVATIVE_MAX_RETRIES", pipeline_defaults.max_retries),
            retry_base_backoff: env_secs(
                "DERIVATIVE_RETRY_BASE_BACKOFF_SECS",
                pipeline_defaults.retry_base_backoff,
            ),
            retry_backoff_cap: env_secs(
                "DERIVATIVE_RETRY_BACKOFF_CAP_SECS",
                pipeline_defaults.retry_backoff_cap,
            ),
            retry_scan_interval: env_secs(
                "RETRY_SCAN_INTERVAL_SECS",
                pipeline_defaults.retry_scan_interval,
            ),
            retry_batch_size: env_or("RETRY_SCAN_BATCH_SIZE", pipeline_defaults.retry_batch_size),
            orphan_scan_interval: env_secs(
                "ORPHAN_SCAN_INTERVAL_SECS",
                pipeline_defaults.orphan_scan_interval,
            ),
            orphan_stale_after: env_secs(
                "ORPHAN_STALE_AFTER_SECS",
                pipeline_defaults.orphan_stale_after,
            ),
            orphan_batch_size: env_or(
                "ORPHAN_SCAN_BATCH_SIZE",
                pipeline_defaults.orphan_batch_size,
            ),
        };

        let config = Config {
            environment,
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", DB_TIMEOUT_SECS),
            storage_backend,
            local_storage_path,
            pool,
            cache_capacity: env_or("CACHE_CAPACITY", CACHE_CAPACITY),
            cache_fetch_timeout: Duration::from_millis(env_or(
                "CACHE_FETCH_TIMEOUT_MS",
                CACHE_FETCH_TIMEOUT_MS,
            )),
            upload,
            pipeline,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        if self.pool.workers == 0 {
            return Err(anyhow::anyhow!("POOL_WORKERS must be greater than zero"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(anyhow::anyhow!("POOL_QUEUE_CAPACITY must be greater than zero"));
        }
        if self.pool.submit_attempts == 0 {
            return Err(anyhow::anyhow!("POOL_SUBMIT_ATTEMPTS must be greater than zero"));
        }

        if self.cache_capacity == 0 {
            return Err(anyhow::anyhow!("CACHE_CAPACITY must be greater than zero"));
        }
        if self.cache_fetch_timeout.is_zero() {
            return Err(anyhow::anyhow!("CACHE_FETCH_TIMEOUT_MS must be greater than zero"));
        }

        let upload = &self.upload;
        if upload.min_chunk_size == 0 || upload.min_chunk_size > upload.max_chunk_size {
            return Err(anyhow::anyhow!(
                "UPLOAD_MIN_CHUNK_SIZE must be positive and not exceed UPLOAD_MAX_CHUNK_SIZE"
            ));
        }
        if upload.max_chunk_count == 0 {
            return Err(anyhow::anyhow!("UPLOAD_MAX_CHUNK_COUNT must be greater than zero"));
        }
        if upload.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_MAX_CONCURRENT_SESSIONS must be greater than zero"
            ));
        }

        self.pipeline.validate()
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }
}
