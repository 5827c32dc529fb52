use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub query: QueryConfig,
    pub pool: PoolConfig,
    pub inference: InferenceConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Row limit when the caller gives none
    pub preview_limit: u64,
    /// Upper bound on any caller-supplied limit
    pub max_limit: u64,
    pub timeout_secs: u64,
    /// Extra attempts after a connection error
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Live handles allowed per descriptor fingerprint
    pub max_size: usize,
    /// Pools kept at once; the least recently used idle one goes first
    pub max_pools: usize,
    /// Idle pools older than this are closed
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub sample_size: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Directory that file and embedded source paths must resolve under
    pub root: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("query.preview_limit", 100)?
            .set_default("query.max_limit", 1000)?
            .set_default("query.timeout_secs", 30)?
            .set_default("query.connect_retries", 1)?
            .set_default("pool.max_size", 16)?
            .set_default("pool.max_pools", 64)?
            .set_default("pool.idle_secs", 300)?
            .set_default("inference.sample_size", 100)?
            .set_default("data.root", "data")?;

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(8000))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        if let Ok(root) = env::var("DATA_ROOT") {
            builder = builder.set_override("data.root", root)?;
        }

        for (var, key) in [
            ("QUERY_TIMEOUT_SECS", "query.timeout_secs"),
            ("PREVIEW_LIMIT", "query.preview_limit"),
            ("MAX_LIMIT", "query.max_limit"),
            ("POOL_MAX_SIZE", "pool.max_size"),
            ("POOL_MAX_COUNT", "pool.max_pools"),
            ("POOL_IDLE_SECS", "pool.idle_secs"),
            ("INFERENCE_SAMPLE_SIZE", "inference.sample_size"),
            ("INFERENCE_SEED", "inference.seed"),
        ] {
            if let Ok(value) = env::var(var) {
                match value.trim().parse::<u64>() {
                    Ok(number) => builder = builder.set_override(key, number)?,
                    Err(_) => tracing::warn!("Ignoring non-numeric {}={}", var, value),
                }
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query.timeout_secs.max(1))
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.idle_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
            query: QueryConfig {
                preview_limit: 100,
                max_limit: 1000,
                timeout_secs: 30,
                connect_retries: 1,
            },
            pool: PoolConfig {
                max_size: 16,
                max_pools: 64,
                idle_secs: 300,
            },
            inference: InferenceConfig {
                sample_size: 100,
                seed: None,
            },
            data: DataConfig {
                root: "data".to_string(),
            },
        }
    }
}
