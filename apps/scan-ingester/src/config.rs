use anyhow::Result;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub project_id: String,
    pub topic_id: String,
    pub broker_addr: String,
    pub worker_count: usize,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub ack_timeout_ms: u64,
    pub db_pool_size: u32,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_ssl_mode: String,
    pub redis_enabled: bool,
    pub redis_addr: String,
    pub redis_password: String,
    pub redis_db: i64,
    pub redis_ttl_secs: u64,
    pub log_level: String,
    pub log_output: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let worker_count = env::var("INGESTER_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let worker_count = if worker_count <= 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            worker_count as usize
        };

        Ok(Self {
            project_id: env::var("INGESTER_PROJECTID")
                .unwrap_or_else(|_| "scan-ingester".to_string()),
            topic_id: env::var("INGESTER_TOPICID").unwrap_or_else(|_| "scans".to_string()),
            broker_addr: env::var("INGESTER_BROKER_ADDR")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            worker_count,
            flush_interval_ms: env::var("INGESTER_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            max_batch_size: env::var("INGESTER_MAX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            ack_timeout_ms: env::var("INGESTER_ACK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
            db_pool_size: env::var("INGESTER_DB_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            postgres_user: env::var("INGESTER_POSTGRES_USER")
                .unwrap_or_else(|_| "postgres".to_string()),
            postgres_password: env::var("INGESTER_POSTGRES_PASSWORD").unwrap_or_default(),
            postgres_host: env::var("INGESTER_POSTGRES_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            postgres_port: env::var("INGESTER_POSTGRES_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            postgres_db: env::var("INGESTER_POSTGRES_DB").unwrap_or_else(|_| "scans".to_string()),
            postgres_ssl_mode: env::var("INGESTER_POSTGRES_SSL_MODE")
                .unwrap_or_else(|_| "disable".to_string()),
            redis_enabled: env::var("INGESTER_REDIS_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            redis_addr: env::var("INGESTER_REDIS_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:6379".to_string()),
            redis_password: env::var("INGESTER_REDIS_PASSWORD").unwrap_or_default(),
            redis_db: env::var("INGESTER_REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            redis_ttl_secs: env::var("INGESTER_REDIS_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86_400),
            log_level: normalize_log_level(
                &env::var("INGESTER_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            ),
            log_output: env::var("INGESTER_LOG_OUTPUT").unwrap_or_else(|_| "console".to_string()),
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_host,
            self.postgres_port,
            self.postgres_db,
            self.postgres_ssl_mode,
        )
    }

    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}/{}", self.redis_addr, self.redis_db)
        } else {
            format!(
                "redis://:{}@{}/{}",
                self.redis_password, self.redis_addr, self.redis_db
            )
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn redis_ttl(&self) -> Duration {
        Duration::from_secs(self.redis_ttl_secs)
    }
}

fn normalize_log_level(level: &str) -> String {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
    .to_string()
}
