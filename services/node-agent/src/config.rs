//! Configuration for the node agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::image::S3Settings;
use crate::pool::{FirecrackerLauncherConfig, PoolConfig};
use crate::reader::{KafkaSettings, RouterConfig};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,

    /// Working directory for API sockets, vsock sockets and overlay copies.
    pub work_dir: PathBuf,

    /// Extra arguments passed to every Firecracker process.
    pub firecracker_args: Vec<String>,

    /// Soft cap on the number of microVMs owned by the pool.
    pub pool_max_size: usize,

    /// How long a function-bound idle VM is kept before it is destroyed.
    pub idle_timeout: Duration,

    /// How long to wait for a new VM's API socket.
    pub startup_timeout: Duration,

    /// Number of generic VMs started at boot.
    pub prewarm_count: usize,

    /// Subnet split into per-VM /30 networks.
    pub ip_subnet: String,

    /// Host interface used for NAT egress.
    pub egress_interface: String,

    /// Kafka bootstrap servers.
    pub kafka_brokers: String,

    /// Kafka consumer group.
    pub kafka_group_id: String,

    /// Topic carrying invocation requests.
    pub request_topic: String,

    /// Concurrent dispatches per partition.
    pub partition_concurrency: usize,

    /// Unacknowledged offsets tracked per partition before the consumer waits.
    pub max_outstanding: usize,

    /// How often computed commit offsets are flushed to the broker.
    pub commit_interval: Duration,

    /// Capacity of each per-function pending request queue.
    pub queue_capacity: usize,

    /// Grace period when killing a VM process.
    pub kill_grace: Duration,

    /// Object storage endpoint (MinIO or S3 compatible).
    pub s3_endpoint: String,

    /// Object storage access key.
    pub s3_access_key: String,

    /// Object storage secret key.
    pub s3_secret_key: String,

    /// Object storage region.
    pub s3_region: String,

    /// Allow plain HTTP to the object storage endpoint.
    pub s3_allow_http: bool,

    /// Directory holding downloaded images.
    pub cache_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let firecracker_args = std::env::var("MANGO_FIRECRACKER_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            firecracker_path: env_or("MANGO_FIRECRACKER_PATH", "/usr/local/bin/firecracker").into(),
            work_dir: env_or("MANGO_WORK_DIR", "/tmp/mangofaas-fc").into(),
            firecracker_args,
            pool_max_size: env_parse("MANGO_POOL_MAX_SIZE", 4)?,
            idle_timeout: Duration::from_secs(env_parse("MANGO_IDLE_TIMEOUT_SECS", 300)?),
            startup_timeout: Duration::from_secs(env_parse("MANGO_STARTUP_TIMEOUT_SECS", 15)?),
            prewarm_count: env_parse("MANGO_PREWARM_COUNT", 5)?,
            ip_subnet: env_or("MANGO_IP_SUBNET", "172.16.0.0/16"),
            egress_interface: env_or("MANGO_EGRESS_INTERFACE", "eth0"),
            kafka_brokers: env_or("MANGO_KAFKA_BROKERS", "localhost:9092"),
            kafka_group_id: env_or("MANGO_KAFKA_GROUP_ID", "firecracker-node"),
            request_topic: env_or("MANGO_REQUEST_TOPIC", "requests"),
            partition_concurrency: env_parse("MANGO_PARTITION_CONCURRENCY", 4)?,
            max_outstanding: env_parse("MANGO_MAX_OUTSTANDING", 1024)?,
            commit_interval: Duration::from_millis(env_parse("MANGO_COMMIT_INTERVAL_MS", 1000)?),
            queue_capacity: env_parse("MANGO_QUEUE_CAPACITY", 16)?,
            kill_grace: Duration::from_millis(env_parse("MANGO_KILL_GRACE_MS", 2000)?),
            s3_endpoint: env_or("MANGO_S3_ENDPOINT", "http://127.0.0.1:9000"),
            s3_access_key: env_or("MANGO_S3_ACCESS_KEY", "minioadmin"),
            s3_secret_key: env_or("MANGO_S3_SECRET_KEY", "minioadmin"),
            s3_region: env_or("MANGO_S3_REGION", "us-east-1"),
            s3_allow_http: env_parse("MANGO_S3_ALLOW_HTTP", true)?,
            cache_dir: env_or("MANGO_CACHE_DIR", "/var/lib/mangofaas/cache").into(),
            log_level: env_or("MANGO_LOG_LEVEL", "info"),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.pool_max_size,
            idle_timeout: self.idle_timeout,
            prewarm_count: self.prewarm_count,
            kill_grace: self.kill_grace,
        }
    }

    pub fn launcher_config(&self) -> FirecrackerLauncherConfig {
        FirecrackerLauncherConfig {
            firecracker_path: self.firecracker_path.clone(),
            work_dir: self.work_dir.clone(),
            extra_args: self.firecracker_args.clone(),
            startup_timeout: self.startup_timeout,
            kill_grace: self.kill_grace,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            partition_concurrency: self.partition_concurrency,
            max_outstanding: self.max_outstanding,
        }
    }

    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            brokers: self.kafka_brokers.clone(),
            group_id: self.kafka_group_id.clone(),
            request_topic: self.request_topic.clone(),
            commit_interval: self.commit_interval,
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            endpoint: self.s3_endpoint.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
            region: self.s3_region.clone(),
            allow_http: self.s3_allow_http,
        }
    }

    /// Per-VM writable overlay copies.
    pub fn overlay_dir(&self) -> PathBuf {
        self.work_dir.join("overlays")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default_and_error() {
        assert_eq!(env_parse::<usize>("MANGO_TEST_UNSET_VALUE", 7).unwrap(), 7);

        std::env::set_var("MANGO_TEST_BAD_NUMBER", "four");
        let err = env_parse::<usize>("MANGO_TEST_BAD_NUMBER", 4).unwrap_err();
        assert!(err.to_string().contains("MANGO_TEST_BAD_NUMBER"));
        std::env::remove_var("MANGO_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_reclaim_interval_floor() {
        let mut config = Config::from_env().unwrap();
        config.idle_timeout = Duration::from_secs(4);
        assert_eq!(config.pool_config().reclaim_interval(), Duration::from_secs(5));
        config.idle_timeout = Duration::from_secs(300);
        assert_eq!(config.pool_config().reclaim_interval(), Duration::from_secs(150));
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::from_env().unwrap();
        config.work_dir = PathBuf::from("/srv/fc");
        config.pool_max_size = 8;
        config.partition_concurrency = 3;

        assert_eq!(config.overlay_dir(), PathBuf::from("/srv/fc/overlays"));
        assert_eq!(config.pool_config().max_pool_size, 8);
        assert_eq!(config.launcher_config().work_dir, PathBuf::from("/srv/fc"));
        assert_eq!(config.launcher_config().kill_grace, config.kill_grace);
        assert_eq!(config.router_config().partition_concurrency, 3);
        assert_eq!(config.kafka_settings().request_topic, config.request_topic);
        assert_eq!(config.s3_settings().endpoint, config.s3_endpoint);
    }
}
