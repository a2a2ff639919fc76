use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, File};
use engine_executors::{
    confirm::ConfirmationConfig, queue::ExecutionConfig, queue::worker::WorkerPoolConfig,
    retry::RetryConfig, signer_resolver::WalletDescriptor,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub custody: CustodyConfig,
    /// JSON array of wallet descriptors registered on startup
    #[serde(default)]
    pub wallets_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_send_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub resend_after_secs: u64,
    pub resend_after_blocks: Option<u64>,
    pub retry_interval_secs: u64,
    pub confirmation_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            poll_interval_ms: 500,
            batch_size: 500,
            max_send_attempts: 3,
            retry_base_delay_ms: 200,
            resend_after_secs: 60,
            resend_after_blocks: None,
            retry_interval_secs: 5,
            confirmation_interval_secs: 2,
        }
    }
}

impl QueueConfig {
    pub fn execution(&self) -> ExecutionConfig {
        ExecutionConfig {
            max_send_attempts: self.max_send_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            resend_after: Duration::from_secs(self.resend_after_secs),
            resend_after_blocks: self.resend_after_blocks,
            interval: Duration::from_secs(self.retry_interval_secs),
            batch_size: self.batch_size,
        }
    }

    pub fn confirmation(&self) -> ConfirmationConfig {
        ConfirmationConfig {
            interval: Duration::from_secs(self.confirmation_interval_secs),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CustodyConfig {
    /// Used by remote-custody wallets that carry no URL of their own
    #[serde(default)]
    pub remote_custody_url: Option<String>,
    /// Credential "ciphertext" in wallet descriptors is used as-is. Only for
    /// local development; startup is refused unless this is set.
    #[serde(default)]
    pub allow_plaintext_credentials: bool,
}

impl CustodyConfig {
    /// The only decryptor this binary ships treats stored credentials as plaintext.
    pub fn check_plaintext_credentials(&self) -> Result<(), ConfigError> {
        if self.allow_plaintext_credentials {
            Ok(())
        } else {
            Err(ConfigError::Message(
                "Wallet credentials would be read as plaintext; set custody.allow_plaintext_credentials to true to accept this"
                    .to_string(),
            ))
        }
    }
}

/// Loads `configuration/server_base.yaml`, the file for the current
/// `APP_ENVIRONMENT`, then `APP__*` environment variables.
pub fn get_config() -> Result<EngineConfig, ConfigError> {
    let base_path = env::current_dir()
        .map_err(|e| ConfigError::Message(format!("Failed to determine the current directory: {e}")))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()?
        .try_deserialize::<EngineConfig>()
}

/// Reads wallet descriptors from a JSON file. Kept out of the layered config
/// so descriptor keys keep their case.
pub fn load_wallets(path: &Path) -> Result<Vec<WalletDescriptor>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Message(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| ConfigError::Message(format!("Invalid wallet file {}: {e}", path.display())))
}

/// The possible runtime environment for our application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local`, `development`, or `production`."
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    #[test]
    fn queue_tunables_fall_back_to_defaults() {
        let yaml = r#"
redis:
  url: redis://localhost:6379
queue:
  worker_concurrency: 4
  resend_after_blocks: 12
chains:
  - chain_id: 80002
    rpc_url: https://rpc-amoy.polygon.technology
"#;
        let config: EngineConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.log_format, LogFormat::Pretty);
        assert_eq!(config.queue.worker_concurrency, 4);
        assert_eq!(config.queue.batch_size, 500);
        assert_eq!(config.queue.retry().resend_after_blocks, Some(12));
        assert_eq!(config.queue.retry().resend_after, Duration::from_secs(60));
        assert_eq!(config.chains[0].chain_id, 80002);
        assert!(config.wallets_file.is_none());
        assert!(config.redis.namespace.is_none());
        assert!(!config.custody.allow_plaintext_credentials);
        assert!(config.custody.check_plaintext_credentials().is_err());
    }

    #[test]
    fn plaintext_credentials_need_opt_in() {
        let custody = CustodyConfig {
            remote_custody_url: None,
            allow_plaintext_credentials: true,
        };
        assert!(custody.check_plaintext_credentials().is_ok());
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let err = Environment::try_from("staging".to_string()).unwrap_err();
        assert!(err.contains("staging"));
        assert_eq!(
            Environment::try_from("Production".to_string()).unwrap(),
            Environment::Production
        );
    }
}
