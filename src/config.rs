use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProducerOptions {
    #[serde(default = "default_send_msg_timeout_ms")]
    pub send_msg_timeout_ms: u64,
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConsumerOptions {
    #[serde(default = "default_max_reconsume_times")]
    pub max_reconsume_times: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MqConfig {
    /// Name server in `host:port` form.
    pub name_server: String,
    pub group_name: String,
    #[serde(default)]
    pub producer: Option<ProducerOptions>,
    #[serde(default)]
    pub consumer: ConsumerOptions,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_send_msg_timeout_ms() -> u64 {
    3000
}

fn default_retry_times() -> u32 {
    3
}

fn default_max_reconsume_times() -> u32 {
    3
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            send_msg_timeout_ms: default_send_msg_timeout_ms(),
            retry_times: default_retry_times(),
        }
    }
}

impl ProducerOptions {
    pub fn send_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.send_msg_timeout_ms)
    }
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_reconsume_times: default_max_reconsume_times(),
        }
    }
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            name_server: "127.0.0.1:9876".to_string(),
            group_name: "TestGroup".to_string(),
            producer: Some(ProducerOptions::default()),
            consumer: ConsumerOptions::default(),
            log_level: default_log_level(),
        }
    }
}

impl MqConfig {
    /// Get the log level as a tracing::Level
    pub fn get_tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(tracing::Level::TRACE),
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" | "warning" => Ok(tracing::Level::WARN),
            "error" => Ok(tracing::Level::ERROR),
            _ => Err(anyhow::anyhow!("Invalid log level: {}. Valid levels are: trace, debug, info, warn, error", self.log_level))
        }
    }

    /// Validate the log level is one of the supported values
    pub fn validate_log_level(&self) -> Result<()> {
        self.get_tracing_level().map(|_| ())
    }

    /// Rejects zero values that the client would otherwise accept silently.
    pub fn validate(&self) -> Result<()> {
        if self.group_name.trim().is_empty() {
            return Err(anyhow::anyhow!("group_name must not be empty"));
        }
        if let Some(producer) = &self.producer {
            if producer.retry_times == 0 {
                return Err(anyhow::anyhow!("producer.retry_times must be greater than zero"));
            }
            if producer.send_msg_timeout_ms == 0 {
                return Err(anyhow::anyhow!("producer.send_msg_timeout_ms must be greater than zero"));
            }
        }
        self.validate_log_level()
    }

    pub async fn load_file(file_path: &str) -> Result<Self> {
        if !Path::new(file_path).exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", file_path));
        }

        let content = fs::read_to_string(file_path).await?;
        let config: MqConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `MQ_CONFIG`, or the defaults when it is unset.
    pub async fn from_env() -> Result<Self> {
        match std::env::var("MQ_CONFIG") {
            Ok(config_file) => {
                tracing::debug!(config_file = %config_file, "loading mq config");
                Self::load_file(&config_file).await
            }
            Err(_) => Ok(Self::default()),
        }
    }
}
