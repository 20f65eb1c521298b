use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

use crate::connection::MasterEndpoint;

const LOCAL_ENV: &str = "local";
const DEFAULT_MASTER_URL: &str = "http://leader.mesos:5050";

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub master: MasterConfig,
    /// Deadline in seconds for the subscribe call to start streaming.
    #[serde_inline_default(5u64)]
    pub connect_timeout_secs: u64,
    /// Fixed delay in milliseconds between connection attempts.
    #[serde_inline_default(100u64)]
    pub retry_delay_ms: u64,
    /// Caller-side bound in seconds on the subscriber handshake.
    #[serde_inline_default(5u64)]
    pub subscribe_timeout_secs: u64,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            env: LOCAL_ENV.to_string(),
            master: MasterConfig::default(),
            connect_timeout_secs: 5,
            retry_delay_ms: 100,
            subscribe_timeout_secs: 5,
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde_inline_default(DEFAULT_MASTER_URL.to_string())]
    pub url: String,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            url: DEFAULT_MASTER_URL.to_string(),
            principal: None,
            secret: None,
        }
    }
}

impl MasterConfig {
    pub fn endpoint(&self) -> MasterEndpoint {
        MasterEndpoint {
            url: self.url.clone(),
            principal: self.principal.clone(),
            secret: self.secret.clone(),
        }
    }
}

impl TrackerConfig {
    pub fn from_path(path: &str) -> Result<TrackerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<TrackerConfig> {
        let config: TrackerConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if reqwest::Url::parse(&self.master.url).is_err() {
            return Err(anyhow::anyhow!(
                "invalid master url: {}",
                self.master.url
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint. Defaults to the
    // OTEL_EXPORTER_OTLP_ENDPOINT env var handling of the exporter.
    #[serde(default)]
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde")]
    #[serde_inline_default(Duration::from_secs(10))]
    pub metrics_interval: Duration,
    // Instance ID for this tracker instance, used as a metric attribute.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

// Serde module for Duration serialization/deserialization
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::TrackerConfig;

    #[test]
    pub fn should_parse_sample_config() {
        let config_yaml = include_str!("../sample_config.yaml");
        let config = TrackerConfig::from_yaml_str(config_yaml).expect("unable to parse from yaml");

        assert_eq!("local", config.env);
        assert_eq!("http://10.0.4.1:5050", config.master.url);
        assert_eq!(100, config.retry_delay_ms);
    }

    #[test]
    pub fn rejects_a_bad_master_url() {
        let config = TrackerConfig {
            master: super::MasterConfig {
                url: "not a url".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
