use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Codec;
use crate::errors::ConfigError;

/// Environment variable holding the YAML configuration when no file is given.
pub const CONFIG_ENV_VAR: &str = "COLLECTOR_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    pub kafka: ConsumerProperties,
    pub run: RunConfig,
}

/// Connection properties handed to the consumer client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConsumerProperties {
    pub bootstrap_servers: String,
    /// Fresh for every properties instance unless set explicitly.
    #[serde(default = "fresh_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
    #[serde(default = "default_key_codec")]
    pub key_codec: Codec,
    #[serde(default = "default_value_codec")]
    pub value_codec: Codec,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub max_poll_records: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub topic: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    pub max_polls: Option<u64>,
}

fn fresh_group_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_key_codec() -> Codec {
    Codec::Integer
}

fn default_value_codec() -> Codec {
    Codec::String
}

fn default_poll_timeout_secs() -> u64 {
    5
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl ConsumerProperties {
    /// Builds the properties for `brokers` (comma separated). No I/O happens here.
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: brokers.into(),
            group_id: fresh_group_id(),
            auto_offset_reset: OffsetReset::Earliest,
            key_codec: default_key_codec(),
            value_codec: default_value_codec(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            session_timeout_ms: None,
            max_poll_records: None,
        }
    }

    pub fn bootstrap_servers(&self) -> impl Iterator<Item = &str> {
        self.bootstrap_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The recognized options under their consumer property names.
    pub fn as_map(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        map.insert("bootstrap.servers", self.bootstrap_servers.clone());
        map.insert("group.id", self.group_id.clone());
        map.insert("auto.offset.reset", self.auto_offset_reset.as_str().to_string());
        map.insert(
            "key.deserializer",
            self.key_codec.deserializer_name().to_string(),
        );
        map.insert(
            "value.deserializer",
            self.value_codec.deserializer_name().to_string(),
        );

        if let Some(timeout) = self.session_timeout_ms {
            map.insert("session.timeout.ms", timeout.to_string());
        }
        if let Some(max) = self.max_poll_records {
            map.insert("max.poll.records", max.to_string());
        }
        map
    }

    /// librdkafka configuration for these properties.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", self.auto_offset_reset.as_str());

        if let Some(timeout) = self.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(security_protocol) = &self.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &self.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &self.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &self.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &self.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        client_config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers().next().is_none() {
            return Err(ConfigError::MissingField {
                field: "bootstrap_servers".to_string(),
            });
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::MissingField {
                field: "group_id".to_string(),
            });
        }
        if self.max_poll_records == Some(0) {
            return Err(ConfigError::ValidationFailed {
                reason: "max_poll_records must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl RunConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<CollectorConfig> {
    let config = match config_path {
        Some(path) => CollectorConfig::from_file(path),
        None => CollectorConfig::from_env(),
    }?;
    config
        .validate()
        .context("Collector configuration is invalid")?;
    Ok(config)
}

impl CollectorConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|e| ConfigError::LoadFailed {
            origin: CONFIG_ENV_VAR.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;

        if self.run.topic.is_empty() {
            return Err(ConfigError::MissingField {
                field: "run.topic".to_string(),
            });
        }
        if self.run.poll_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "poll_timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
kafka:
  bootstrap_servers: "localhost:9092, localhost:9093"
  security_protocol: SASL_SSL
  sasl_mechanisms: PLAIN
  max_poll_records: 50
run:
  topic: financial-transactions
  max_polls: 10
"#;

    #[test]
    fn test_parse_config_with_defaults() {
        let config = CollectorConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.run.topic, "financial-transactions");
        assert_eq!(config.run.poll_timeout(), Duration::from_secs(5));
        assert_eq!(config.run.max_polls, Some(10));
        assert_eq!(config.kafka.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(config.kafka.key_codec, Codec::Integer);
        assert_eq!(config.kafka.value_codec, Codec::String);
        assert!(Uuid::parse_str(&config.kafka.group_id).is_ok());
        assert_eq!(
            config.kafka.bootstrap_servers().collect::<Vec<_>>(),
            vec!["localhost:9092", "localhost:9093"]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_group_id_is_fresh_per_instance() {
        let a = ConsumerProperties::new("localhost:9092");
        let b = ConsumerProperties::new("localhost:9092");
        assert_ne!(a.group_id, b.group_id);
    }

    #[test]
    fn test_recognized_options() {
        let props = ConsumerProperties::new("broker:9092");
        let map = props.as_map();

        assert_eq!(map["bootstrap.servers"], "broker:9092");
        assert_eq!(map["group.id"], props.group_id);
        assert_eq!(map["auto.offset.reset"], "earliest");
        assert_eq!(map["key.deserializer"], "integer");
        assert_eq!(map["value.deserializer"], "string");
        assert!(!map.contains_key("max.poll.records"));

        let client_config = props.to_client_config();
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = CollectorConfig::from_yaml(SAMPLE).unwrap();
        config.run.poll_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));

        let mut config = CollectorConfig::from_yaml(SAMPLE).unwrap();
        config.kafka.bootstrap_servers = " , ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { field }) if field == "bootstrap_servers"
        ));

        let mut config = CollectorConfig::from_yaml(SAMPLE).unwrap();
        config.run.topic.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CollectorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.kafka.max_poll_records, Some(50));

        assert!(matches!(
            CollectorConfig::from_file("/definitely/missing.yaml"),
            Err(ConfigError::LoadFailed { .. })
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            CollectorConfig::from_yaml("kafka: ["),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
