//! Configuration types for connections and servers

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long `call` waits for the correlated reply
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Capacity of the inbound message broadcast; slow subscribers lag
    pub event_capacity: usize,
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Applied to every accepted or attached connection
    pub connection: ConnectionConfig,

    /// Capacity of the client connected/disconnected event broadcast
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            event_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl ServerConfig {
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

// Helper module for Duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.connection.request_timeout, Duration::from_secs(5));
        assert_eq!(config.connection.event_capacity, 256);
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default().with_connection(
            ConnectionConfig::default().with_request_timeout(Duration::from_millis(1500)),
        );
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connection"]["request_timeout"], 1500);

        let deserialized: ServerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ConnectionConfig = serde_json::from_str(r#"{"request_timeout": 250}"#).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_oversized_timeout_saturates() {
        let config = ConnectionConfig::default().with_request_timeout(Duration::MAX);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], u64::MAX);
    }

    #[test]
    fn test_capacity_is_never_zero() {
        let config = ConnectionConfig::default().with_event_capacity(0);
        assert_eq!(config.event_capacity, 1);
    }
}
