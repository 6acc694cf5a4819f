use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{KafdeskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    /// Mechanism name as spelled in client configuration.
    pub fn as_config_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    /// Only populated in transit or after resolution; never persisted.
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslConfig")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "[REDACTED]" })
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub id: String,
    pub name: String,
    pub brokers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl: Option<SaslConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<TlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionConfig {
    /// Copy of this config safe to persist: the SASL password is blanked.
    pub fn without_secret(&self) -> Self {
        let mut copy = self.clone();
        if let Some(sasl) = copy.sasl.as_mut() {
            sasl.password.clear();
        }
        copy
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        if let (Some(sasl), Some(secret)) = (self.sasl.as_mut(), secret) {
            sasl.password = secret;
        }
        self
    }

    pub fn client_id_or_default(&self) -> String {
        self.client_id
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("kafdesk-{}", self.id))
    }

    pub fn tls_enabled(&self) -> bool {
        self.ssl.as_ref().map(|s| s.enabled).unwrap_or(false)
    }
}

/// Input of `createConnection` and `testConnection`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDraft {
    /// Set when testing an already stored connection.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub brokers: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub ssl: Option<TlsConfig>,
    #[serde(default)]
    pub connection_timeout: Option<u64>,
    #[serde(default)]
    pub request_timeout: Option<u64>,
}

impl ConnectionDraft {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_brokers(&self.brokers)?;
        validate_timeout("connectionTimeout", self.connection_timeout)?;
        validate_timeout("requestTimeout", self.request_timeout)?;
        if let Some(sasl) = &self.sasl {
            validate_sasl(sasl)?;
        }
        Ok(())
    }

    pub fn into_config(self, id: String, now: DateTime<Utc>) -> ConnectionConfig {
        ConnectionConfig {
            id,
            name: self.name,
            brokers: self.brokers,
            client_id: self.client_id,
            sasl: self.sasl,
            ssl: self.ssl,
            connection_timeout: self.connection_timeout,
            request_timeout: self.request_timeout,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. `None` leaves a field untouched; for the optional blocks
/// `Some(None)` clears them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub brokers: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub client_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub sasl: Option<Option<SaslConfig>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub ssl: Option<Option<TlsConfig>>,
    #[serde(default)]
    pub connection_timeout: Option<u64>,
    #[serde(default)]
    pub request_timeout: Option<u64>,
}

impl ConnectionPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(brokers) = &self.brokers {
            validate_brokers(brokers)?;
        }
        validate_timeout("connectionTimeout", self.connection_timeout)?;
        validate_timeout("requestTimeout", self.request_timeout)?;
        if let Some(Some(sasl)) = &self.sasl {
            validate_sasl(sasl)?;
        }
        Ok(())
    }

    /// Merges into `config`. Passwords are expected to be stripped beforehand.
    pub fn apply(self, config: &mut ConnectionConfig, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(brokers) = self.brokers {
            config.brokers = brokers;
        }
        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if let Some(sasl) = self.sasl {
            config.sasl = sasl;
        }
        if let Some(ssl) = self.ssl {
            config.ssl = ssl;
        }
        if let Some(timeout) = self.connection_timeout {
            config.connection_timeout = Some(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = Some(timeout);
        }
        config.updated_at = now;
    }
}

fn deserialize_some<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub response_time_ms: u64,
}

// ========================================
// VALIDATION
// ========================================

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(KafdeskError::Validation("Connection name must not be empty".to_string()));
    }
    Ok(())
}

pub fn validate_brokers(brokers: &[String]) -> Result<()> {
    if brokers.is_empty() {
        return Err(KafdeskError::Validation("At least one broker address is required".to_string()));
    }
    for broker in brokers {
        let (host, port) = broker
            .rsplit_once(':')
            .ok_or_else(|| KafdeskError::Validation(format!("Broker '{}' must be in host:port form", broker)))?;
        if host.trim().is_empty() {
            return Err(KafdeskError::Validation(format!("Broker '{}' has an empty host", broker)));
        }
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return Err(KafdeskError::Validation(format!("Broker '{}' has an invalid port", broker))),
        }
    }
    Ok(())
}

fn validate_timeout(field: &str, value: Option<u64>) -> Result<()> {
    if value == Some(0) {
        return Err(KafdeskError::Validation(format!("{} must be a positive number of milliseconds", field)));
    }
    Ok(())
}

fn validate_sasl(sasl: &SaslConfig) -> Result<()> {
    if sasl.username.trim().is_empty() {
        return Err(KafdeskError::Validation("SASL username must not be empty".to_string()));
    }
    Ok(())
}
