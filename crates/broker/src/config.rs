use std::fmt;

/// Default AMQP port.
const DEFAULT_PORT: u16 = 5672;

/// Default virtual host.
const DEFAULT_VHOST: &str = "/";

/// Username/password pair for broker authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Broker connection parameters.
///
/// Passed explicitly into [`Connector::open`](crate::Connector::open);
/// nothing in the transport layer reads process state on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub credentials: Credentials,
}

impl BrokerConfig {
    /// Config for `host` on the default port and virtual host.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            virtual_host: DEFAULT_VHOST.to_string(),
            credentials,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                 | Default |
    /// |-------------------------|---------|
    /// | `HPC_RABBITMQ_HOST`     | --      |
    /// | `HPC_RABBITMQ_USER`     | --      |
    /// | `HPC_RABBITMQ_PASSWORD` | --      |
    /// | `HPC_RABBITMQ_PORT`     | `5672`  |
    /// | `HPC_RABBITMQ_VHOST`    | `/`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary
    /// key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));

        let host = required("HPC_RABBITMQ_HOST")?;
        let username = required("HPC_RABBITMQ_USER")?;
        let password = required("HPC_RABBITMQ_PASSWORD")?;

        let port = match lookup("HPC_RABBITMQ_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "HPC_RABBITMQ_PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        let virtual_host =
            lookup("HPC_RABBITMQ_VHOST").unwrap_or_else(|| DEFAULT_VHOST.to_string());

        Ok(Self {
            host,
            port,
            virtual_host,
            credentials: Credentials::new(username, password),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn required_values_with_defaults() {
        let config = BrokerConfig::from_lookup(lookup_from(&[
            ("HPC_RABBITMQ_HOST", "mq.example.org"),
            ("HPC_RABBITMQ_USER", "rodan"),
            ("HPC_RABBITMQ_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.host, "mq.example.org");
        assert_eq!(config.port, 5672);
        assert_eq!(config.virtual_host, "/");
        assert_eq!(config.credentials, Credentials::new("rodan", "secret"));
    }

    #[test]
    fn optional_overrides_are_applied() {
        let config = BrokerConfig::from_lookup(lookup_from(&[
            ("HPC_RABBITMQ_HOST", "mq"),
            ("HPC_RABBITMQ_USER", "u"),
            ("HPC_RABBITMQ_PASSWORD", "p"),
            ("HPC_RABBITMQ_PORT", "5673"),
            ("HPC_RABBITMQ_VHOST", "training"),
        ]))
        .unwrap();

        assert_eq!(config.port, 5673);
        assert_eq!(config.virtual_host, "training");
    }

    #[test]
    fn missing_password_is_reported_by_name() {
        let result = BrokerConfig::from_lookup(lookup_from(&[
            ("HPC_RABBITMQ_HOST", "mq"),
            ("HPC_RABBITMQ_USER", "u"),
        ]));

        assert_matches!(result, Err(ConfigError::Missing("HPC_RABBITMQ_PASSWORD")));
    }

    #[test]
    fn non_numeric_port_is_invalid() {
        let result = BrokerConfig::from_lookup(lookup_from(&[
            ("HPC_RABBITMQ_HOST", "mq"),
            ("HPC_RABBITMQ_USER", "u"),
            ("HPC_RABBITMQ_PASSWORD", "p"),
            ("HPC_RABBITMQ_PORT", "amqp"),
        ]));

        assert_matches!(result, Err(ConfigError::Invalid { key: "HPC_RABBITMQ_PORT", .. }));
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", Credentials::new("rodan", "hunter2"));
        assert!(rendered.contains("rodan"));
        assert!(!rendered.contains("hunter2"));
    }
}
