use std::{fmt, time::Duration};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl Default for NodeAddress {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    pub username: Option<String>,
    pub password: String,
}

// Keeps passwords out of debug logs.
impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

/// What happens to requests already written when the socket drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InflightPolicy {
    /// Fail them with a connection error.
    #[default]
    FailPending,
    /// Write them again on the new connection once it is up.
    Replay,
}

/// Exponential backoff parameters for (re)connecting: the n-th wait is
/// `factor * exponent_base^n` milliseconds, jittered, for at most
/// `number_of_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRetryStrategy {
    pub exponent_base: u32,
    pub factor: u32,
    pub number_of_retries: u32,
}

/// Immutable client configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub addresses: Vec<NodeAddress>,
    pub credentials: Option<ServerCredentials>,
    pub client_name: Option<String>,
    pub database_id: u32,
    pub protocol: ProtocolVersion,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub retry_strategy: Option<ConnectionRetryStrategy>,
    pub inflight_policy: InflightPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            credentials: None,
            client_name: None,
            database_id: 0,
            protocol: ProtocolVersion::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            retry_strategy: None,
            inflight_policy: InflightPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.addresses.push(NodeAddress {
            host: host.into(),
            port,
        });
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(ServerCredentials {
            username,
            password: password.into(),
        });
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_database_id(mut self, db: u32) -> Self {
        self.database_id = db;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: ConnectionRetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_inflight_policy(mut self, policy: InflightPolicy) -> Self {
        self.inflight_policy = policy;
        self
    }

    /// The configured addresses, or localhost:6379 when none were given.
    pub fn nodes(&self) -> Vec<NodeAddress> {
        if self.addresses.is_empty() {
            vec![NodeAddress::default()]
        } else {
            self.addresses.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.nodes(), vec![NodeAddress::default()]);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.protocol, ProtocolVersion::Resp2);
        assert_eq!(config.inflight_policy, InflightPolicy::FailPending);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new()
            .with_address("10.0.0.1", 7000)
            .with_client_name("TEST_CLIENT_NAME")
            .with_database_id(2)
            .with_credentials(None, "secret");
        assert_eq!(config.nodes()[0].to_string(), "10.0.0.1:7000");
        assert_eq!(config.client_name.as_deref(), Some("TEST_CLIENT_NAME"));
        assert_eq!(config.database_id, 2);
        assert!(!format!("{:?}", config.credentials).contains("secret"));
    }
}
