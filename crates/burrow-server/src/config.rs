//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command-line flags
//! 2. Environment variables (BURROW_*)
//! 3. Config file (server.toml)
//! 4. Default values

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use uuid::Uuid;

use crate::correlator::WaitPolicy;
use crate::http_plane::ServeLimits;
use crate::mqtt::MqttSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

/// Port assumed when the broker address has none
const DEFAULT_MQTT_PORT: u16 = 1883;

/// How long startup waits for the broker to accept the connection
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration (parsed from TOML, can be overridden by env and flags)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// The IP or host name to listen upon
    #[serde(alias = "host")]
    pub bind_host: Option<String>,

    /// The port to listen upon
    #[serde(alias = "port")]
    pub bind_port: Option<u16>,

    /// MQTT broker address (tcp://host:port, mqtt://host:port or host[:port])
    pub broker: Option<String>,

    /// MQTT client identifier (random when unset)
    pub mqtt_client_id: Option<String>,

    /// MQTT keep-alive interval in seconds
    pub mqtt_keep_alive_secs: Option<u64>,

    /// How long to wait for a tunnel client to reply
    pub reply_timeout_secs: Option<u64>,

    /// Interval between progress log lines while waiting
    pub poll_interval_secs: Option<u64>,

    /// Ignore replies that do not echo the request id
    pub require_request_id: Option<bool>,

    /// Time a caller gets to send a complete request head
    pub header_read_timeout_secs: Option<u64>,

    /// Maximum lifetime of one caller connection
    pub connection_timeout_secs: Option<u64>,
}

/// Values given on the command line, taking priority over everything else
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
    pub broker: Option<String>,
}

/// Broker location parsed from a configured address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// Fully resolved server configuration
#[derive(Debug)]
pub struct ResolvedServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub broker: BrokerAddress,
    pub mqtt_client_id: String,
    pub mqtt_keep_alive: Duration,
    pub wait_policy: WaitPolicy,
    pub serve_limits: ServeLimits,
}

impl ResolvedServerConfig {
    /// Settings for connecting the MQTT bus
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: self.mqtt_client_id.clone(),
            keep_alive: self.mqtt_keep_alive,
            connect_timeout: BROKER_CONNECT_TIMEOUT,
        }
    }

    /// Resolve the listen address, looking up host names
    pub async fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.bind_host.as_str(), self.bind_port))
            .await
            .with_context(|| format!("Failed to resolve bind host {}", self.bind_host))?
            .next()
            .with_context(|| format!("Bind host {} has no addresses", self.bind_host))
    }
}

impl BrokerAddress {
    /// Parse `tcp://host:port`, `mqtt://host:port` or a bare `host[:port]`
    pub fn parse(address: &str) -> anyhow::Result<Self> {
        let trimmed = address.trim();
        let rest = match trimmed.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => bail!("Unsupported broker scheme '{}' in {}", scheme, address),
            None => trimmed,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(']') || host.starts_with('[') => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid broker port in {}", address))?;
                (host, port)
            }
            _ => (rest, DEFAULT_MQTT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.is_empty() {
            bail!("Broker address {} has no host", address);
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Source of raw environment values, keyed without the prefix
type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable parsed as `T`; a value that does not parse is an error
fn get_env_parsed<T>(env: EnvLookup<'_>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(name)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}_{}: {:?}", ENV_PREFIX, name, v))
        })
        .transpose()
}

/// Get environment variable as bool (true/false, 1/0, yes/no)
fn get_env_bool(env: EnvLookup<'_>, name: &str) -> anyhow::Result<Option<bool>> {
    env(name)
        .map(|v| {
            parse_bool(&v).with_context(|| format!("Invalid {}_{}: {:?}", ENV_PREFIX, name, v))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Reject a zero duration for `key`
fn non_zero(key: &str, secs: u64) -> anyhow::Result<Duration> {
    if secs == 0 {
        bail!("{} must be at least 1", key);
    }
    Ok(Duration::from_secs(secs))
}

impl ServerConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults; a file that cannot be read or
    /// parsed is an error.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::debug!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let config = toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve configuration from flags, then environment, then config file
    pub fn resolve(self, overrides: &Overrides) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(overrides, &get_env)
    }

    fn resolve_with(
        self,
        overrides: &Overrides,
        env: EnvLookup<'_>,
    ) -> anyhow::Result<ResolvedServerConfig> {
        // Bind host: flag > ENV > config > default 127.0.0.1
        let bind_host = overrides
            .bind_host
            .clone()
            .or_else(|| env("BIND_HOST"))
            .or(self.bind_host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        if bind_host.trim().is_empty() {
            bail!("bind_host must not be empty");
        }

        // Bind port: flag > ENV > config > default 8080
        let bind_port = match overrides.bind_port {
            Some(port) => port,
            None => get_env_parsed(env, "BIND_PORT")?
                .or(self.bind_port)
                .unwrap_or(8080),
        };

        // Broker: flag > ENV > config > default tcp://localhost:1883
        let broker_source = overrides
            .broker
            .clone()
            .or_else(|| env("BROKER"))
            .or(self.broker)
            .unwrap_or_else(|| "tcp://localhost:1883".to_string());
        let broker = BrokerAddress::parse(&broker_source)?;

        let mqtt_client_id = env("MQTT_CLIENT_ID")
            .or(self.mqtt_client_id)
            .unwrap_or_else(|| format!("burrow-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let mqtt_keep_alive = non_zero(
            "mqtt_keep_alive_secs",
            get_env_parsed(env, "MQTT_KEEP_ALIVE_SECS")?
                .or(self.mqtt_keep_alive_secs)
                .unwrap_or(30),
        )?;

        let reply_timeout = non_zero(
            "reply_timeout_secs",
            get_env_parsed(env, "REPLY_TIMEOUT_SECS")?
                .or(self.reply_timeout_secs)
                .unwrap_or(10),
        )?;

        let poll_interval = non_zero(
            "poll_interval_secs",
            get_env_parsed(env, "POLL_INTERVAL_SECS")?
                .or(self.poll_interval_secs)
                .unwrap_or(1),
        )?;

        let require_request_id = get_env_bool(env, "REQUIRE_REQUEST_ID")?
            .or(self.require_request_id)
            .unwrap_or(false);

        let defaults = ServeLimits::default();
        let header_read_timeout = non_zero(
            "header_read_timeout_secs",
            get_env_parsed(env, "HEADER_READ_TIMEOUT_SECS")?
                .or(self.header_read_timeout_secs)
                .unwrap_or(defaults.header_read_timeout.as_secs()),
        )?;

        let connection_timeout = non_zero(
            "connection_timeout_secs",
            get_env_parsed(env, "CONNECTION_TIMEOUT_SECS")?
                .or(self.connection_timeout_secs)
                .unwrap_or(defaults.connection_timeout.as_secs()),
        )?;
        if connection_timeout <= reply_timeout {
            bail!(
                "connection_timeout_secs ({}) must exceed reply_timeout_secs ({})",
                connection_timeout.as_secs(),
                reply_timeout.as_secs()
            );
        }

        Ok(ResolvedServerConfig {
            bind_host,
            bind_port,
            broker,
            mqtt_client_id,
            mqtt_keep_alive,
            wait_policy: WaitPolicy {
                reply_timeout,
                poll_interval,
                require_request_id,
            },
            serve_limits: ServeLimits {
                header_read_timeout,
                connection_timeout,
            },
        })
    }

    /// Load config file and resolve with environment and flag overrides
    pub fn load_and_resolve(
        path: &str,
        overrides: &Overrides,
    ) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path)?.resolve(overrides)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "BURROW");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.bind_host.is_none());
        assert!(config.bind_port.is_none());
        assert!(config.broker.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            host = "0.0.0.0"
            port = 9000
            broker = "mqtt://broker.internal:1884"
            reply_timeout_secs = 5
            require_request_id = true
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.bind_port, Some(9000));
        assert_eq!(config.reply_timeout_secs, Some(5));
        assert_eq!(config.require_request_id, Some(true));
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_overrides_win_over_file() {
        let config = ServerConfig {
            bind_host: Some("10.0.0.1".to_string()),
            bind_port: Some(9000),
            broker: Some("tcp://file-broker:1883".to_string()),
            ..Default::default()
        };
        let overrides = Overrides {
            bind_host: Some("127.0.0.2".to_string()),
            bind_port: Some(9999),
            broker: Some("flag-broker:2883".to_string()),
        };

        let resolved = config.resolve_with(&overrides, &no_env).unwrap();
        assert_eq!(resolved.bind_host, "127.0.0.2");
        assert_eq!(resolved.bind_port, 9999);
        assert_eq!(
            resolved.broker,
            BrokerAddress {
                host: "flag-broker".to_string(),
                port: 2883,
            }
        );
    }

    #[test]
    fn test_env_wins_over_file() {
        let config = ServerConfig {
            bind_port: Some(9000),
            reply_timeout_secs: Some(5),
            ..Default::default()
        };
        let env = |name: &str| match name {
            "BIND_PORT" => Some("7000".to_string()),
            "REPLY_TIMEOUT_SECS" => Some(" 20 ".to_string()),
            "REQUIRE_REQUEST_ID" => Some("yes".to_string()),
            _ => None,
        };

        let resolved = config.resolve_with(&Overrides::default(), &env).unwrap();
        assert_eq!(resolved.bind_port, 7000);
        assert_eq!(resolved.wait_policy.reply_timeout, Duration::from_secs(20));
        assert!(resolved.wait_policy.require_request_id);
    }

    #[test]
    fn test_invalid_env_values_are_errors() {
        let cases = [
            ("BIND_PORT", "not-a-port"),
            ("REPLY_TIMEOUT_SECS", "ten"),
            ("POLL_INTERVAL_SECS", "-1"),
            ("MQTT_KEEP_ALIVE_SECS", "30s"),
            ("REQUIRE_REQUEST_ID", "maybe"),
            ("HEADER_READ_TIMEOUT_SECS", "soon"),
            ("CONNECTION_TIMEOUT_SECS", ""),
        ];

        for (key, value) in cases {
            let env = |name: &str| (name == key).then(|| value.to_string());
            let err = ServerConfig::default()
                .resolve_with(&Overrides::default(), &env)
                .unwrap_err();
            assert!(
                format!("{:#}", err).contains(&format!("BURROW_{}", key)),
                "{} = {:?} gave {:#}",
                key,
                value,
                err
            );
        }
    }

    #[test]
    fn test_flag_port_skips_env_port() {
        let env = |name: &str| (name == "BIND_PORT").then(|| "not-a-port".to_string());
        let overrides = Overrides {
            bind_port: Some(9999),
            ..Default::default()
        };
        let resolved = ServerConfig::default().resolve_with(&overrides, &env).unwrap();
        assert_eq!(resolved.bind_port, 9999);
    }

    #[test]
    fn test_serve_limits() {
        let resolved = ServerConfig::default()
            .resolve_with(&Overrides::default(), &no_env)
            .unwrap();
        assert_eq!(resolved.serve_limits.header_read_timeout, Duration::from_secs(300));
        assert_eq!(resolved.serve_limits.connection_timeout, Duration::from_secs(600));

        let config = ServerConfig {
            header_read_timeout_secs: Some(3),
            connection_timeout_secs: Some(30),
            ..Default::default()
        };
        let resolved = config.resolve_with(&Overrides::default(), &no_env).unwrap();
        assert_eq!(resolved.serve_limits.header_read_timeout, Duration::from_secs(3));
        assert_eq!(resolved.serve_limits.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_timeouts() {
        let zero_header = ServerConfig {
            header_read_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(zero_header.resolve_with(&Overrides::default(), &no_env).is_err());

        let connection_shorter_than_reply = ServerConfig {
            reply_timeout_secs: Some(60),
            connection_timeout_secs: Some(60),
            ..Default::default()
        };
        let err = connection_shorter_than_reply
            .resolve_with(&Overrides::default(), &no_env)
            .unwrap_err();
        assert!(err.to_string().contains("connection_timeout_secs"));
    }

    #[test]
    fn test_rejects_empty_bind_host() {
        let overrides = Overrides {
            bind_host: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(ServerConfig::default().resolve_with(&overrides, &no_env).is_err());
    }

    #[tokio::test]
    async fn test_bind_addr_resolves_host_names() {
        let overrides = Overrides {
            bind_host: Some("localhost".to_string()),
            bind_port: Some(8123),
            ..Default::default()
        };
        let resolved = ServerConfig::default().resolve_with(&overrides, &no_env).unwrap();

        let addr = resolved.bind_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8123);
    }

    #[tokio::test]
    async fn test_bind_addr_accepts_ip_literals() {
        let overrides = Overrides {
            bind_host: Some("0.0.0.0".to_string()),
            bind_port: Some(8080),
            ..Default::default()
        };
        let resolved = ServerConfig::default().resolve_with(&overrides, &no_env).unwrap();
        assert_eq!(resolved.bind_addr().await.unwrap(), "0.0.0.0:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_bind_addr_unknown_host_is_an_error() {
        let overrides = Overrides {
            bind_host: Some("no-such-host.invalid".to_string()),
            ..Default::default()
        };
        let resolved = ServerConfig::default().resolve_with(&overrides, &no_env).unwrap();
        assert!(resolved.bind_addr().await.is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");

        let config = ServerConfig::load(path.to_str().unwrap()).unwrap();
        assert!(config.bind_port.is_none());
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9100\nbroker = \"broker.internal\"").unwrap();

        let config = ServerConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.bind_port, Some(9100));
        assert_eq!(config.broker.as_deref(), Some("broker.internal"));
    }

    #[test]
    fn test_load_unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains(&path));
        assert!(ServerConfig::load_and_resolve(&path, &Overrides::default()).is_err());
    }

    #[test]
    fn test_parse_broker_address() {
        assert_eq!(
            BrokerAddress::parse("tcp://localhost:1883").unwrap(),
            BrokerAddress {
                host: "localhost".to_string(),
                port: 1883,
            }
        );
        assert_eq!(BrokerAddress::parse("mqtt://broker:8883/").unwrap().port, 8883);
        assert_eq!(BrokerAddress::parse("broker").unwrap().port, DEFAULT_MQTT_PORT);
        assert_eq!(BrokerAddress::parse("[::1]:1884").unwrap().host, "::1");
        assert_eq!(BrokerAddress::parse("[::1]").unwrap().port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn test_parse_broker_address_errors() {
        assert!(BrokerAddress::parse("ws://broker:80").is_err());
        assert!(BrokerAddress::parse("tcp://broker:notaport").is_err());
        assert!(BrokerAddress::parse("tcp://:1883").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
