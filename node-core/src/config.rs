//! Compile-time node configuration.
//!
//! Nothing here is read at runtime. Secrets come from the build environment
//! through [`NodeConfig::from_build_env`] so they never land in the tree.

use core::{fmt, time::Duration};

/// Station credentials for the access point.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WifiCredentials {
    pub ssid: &'static str,
    pub password: &'static str,
}

/// Telemetry broker endpoint and device identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BrokerConfig {
    pub host: &'static str,
    pub port: u16,
    pub telemetry_topic: &'static str,
    /// Declared for completeness; nothing consumes attribute pushes yet.
    pub attributes_topic: &'static str,
    pub client_id: &'static str,
    /// Device access token, sent as the session user name.
    pub access_token: &'static str,
    /// PEM root certificate the broker chain must verify against.
    pub root_ca: &'static str,
    pub keep_alive_secs: u16,
}

/// Push-update endpoint settings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpdateConfig {
    /// Advertised as `<hostname>.local`.
    pub hostname: &'static str,
    pub password: &'static str,
    pub port: u16,
}

/// Fixed delays that shape a wake cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CycleTiming {
    pub sleep: Duration,
    pub idle: Duration,
    pub association_poll: Duration,
    pub station_settle: Duration,
    pub session_backoff: Duration,
    pub shutdown_grace: Duration,
    pub button_poll: Duration,
}

impl CycleTiming {
    pub const DEFAULT: Self = Self {
        sleep: Duration::from_secs(30),
        idle: Duration::from_millis(100),
        association_poll: Duration::from_millis(500),
        station_settle: Duration::from_millis(100),
        session_backoff: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(100),
        button_poll: Duration::from_millis(100),
    };
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Full node configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeConfig {
    pub wifi: WifiCredentials,
    pub broker: BrokerConfig,
    pub update: UpdateConfig,
    pub timing: CycleTiming,
}

impl NodeConfig {
    pub const DEFAULT: Self = Self {
        wifi: WifiCredentials {
            ssid: "",
            password: "",
        },
        broker: BrokerConfig {
            host: "srv-iot.diatel.upm.es",
            port: 8883,
            telemetry_topic: "v1/devices/me/telemetry",
            attributes_topic: "v1/devices/me/attributes",
            client_id: "soil-quality-sensor",
            access_token: "",
            root_ca: "",
            keep_alive_secs: 15,
        },
        update: UpdateConfig {
            hostname: "soil-quality-sensor",
            password: "pw0123",
            port: 3232,
        },
        timing: CycleTiming::DEFAULT,
    };

    /// Defaults with secrets taken from `NODE_*` build variables when set.
    #[must_use]
    pub const fn from_build_env() -> Self {
        let mut config = Self::DEFAULT;
        config.wifi.ssid = env_or(option_env!("NODE_WIFI_SSID"), config.wifi.ssid);
        config.wifi.password = env_or(option_env!("NODE_WIFI_PASSWORD"), config.wifi.password);
        config.broker.host = env_or(option_env!("NODE_BROKER_HOST"), config.broker.host);
        config.broker.access_token =
            env_or(option_env!("NODE_ACCESS_TOKEN"), config.broker.access_token);
        config.broker.root_ca = env_or(option_env!("NODE_BROKER_ROOT_CA"), config.broker.root_ca);
        config.update.password =
            env_or(option_env!("NODE_UPDATE_PASSWORD"), config.update.password);
        config
    }

    /// Rejects settings that would leave the node unable to ever report.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidBrokerPort);
        }
        if self.broker.telemetry_topic.is_empty() {
            return Err(ConfigError::MissingTopic);
        }
        if !is_pem_certificate(self.broker.root_ca) {
            return Err(ConfigError::MissingRootCa);
        }
        if self.timing.sleep.is_zero() {
            return Err(ConfigError::ZeroSleep);
        }
        if self.timing.session_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff);
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn is_pem_certificate(text: &str) -> bool {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let text = text.trim();
    text.starts_with(BEGIN) && text.ends_with(END) && text.len() > BEGIN.len() + END.len()
}

const fn env_or(value: Option<&'static str>, fallback: &'static str) -> &'static str {
    match value {
        Some(value) => value,
        None => fallback,
    }
}

/// Configuration problems caught before any task starts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    MissingSsid,
    MissingBrokerHost,
    InvalidBrokerPort,
    MissingTopic,
    MissingRootCa,
    ZeroSleep,
    ZeroBackoff,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfigError::MissingSsid => "wifi ssid is empty (set NODE_WIFI_SSID)",
            ConfigError::MissingBrokerHost => "broker host is empty",
            ConfigError::InvalidBrokerPort => "broker port must be non-zero",
            ConfigError::MissingTopic => "telemetry topic is empty",
            ConfigError::MissingRootCa => {
                "broker root certificate is not PEM (set NODE_BROKER_ROOT_CA)"
            }
            ConfigError::ZeroSleep => "sleep duration must be non-zero",
            ConfigError::ZeroBackoff => "session backoff must be non-zero",
        };
        f.write_str(text)
    }
}
