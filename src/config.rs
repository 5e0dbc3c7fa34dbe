//! Peer configuration.
//!
//! [`PeerConfig`] collects every knob a peer recognizes. `Peer::new`
//! validates it via [`PeerConfig::check`]; an invalid configuration fails
//! peer construction, never a later operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Network the peer listens and dials on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// TCP, both address families.
    #[default]
    Tcp,
    /// TCP, IPv4 addresses only.
    Tcp4,
    /// TCP, IPv6 addresses only.
    Tcp6,
    /// Unix domain stream socket.
    Unix,
    /// Accepted for compatibility; tokio has no SOCK_SEQPACKET support, so
    /// this binds a stream Unix socket.
    Unixpacket,
}

impl Network {
    /// Parse the configuration string form. Empty means [`Network::Tcp`].
    pub fn parse(s: &str) -> Result<Network> {
        match s {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::Unixpacket),
            other => Err(Error::Config(format!(
                "invalid network {:?}, expected one of: tcp, tcp4, tcp6, unix, unixpacket",
                other
            ))),
        }
    }

    /// Whether this network dials and binds Unix socket paths.
    #[inline]
    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix | Network::Unixpacket)
    }
}

/// Peer configuration.
///
/// All fields have zero-value defaults; `Duration::ZERO` means "disabled"
/// for every duration knob, mirroring the "less than or equal to zero"
/// convention of the config surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Network kind: tcp, tcp4, tcp6, unix or unixpacket. Empty string in
    /// serialized form defaults to tcp.
    pub network: Network,
    /// Listen address for the server role; empty means no listener.
    pub listen_address: String,
    /// Maximum duration for dialing; zero disables the timeout.
    pub default_dial_timeout: Duration,
    /// Maximum redial attempts after an unexpected disconnect; client role.
    pub redial_times: u32,
    /// Default body codec name; empty defaults to "json".
    pub default_body_codec: String,
    /// Session max age; zero disables.
    pub default_session_age: Duration,
    /// Default PULL deadline; zero disables.
    pub default_context_age: Duration,
    /// Slow operation alarm threshold; zero disables.
    pub slow_comet_duration: Duration,
    /// Include a truncated body rendering in operation logs.
    pub print_body: bool,
    /// Measure and log per-operation cost.
    pub count_time: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            listen_address: String::new(),
            default_dial_timeout: Duration::ZERO,
            redial_times: 0,
            default_body_codec: String::new(),
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            slow_comet_duration: Duration::ZERO,
            print_body: false,
            count_time: false,
        }
    }
}

impl PeerConfig {
    /// Validate the configuration and fill defaults.
    ///
    /// Defaults the body codec to "json" when empty. Called by `Peer::new`.
    pub fn check(&mut self) -> Result<()> {
        if self.default_body_codec.is_empty() {
            self.default_body_codec = "json".to_string();
        }
        if crate::codec::BodyCodec::from_name(&self.default_body_codec).is_none() {
            return Err(Error::Config(format!(
                "unknown default_body_codec {:?}",
                self.default_body_codec
            )));
        }
        if self.network.is_unix() && !self.listen_address.is_empty() {
            // A unix listen address is a filesystem path; reject the
            // host:port shapes that only make sense for tcp.
            if self.listen_address.contains("//") {
                return Err(Error::Config(format!(
                    "invalid unix listen_address {:?}",
                    self.listen_address
                )));
            }
        }
        Ok(())
    }

    /// Effective slow-operation threshold; `None` when disabled.
    pub fn slow_comet(&self) -> Option<Duration> {
        if self.slow_comet_duration > Duration::ZERO {
            Some(self.slow_comet_duration)
        } else {
            None
        }
    }

    /// Effective default pull deadline; `None` when disabled.
    pub fn context_age(&self) -> Option<Duration> {
        if self.default_context_age > Duration::ZERO {
            Some(self.default_context_age)
        } else {
            None
        }
    }

    /// Effective session max age; `None` when disabled.
    pub fn session_age(&self) -> Option<Duration> {
        if self.default_session_age > Duration::ZERO {
            Some(self.default_session_age)
        } else {
            None
        }
    }

    /// Effective dial timeout; `None` when disabled.
    pub fn dial_timeout(&self) -> Option<Duration> {
        if self.default_dial_timeout > Duration::ZERO {
            Some(self.default_dial_timeout)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_checks() {
        let mut cfg = PeerConfig::default();
        cfg.check().unwrap();
        assert_eq!(cfg.network, Network::Tcp);
        assert_eq!(cfg.default_body_codec, "json");
    }

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("").unwrap(), Network::Tcp);
        assert_eq!(Network::parse("tcp").unwrap(), Network::Tcp);
        assert_eq!(Network::parse("tcp4").unwrap(), Network::Tcp4);
        assert_eq!(Network::parse("tcp6").unwrap(), Network::Tcp6);
        assert_eq!(Network::parse("unix").unwrap(), Network::Unix);
        assert_eq!(Network::parse("unixpacket").unwrap(), Network::Unixpacket);
        assert!(Network::parse("udp").is_err());
    }

    #[test]
    fn test_unknown_body_codec_rejected() {
        let mut cfg = PeerConfig {
            default_body_codec: "protobuf".to_string(),
            ..Default::default()
        };
        let err = cfg.check().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_disabled_durations_are_none() {
        let cfg = PeerConfig::default();
        assert!(cfg.slow_comet().is_none());
        assert!(cfg.context_age().is_none());
        assert!(cfg.session_age().is_none());
        assert!(cfg.dial_timeout().is_none());
    }

    #[test]
    fn test_enabled_durations() {
        let cfg = PeerConfig {
            default_context_age: Duration::from_millis(50),
            default_session_age: Duration::from_secs(60),
            default_dial_timeout: Duration::from_secs(3),
            slow_comet_duration: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(cfg.context_age(), Some(Duration::from_millis(50)));
        assert_eq!(cfg.session_age(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.dial_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(cfg.slow_comet(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = PeerConfig {
            network: Network::Tcp4,
            listen_address: "127.0.0.1:9090".to_string(),
            redial_times: 3,
            count_time: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PeerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.network, Network::Tcp4);
        assert_eq!(back.listen_address, "127.0.0.1:9090");
        assert_eq!(back.redial_times, 3);
        assert!(back.count_time);
    }
}
