//! Node configuration

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use arbor_core::{ArborError, ArborResult};

/// Default TCP port a node listens on
pub const DEFAULT_PORT: u16 = 3780;

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// A server to dial at start, parsed from `host:port:lag`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePeer {
    pub host: String,
    pub port: u16,
    /// Simulated lag of the link in milliseconds
    pub lag: u64,
}

impl RemotePeer {
    /// `host:port` form suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for RemotePeer {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(lag), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ArborError::InvalidConfig(format!(
                "remote '{}' is not in host:port:lag form",
                s
            )));
        };

        if host.is_empty() {
            return Err(ArborError::InvalidConfig(format!("remote '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ArborError::InvalidConfig(format!("bad port in '{}': {}", s, e)))?;
        let lag = lag
            .parse::<u64>()
            .map_err(|e| ArborError::InvalidConfig(format!("bad lag in '{}': {}", s, e)))?;

        Ok(RemotePeer {
            host: host.to_string(),
            port,
            lag,
        })
    }
}

impl fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.lag)
    }
}

/// Engine configuration
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Lower bound of every edge weight this node records
    pub lag_floor: u64,
}

/// Arbor node configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Address to accept connections on
    pub listen_addr: SocketAddr,
    /// This node's own simulated lag in milliseconds
    pub lag_floor_ms: u64,
    /// Servers to dial at start
    pub remotes: Vec<RemotePeer>,
    /// Inject a local wake-up once handshakes had time to settle
    pub wake_on_start: bool,
    pub wake_delay: Duration,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            lag_floor_ms: 0,
            remotes: Vec::new(),
            wake_on_start: false,
            wake_delay: Duration::from_secs(2),
            log_format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lag_floor: self.lag_floor_ms,
        }
    }

    /// Lag used for sends on an accepted connection
    pub fn local_lag(&self) -> Duration {
        Duration::from_millis(self.lag_floor_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_peer_parse() {
        let remote: RemotePeer = "10.0.0.7:3781:150".parse().unwrap();
        assert_eq!(remote.host, "10.0.0.7");
        assert_eq!(remote.port, 3781);
        assert_eq!(remote.lag, 150);
        assert_eq!(remote.address(), "10.0.0.7:3781");
        assert_eq!(remote.to_string(), "10.0.0.7:3781:150");
    }

    #[test]
    fn test_remote_peer_rejects_malformed() {
        for bad in ["localhost:3781", ":3781:10", "host:port:10", "host:3781:-1", ""] {
            assert!(
                matches!(bad.parse::<RemotePeer>(), Err(ArborError::InvalidConfig(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert!(config.remotes.is_empty());
        assert_eq!(config.engine_config().lag_floor, 0);
        assert_eq!(config.local_lag(), Duration::ZERO);
    }
}
