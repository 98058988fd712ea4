// Configuration shared by the server, the client and the command line.

use crate::session::default_timeout;
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest block size the server agrees to, whatever the peer asks for.
pub const DEFAULT_MAX_BLOCK_SIZE: u16 = 8192;

/// The well-known TFTP port.
pub const TFTP_PORT: u16 = 69;

/// Parameters every transfer starts from before option negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub max_block_size: u16,

    /// Retry schedule used when the peer does not negotiate a timeout.
    pub timeout: Vec<Duration>,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig { max_block_size: DEFAULT_MAX_BLOCK_SIZE, timeout: default_timeout() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,

    /// Directory requests are resolved against.
    pub root: PathBuf,

    /// Local ports transfer sockets are picked from.
    pub port_range: PortRange,

    pub allow_writes: bool,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    pub fn new(root: PathBuf) -> ServerConfig {
        ServerConfig {
            bind: (Ipv4Addr::UNSPECIFIED, TFTP_PORT).into(),
            root,
            port_range: PortRange::default(),
            allow_writes: false,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BadPortRange(String),
    BadTimeout(String),
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::BadPortRange(s) => {
                write!(f, "Invalid port range '{s}', expected LOW-HIGH with 0 < LOW <= HIGH")
            }
            ConfigError::BadTimeout(s) => {
                write!(f, "Invalid timeout schedule '{s}', expected comma separated seconds")
            }
        }
    }
}

/// An inclusive range of UDP ports, written `LOW-HIGH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }

    pub fn len(&self) -> usize {
        self.ports().len()
    }

    /// Only a range built by hand can be empty; parsing refuses `LOW > HIGH`.
    pub fn is_empty(&self) -> bool {
        self.ports().is_empty()
    }
}

impl Default for PortRange {
    fn default() -> PortRange {
        PortRange { low: 1024, high: 65535 }
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<PortRange, ConfigError> {
        let bad = || ConfigError::BadPortRange(s.to_string());
        let (low, high) = s.split_once('-').ok_or_else(bad)?;
        let low: u16 = low.trim().parse().map_err(|_| bad())?;
        let high: u16 = high.trim().parse().map_err(|_| bad())?;
        if low == 0 || low > high {
            return Err(bad());
        }
        Ok(PortRange { low, high })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// A retry schedule in whole seconds, written `1,3,7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSchedule(pub Vec<Duration>);

impl FromStr for TimeoutSchedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<TimeoutSchedule, ConfigError> {
        let schedule = s
            .split(',')
            .map(|part| match part.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                _ => Err(ConfigError::BadTimeout(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TimeoutSchedule(schedule))
    }
}

impl Default for TimeoutSchedule {
    fn default() -> TimeoutSchedule {
        TimeoutSchedule(default_timeout())
    }
}

impl fmt::Display for TimeoutSchedule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| d.as_secs().to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_parsing() {
        assert_eq!("2000-2010".parse::<PortRange>().unwrap(), PortRange { low: 2000, high: 2010 });
        assert_eq!("5000-5000".parse::<PortRange>().unwrap().len(), 1);
        assert!("2010-2000".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
        assert!("2000".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
        assert_eq!(PortRange::default().to_string(), "1024-65535");
    }

    #[test]
    fn test_port_range_len() {
        assert_eq!(PortRange::default().len(), 64512);
        assert!(!PortRange { low: 7, high: 7 }.is_empty());
        let inverted = PortRange { low: 2010, high: 2000 };
        assert!(inverted.is_empty());
        assert_eq!(inverted.len(), 0);
    }

    #[test]
    fn test_timeout_schedule_parsing() {
        let schedule: TimeoutSchedule = "2, 2,5".parse().unwrap();
        assert_eq!(
            schedule.0,
            vec![Duration::from_secs(2), Duration::from_secs(2), Duration::from_secs(5)]
        );
        assert!("1,0,3".parse::<TimeoutSchedule>().is_err());
        assert!("".parse::<TimeoutSchedule>().is_err());
        assert_eq!(TimeoutSchedule::default().to_string(), "1,3,7");
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(PathBuf::from("/srv/tftp"));
        assert_eq!(config.bind.port(), TFTP_PORT);
        assert!(!config.allow_writes);
        assert_eq!(config.transfer.max_block_size, 8192);
        assert_eq!(config.transfer.timeout.len(), 3);
    }
}
