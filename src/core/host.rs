use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// beanstalkd's well-known port.
pub const DEFAULT_PORT: u16 = 11300;

const LOOPBACK_ALIASES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// A queue endpoint, written as `host` or `host:port` (`[v6]:port` for IPv6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid host '{0}' (expected 'host' or 'host:port')")]
pub struct HostParseError(pub String);

impl Host {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn is_loopback(&self) -> bool {
        LOOPBACK_ALIASES.contains(&self.address.as_str())
    }

    /// `address:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let err = || HostParseError(s.to_string());
        if raw.is_empty() {
            return Err(err());
        }

        // [::1]:11300 / [::1]
        if let Some(rest) = raw.strip_prefix('[') {
            let (address, tail) = rest.split_once(']').ok_or_else(err)?;
            if address.is_empty() {
                return Err(err());
            }
            let port = match tail {
                "" => DEFAULT_PORT,
                tail => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(err)?,
            };
            return Ok(Host::new(address, port));
        }

        // A bare IPv6 literal carries several colons and never a port.
        match raw.split_once(':') {
            Some((address, port)) if !port.contains(':') => {
                if address.is_empty() {
                    return Err(err());
                }
                let port = port.parse().map_err(|_| err())?;
                Ok(Host::new(address, port))
            }
            _ => Ok(Host::new(raw, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

impl Serialize for Host {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Host {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
