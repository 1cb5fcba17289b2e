//! Transport URL parsing
//!
//! Format: `scheme://host[:port][?key=value&...]`, e.g. `udp://192.168.1.20:47808`.
//! IPv6 hosts are bracketed: `udp://[fe80::1]:47808`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::options::DriverOptions;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("transport url {0:?} has no scheme")]
    MissingScheme(String),
    #[error("transport url {0:?} has no host")]
    MissingHost(String),
    #[error("transport url {url:?} has invalid port {port:?}")]
    InvalidPort { url: String, port: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    query: String,
}

impl TransportUrl {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Options carried in the query string
    pub fn options(&self) -> DriverOptions {
        DriverOptions::from_query(&self.query)
    }

    /// `host:port` suitable for address resolution, using `default_port` when
    /// the URL does not carry one
    pub fn host_port(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl FromStr for TransportUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| UrlError::MissingScheme(s.to_string()))?;

        let (authority, query) = rest.split_once('?').unwrap_or((rest, ""));
        // Paths carry no meaning for a transport address
        let authority = authority.split_once('/').map_or(authority, |(authority, _)| authority);

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [v6]:port
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| UrlError::MissingHost(s.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => {
                    return Err(UrlError::InvalidPort {
                        url: s.to_string(),
                        port: after.to_string(),
                    })
                }
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(UrlError::MissingHost(s.to_string()));
        }

        let port = port
            .map(|p| {
                p.parse::<u16>().map_err(|_| UrlError::InvalidPort {
                    url: s.to_string(),
                    port: p.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            scheme: scheme.to_lowercase(),
            host: host.to_string(),
            port,
            query: query.to_string(),
        })
    }
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        Ok(())
    }
}
