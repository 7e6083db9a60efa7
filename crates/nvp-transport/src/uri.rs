//! Endpoint URIs of the form `<scheme>://<host>:<port>`.

use std::fmt;
use std::str::FromStr;

use crate::TransportError;

/// A parsed endpoint URI. Only the `tcp` scheme is supported; the string
/// form round-trips so URIs can be passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    host: String,
    port: u16,
}

impl Uri {
    pub fn tcp(host: &str, port: u16) -> Uri {
        Uri {
            host: host.to_owned(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form for socket address resolution; IPv6 hosts come out
    /// bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Uri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUri(s.to_owned()))?;
        if scheme != "tcp" {
            return Err(TransportError::UnsupportedScheme(scheme.to_owned()));
        }
        // IPv6 hosts are bracketed: tcp://[::1]:21321
        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TransportError::InvalidUri(s.to_owned()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| TransportError::InvalidUri(s.to_owned()))?;
            (host, port)
        } else {
            rest.rsplit_once(':')
                .ok_or_else(|| TransportError::InvalidUri(s.to_owned()))?
        };
        if host.is_empty() {
            return Err(TransportError::InvalidUri(s.to_owned()));
        }
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidUri(s.to_owned()))?;
        Ok(Uri {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}
