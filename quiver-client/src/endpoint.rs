//! Broker endpoints and service URL parsing

use crate::error::ClientError;
use std::fmt;

pub const PLAIN_SCHEME: &str = "pulsar";
pub const TLS_SCHEME: &str = "pulsar+ssl";
pub const DEFAULT_PORT: u16 = 6650;
pub const DEFAULT_TLS_PORT: u16 = 6651;

/// Network address of a broker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new<H: Into<String>>(host: H, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Parse `pulsar://host[:port]` or `pulsar+ssl://host[:port]`
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ClientError::invalid_config(format!("missing scheme in '{}'", url)))?;

        let tls = match scheme {
            PLAIN_SCHEME => false,
            TLS_SCHEME => true,
            other => {
                return Err(ClientError::invalid_config(format!(
                    "unsupported scheme '{}' in '{}'",
                    other, url
                )))
            }
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(ClientError::invalid_config(format!(
                "invalid broker address '{}'",
                url
            )));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ClientError::invalid_config(format!("invalid port in '{}'", url))
                })?;
                (host, port)
            }
            None if tls => (authority, DEFAULT_TLS_PORT),
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(ClientError::invalid_config(format!("missing host in '{}'", url)));
        }

        Ok(Self::new(host, port, tls))
    }

    /// `host:port` for socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { TLS_SCHEME } else { PLAIN_SCHEME };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tls_url() {
        let endpoint = Endpoint::parse("pulsar+ssl://useast1.example.io:6651").unwrap();
        assert_eq!(endpoint.host, "useast1.example.io");
        assert_eq!(endpoint.port, 6651);
        assert!(endpoint.tls);
        assert_eq!(endpoint.to_string(), "pulsar+ssl://useast1.example.io:6651");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Endpoint::parse("pulsar://localhost").unwrap().port, 6650);
        assert_eq!(Endpoint::parse("pulsar+ssl://localhost/").unwrap().port, 6651);
    }

    #[test]
    fn test_rejects_bad_urls() {
        for url in [
            "localhost:6650",
            "http://localhost:6650",
            "pulsar://",
            "pulsar://:6650",
            "pulsar://host:notaport",
            "pulsar://host:6650/path",
        ] {
            assert!(Endpoint::parse(url).is_err(), "accepted {url}");
        }
    }
}
