//! CONNECT target parsing and route selection.

use std::fmt;

use regex::Regex;

use crate::error::{ProxyError, Result};

/// Default pattern for tunnels relayed as plaintext HTTP.
pub const DEFAULT_PLAINTEXT_PATTERN: &str = "^.*:80$";

/// Default pattern for tunnels terminated with a minted certificate.
pub const DEFAULT_MITM_PATTERN: &str = "^.*$";

/// How a CONNECT tunnel is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Terminate TLS and observe the decrypted requests.
    Mitm,
    /// Relay whole plaintext HTTP messages without TLS.
    Plaintext,
    /// No pattern matched; the tunnel is refused.
    Refused,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Mitm => f.write_str("mitm"),
            Route::Plaintext => f.write_str("plaintext"),
            Route::Refused => f.write_str("refused"),
        }
    }
}

/// Host patterns deciding the route of each CONNECT request.
///
/// Patterns are matched against the `host:port` authority. The plaintext
/// pattern is checked first so port-80 tunnels are never TLS-terminated.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    plaintext: Regex,
    mitm: Regex,
}

impl RoutePolicy {
    /// Builds a policy from two regular expressions.
    pub fn new(plaintext: &str, mitm: &str) -> Result<Self> {
        Ok(Self {
            plaintext: Regex::new(plaintext)?,
            mitm: Regex::new(mitm)?,
        })
    }

    /// Decides the route for a CONNECT authority.
    pub fn classify(&self, authority: &str) -> Route {
        if self.plaintext.is_match(authority) {
            Route::Plaintext
        } else if self.mitm.is_match(authority) {
            Route::Mitm
        } else {
            Route::Refused
        }
    }
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            plaintext: Regex::new(DEFAULT_PLAINTEXT_PATTERN).expect("valid default pattern"),
            mitm: Regex::new(DEFAULT_MITM_PATTERN).expect("valid default pattern"),
        }
    }
}

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Hostname or IP literal, without IPv6 brackets.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

impl ConnectTarget {
    /// Parses a CONNECT authority (`host:port`, `[v6]:port`, or bare host).
    ///
    /// A missing port defaults to 443.
    pub fn parse(authority: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidTarget {
            target: authority.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            match after {
                "" => (host, None),
                _ => (
                    host,
                    Some(
                        after
                            .strip_prefix(':')
                            .ok_or_else(|| invalid("expected ':' after IPv6 literal"))?,
                    ),
                ),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("host cannot be empty"));
        }
        if host.contains(['/', ' ', '@']) {
            return Err(invalid("host contains invalid characters"));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("port must be a number between 1 and 65535"))?,
            None => 443,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host as it appears in an authority (IPv6 literals bracketed).
    pub fn host_for_authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `https://` origin for this target, omitting the default port.
    pub fn https_origin(&self) -> String {
        if self.port == 443 {
            format!("https://{}", self.host_for_authority())
        } else {
            format!("https://{}:{}", self.host_for_authority(), self.port)
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_for_authority(), self.port)
    }
}
