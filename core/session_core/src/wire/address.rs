//! Signaling address fields
//!
//! ```text
//! "Display Name" <user@host:port>;tag=3f9a01c2
//! ```
//!
//! The display name may be quoted or bare, the `user@` part is optional,
//! and parameters after `>` are `;key=value` pairs of which only `tag` is
//! interpreted.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::AddressError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let user = user.into();
        Self {
            display: user.clone(),
            user,
            host: host.into(),
            port,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Parse an address field value
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        let open = s
            .find('<')
            .ok_or_else(|| AddressError::MissingBrackets(s.to_string()))?;
        let close = s[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or_else(|| AddressError::MissingBrackets(s.to_string()))?;

        let display = s[..open].trim();
        let display = display
            .strip_prefix('"')
            .and_then(|d| d.strip_suffix('"'))
            .unwrap_or(display)
            .to_string();

        let inner = &s[open + 1..close];
        let (user, hostport) = match inner.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (String::new(), inner),
        };

        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(inner.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::BadPort(inner.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressError::EmptyHost(inner.to_string()));
        }

        let tag = s[close + 1..]
            .split(';')
            .filter_map(|param| param.trim().split_once('='))
            .find(|(key, _)| key.eq_ignore_ascii_case("tag"))
            .map(|(_, value)| value.to_string());

        Ok(NameAddr {
            display,
            user,
            host: host.to_string(),
            port,
            tag,
        })
    }

    /// The host/port as a socket address, if the host is an IP literal
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        write!(f, "\"{}\" <", self.display)?;
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        write!(f, "{}:{}>", host, self.port)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for NameAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NameAddr::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let addr = NameAddr::parse("\"Alice\" <alice@10.0.0.1:5060>;tag=ab12").unwrap();
        assert_eq!(addr.display, "Alice");
        assert_eq!(addr.user, "alice");
        assert_eq!(addr.host, "10.0.0.1");
        assert_eq!(addr.port, 5060);
        assert_eq!(addr.tag.as_deref(), Some("ab12"));
        assert_eq!(addr.socket_addr(), Some("10.0.0.1:5060".parse().unwrap()));
    }

    #[test]
    fn test_parse_bare_display_no_tag() {
        let addr = NameAddr::parse("bob <bob@host.example:7000>").unwrap();
        assert_eq!(addr.display, "bob");
        assert_eq!(addr.host, "host.example");
        assert_eq!(addr.tag, None);
        assert_eq!(addr.socket_addr(), None);
    }

    #[test]
    fn test_parse_without_user() {
        let addr = NameAddr::parse("<10.0.0.2:5000>").unwrap();
        assert_eq!(addr.user, "");
        assert_eq!(addr.port, 5000);
    }

    #[test]
    fn test_parse_ipv6_and_extra_params() {
        let addr = NameAddr::parse("\"c\" <c@[::1]:9000>;lr;tag=x9").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.tag.as_deref(), Some("x9"));
        assert_eq!(addr.to_string(), "\"c\" <c@[::1]:9000>;tag=x9");
    }

    #[test]
    fn test_display_roundtrip() {
        let addr = NameAddr::new("dave", "192.168.1.4", 4000).with_tag("77");
        let text = addr.to_string();
        assert_eq!(text, "\"dave\" <dave@192.168.1.4:4000>;tag=77");
        assert_eq!(text.parse::<NameAddr>().unwrap(), addr);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            NameAddr::parse("alice@10.0.0.1:5060"),
            Err(AddressError::MissingBrackets(_))
        ));
        assert!(matches!(
            NameAddr::parse("<alice@10.0.0.1>"),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            NameAddr::parse("<alice@10.0.0.1:port>"),
            Err(AddressError::BadPort(_))
        ));
        assert!(matches!(
            NameAddr::parse("<alice@:5000>"),
            Err(AddressError::EmptyHost(_))
        ));
    }
}
