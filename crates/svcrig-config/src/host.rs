//! Host targets and host list parsing

use serde::Serialize;
use std::fmt;

/// A machine on which one service instance runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostTarget {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HostTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
        }
    }

    pub fn with_port(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
        }
    }

    /// parse "name" or "name:port"
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty host name".to_string());
        }

        match s.rsplit_once(':') {
            Some((name, port)) => {
                if name.is_empty() {
                    return Err(format!("missing host name in '{}'", s));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in '{}'", s))?;
                Ok(Self::with_port(name, port))
            }
            None => Ok(Self::new(s)),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.name.as_str(), "localhost" | "127.0.0.1")
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.name, port),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split a list property on `;`, `,` and whitespace
pub fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
}

/// Parse a host list, dropping duplicates while keeping first-seen order
pub fn parse_host_list(s: &str) -> Result<Vec<HostTarget>, String> {
    let mut hosts: Vec<HostTarget> = Vec::new();
    for token in split_list(s) {
        let host = HostTarget::parse(token)?;
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        let host = HostTarget::parse("db1").unwrap();
        assert_eq!(host.name, "db1");
        assert_eq!(host.port, None);
        assert_eq!(host.to_string(), "db1");
    }

    #[test]
    fn test_parse_host_with_port() {
        let host = HostTarget::parse("cache1:11211").unwrap();
        assert_eq!(host, HostTarget::with_port("cache1", 11211));
        assert_eq!(host.to_string(), "cache1:11211");
    }

    #[test]
    fn test_parse_bad_port() {
        assert!(HostTarget::parse("cache1:abc").is_err());
        assert!(HostTarget::parse(":11211").is_err());
    }

    #[test]
    fn test_host_list_dedupes_in_order() {
        let hosts = parse_host_list("b; a, b\nc:1 c:1 c:2").unwrap();
        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        assert_eq!(names, vec!["b", "a", "c:1", "c:2"]);
    }

    #[test]
    fn test_local_hosts() {
        assert!(HostTarget::new("localhost").is_local());
        assert!(HostTarget::new("127.0.0.1").is_local());
        assert!(!HostTarget::new("db1").is_local());
    }
}
