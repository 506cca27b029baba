//! Docker-Compose port specification grammar
//!
//! Accepted forms, verbatim compose compatibility:
//! `"PORT"`, `"HOST:CONTAINER"`, `"IP:HOST:CONTAINER"`,
//! `"[IPv6]:HOST:CONTAINER"`, each optionally suffixed with `/tcp` or
//! `/udp`. For native services a bare `"PORT"` binds host and app to the
//! same number; for containerized services it means container=PORT with the
//! host side auto-assigned.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Transport protocol of a published port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    /// TCP (default)
    #[default]
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A parsed port specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Host interface to bind, when pinned
    pub bind_ip: Option<IpAddr>,
    /// Host port; 0 requests auto-assignment
    pub host_port: u16,
    /// Port inside the service; always non-zero
    pub container_port: u16,
    /// Transport protocol
    pub protocol: PortProtocol,
}

impl PortSpec {
    /// Parse a compose-syntax port string
    ///
    /// `containerized` selects the bare-`"N"` defaulting rule (see module
    /// docs). Errors are plain strings; callers wrap them with service
    /// context.
    pub fn parse(raw: &str, containerized: bool) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty port spec".to_string());
        }

        let (body, protocol) = match raw.rsplit_once('/') {
            Some((body, proto)) => {
                let protocol = match proto.to_ascii_lowercase().as_str() {
                    "tcp" => PortProtocol::Tcp,
                    "udp" => PortProtocol::Udp,
                    other => return Err(format!("unknown protocol '{}'", other)),
                };
                (body, protocol)
            }
            None => (raw, PortProtocol::Tcp),
        };

        // IPv6 binds are bracketed, so the address's own colons never count
        // as mapping separators.
        let (bind_ip, mapping) = if let Some(rest) = body.strip_prefix('[') {
            let (addr, rest) = rest
                .split_once(']')
                .ok_or_else(|| "unterminated '[' in IPv6 bind".to_string())?;
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| format!("invalid IPv6 address '{}'", addr))?;
            let mapping = rest
                .strip_prefix(':')
                .ok_or_else(|| "expected ':' after IPv6 bind".to_string())?;
            (Some(ip), mapping)
        } else {
            let parts: Vec<&str> = body.split(':').collect();
            match parts.len() {
                1 | 2 => (None, body),
                3 => {
                    let ip: IpAddr = parts[0]
                        .parse()
                        .map_err(|_| format!("invalid bind address '{}'", parts[0]))?;
                    (Some(ip), &body[parts[0].len() + 1..])
                }
                n => return Err(format!("too many ':' separators ({} parts)", n)),
            }
        };

        let parts: Vec<&str> = mapping.split(':').collect();
        let (host_port, container_port) = match parts.len() {
            1 => {
                let port = parse_port(parts[0])?;
                if port == 0 {
                    return Err("port must be greater than zero".to_string());
                }
                if containerized {
                    (0, port)
                } else {
                    (port, port)
                }
            }
            2 => {
                let host = parse_port(parts[0])?;
                let container = parse_port(parts[1])?;
                if container == 0 {
                    return Err("container port must be greater than zero".to_string());
                }
                (host, container)
            }
            n => return Err(format!("expected HOST:CONTAINER, got {} parts", n)),
        };

        if bind_ip.is_some() && host_port == 0 {
            return Err("a bind address requires an explicit host port".to_string());
        }

        Ok(Self {
            bind_ip,
            host_port,
            container_port,
            protocol,
        })
    }

    /// Whether the manifest pinned the host port
    pub fn is_explicit(&self) -> bool {
        self.host_port > 0
    }

    /// Copy of this spec with a different host port
    pub fn with_host_port(&self, host_port: u16) -> Self {
        Self {
            host_port,
            ..self.clone()
        }
    }

    /// Copy of this spec after the host side was auto-reassigned
    ///
    /// For a native bare port the application listens on whatever it is
    /// given, so host and app port move together; an explicit mapping keeps
    /// its in-service port.
    pub fn reassigned(&self, port: u16, containerized: bool) -> Self {
        if !containerized && self.host_port == self.container_port {
            Self {
                host_port: port,
                container_port: port,
                ..self.clone()
            }
        } else {
            self.with_host_port(port)
        }
    }

    /// Render back to compose syntax for manifest writeback
    ///
    /// A native port that still maps host==container collapses to the bare
    /// form; everything else keeps the explicit mapping.
    pub fn render(&self, containerized: bool) -> String {
        let mut out = String::new();
        if let Some(ip) = self.bind_ip {
            if ip.is_ipv6() {
                out.push_str(&format!("[{}]:", ip));
            } else {
                out.push_str(&format!("{}:", ip));
            }
        }
        if self.bind_ip.is_none() && !containerized && self.host_port == self.container_port {
            out.push_str(&self.container_port.to_string());
        } else {
            out.push_str(&format!("{}:{}", self.host_port, self.container_port));
        }
        if self.protocol == PortProtocol::Udp {
            out.push_str("/udp");
        }
        out
    }
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port number '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port_native() {
        let spec = PortSpec::parse("3000", false).unwrap();
        assert_eq!(spec.host_port, 3000);
        assert_eq!(spec.container_port, 3000);
        assert_eq!(spec.protocol, PortProtocol::Tcp);
        assert!(spec.is_explicit());
    }

    #[test]
    fn test_bare_port_containerized() {
        let spec = PortSpec::parse("5432", true).unwrap();
        assert_eq!(spec.host_port, 0);
        assert_eq!(spec.container_port, 5432);
        assert!(!spec.is_explicit());
    }

    #[test]
    fn test_host_container_mapping() {
        let spec = PortSpec::parse("8080:80", true).unwrap();
        assert_eq!(spec.host_port, 8080);
        assert_eq!(spec.container_port, 80);
    }

    #[test]
    fn test_ipv4_bind() {
        let spec = PortSpec::parse("127.0.0.1:8080:80", true).unwrap();
        assert_eq!(spec.bind_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(spec.host_port, 8080);
        assert_eq!(spec.container_port, 80);
    }

    #[test]
    fn test_ipv6_bind() {
        let spec = PortSpec::parse("[::1]:8080:80", false).unwrap();
        assert_eq!(spec.bind_ip, Some("::1".parse().unwrap()));
        assert_eq!(spec.host_port, 8080);
        assert_eq!(spec.container_port, 80);
    }

    #[test]
    fn test_udp_suffix() {
        let spec = PortSpec::parse("53/udp", false).unwrap();
        assert_eq!(spec.protocol, PortProtocol::Udp);
        assert_eq!(spec.container_port, 53);

        let spec = PortSpec::parse("5353:53/udp", true).unwrap();
        assert_eq!(spec.protocol, PortProtocol::Udp);
        assert_eq!(spec.host_port, 5353);
    }

    #[test]
    fn test_invalid_specs() {
        assert!(PortSpec::parse("", false).is_err());
        assert!(PortSpec::parse("0", false).is_err());
        assert!(PortSpec::parse("abc", false).is_err());
        assert!(PortSpec::parse("80/sctp", false).is_err());
        assert!(PortSpec::parse("1:2:3:4", false).is_err());
        assert!(PortSpec::parse("[::1]8080:80", false).is_err());
        assert!(PortSpec::parse("notanip:8080:80", false).is_err());
    }

    #[test]
    fn test_render_round_trip() {
        for (raw, containerized) in [
            ("3000", false),
            ("8080:80", true),
            ("127.0.0.1:8080:80", true),
            ("[::1]:8080:80", false),
            ("53/udp", false),
        ] {
            let spec = PortSpec::parse(raw, containerized).unwrap();
            assert_eq!(spec.render(containerized), raw, "round trip of {}", raw);
        }
    }

    #[test]
    fn test_render_after_reassignment() {
        // Native bare port: host and app move together.
        let spec = PortSpec::parse("3000", false).unwrap();
        assert_eq!(spec.reassigned(3001, false).render(false), "3001");

        // Explicit mapping keeps its in-service port.
        let spec = PortSpec::parse("8080:80", true).unwrap();
        assert_eq!(spec.reassigned(8081, true).render(true), "8081:80");
    }
}
