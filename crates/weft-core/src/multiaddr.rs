//! Textual endpoint descriptors.
//!
//! A [`Multiaddr`] names an endpoint as `/ip4|ip6/<host>[/tcp/<port>]`
//! `[/udp/<port>]`. Every field is optional; the all-unset address renders as
//! the empty string and parses back to itself. Serialization is
//! deterministic (family/host, then tcp, then udp) and lossless.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    fn segment(self) -> &'static str {
        match self {
            Self::V4 => "ip4",
            Self::V6 => "ip6",
        }
    }
}

/// A parsed endpoint descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    family: Option<IpFamily>,
    host: Option<String>,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
}

impl Multiaddr {
    /// The all-unset address.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build an address from a host plus optional ports, inferring the
    /// family from the host text. Non-literal hostnames default to ip4.
    #[must_use]
    pub fn from_parts(host: &str, tcp_port: Option<u16>, udp_port: Option<u16>) -> Self {
        let family = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) | Err(_) => IpFamily::V4,
            Ok(IpAddr::V6(_)) => IpFamily::V6,
        };
        Self {
            family: Some(family),
            host: Some(host.to_string()),
            tcp_port,
            udp_port,
        }
    }

    /// Address family, if set.
    #[must_use]
    pub fn family(&self) -> Option<IpFamily> {
        self.family
    }

    /// Host text, if set.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// TCP port, if set.
    #[must_use]
    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    /// UDP port, if set.
    #[must_use]
    pub fn udp_port(&self) -> Option<u16> {
        self.udp_port
    }

    /// Replace the TCP port.
    pub fn set_tcp_port(&mut self, port: Option<u16>) {
        self.tcp_port = port;
    }

    /// Replace the UDP port.
    pub fn set_udp_port(&mut self, port: Option<u16>) {
        self.udp_port = port;
    }

    /// Whether every field is unset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.family.is_none()
            && self.host.is_none()
            && self.tcp_port.is_none()
            && self.udp_port.is_none()
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = Self::default();
        let parts: Vec<&str> = s.split('/').collect();
        let mut i = 1;
        while i < parts.len() {
            let key = parts[i];
            let value = parts.get(i + 1).copied().ok_or_else(|| {
                Error::Parse(format!("multiaddr segment without value: {key}"))
            })?;
            match key {
                "ip4" => {
                    out.family = Some(IpFamily::V4);
                    out.host = Some(value.to_string());
                }
                "ip6" => {
                    out.family = Some(IpFamily::V6);
                    out.host = Some(value.to_string());
                }
                "tcp" => {
                    out.tcp_port = Some(parse_port(value)?);
                }
                "udp" => {
                    out.udp_port = Some(parse_port(value)?);
                }
                other => {
                    return Err(Error::Parse(format!(
                        "unhandled multiaddr segment: {other}"
                    )));
                }
            }
            i += 2;
        }
        Ok(out)
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("bad port: {value}")))
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(family), Some(host)) = (self.family, &self.host) {
            write!(f, "/{}/{}", family.segment(), host)?;
        }
        if let Some(port) = self.tcp_port {
            write!(f, "/tcp/{port}")?;
        }
        if let Some(port) = self.udp_port {
            write!(f, "/udp/{port}")?;
        }
        Ok(())
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
