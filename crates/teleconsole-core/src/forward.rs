//! Forwarded-port specification parsing.
//!
//! A broadcaster can invite joiners to one TCP port on (or reachable from)
//! their machine; a joiner can request the forward on their side. Both are
//! described by [`ForwardedPort`], which also travels inside the session
//! descriptor.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// A single TCP port forward.
///
/// Field names are part of the session wire format and must never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    /// IP the listening side binds to.
    #[serde(rename = "src_ip")]
    pub src_ip: String,
    /// Port the listening side binds to.
    #[serde(rename = "src_port")]
    pub src_port: u16,
    /// Host the traffic is delivered to.
    #[serde(rename = "dest_host")]
    pub dest_host: String,
    /// Port the traffic is delivered to.
    #[serde(rename = "dest_port")]
    pub dest_port: u16,
}

impl ForwardedPort {
    /// Parse an invite spec (`-f`). Understood shapes:
    ///
    /// - `"5000"`           destination `localhost:5000`
    /// - `"host:port"`      destination `host:port`
    /// - `"http://host"`    destination `host:80`
    /// - `"https://host"`   destination `host:443`
    pub fn parse_invite(spec: &str) -> Result<Self> {
        let mut p = ForwardedPort {
            src_ip: String::new(),
            src_port: 0,
            dest_host: String::new(),
            dest_port: 0,
        };

        // Scheme shapes only apply when a host is actually present.
        if let Ok(u) = Url::parse(spec) {
            if let Some(host) = u.host_str() {
                match u.scheme() {
                    "http" => {
                        p.dest_host = host.to_string();
                        p.dest_port = 80;
                        return Ok(p);
                    }
                    "https" => {
                        p.dest_host = host.to_string();
                        p.dest_port = 443;
                        return Ok(p);
                    }
                    _ => {}
                }
            }
        }

        // Port-only spec.
        if let Ok(port) = spec.parse::<u16>() {
            p.dest_host = "localhost".to_string();
            p.dest_port = port;
            return Ok(p);
        }

        // Regular host:port spec.
        let (host, port) = spec.rsplit_once(':').ok_or_else(|| invalid(spec))?;
        if host.is_empty() {
            return Err(invalid(spec));
        }
        p.dest_host = host.to_string();
        p.dest_port = port.parse().map_err(|_| invalid(spec))?;
        Ok(p)
    }

    /// Parse a join-side forward spec (`-L`): `listen:dst-host:dst-port`.
    pub fn parse_local(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let [listen, dest_host, dest_port] = parts.as_slice() else {
            return Err(invalid(spec));
        };
        if dest_host.is_empty() {
            return Err(invalid(spec));
        }
        Ok(ForwardedPort {
            src_ip: "127.0.0.1".to_string(),
            src_port: listen.parse().map_err(|_| invalid(spec))?,
            dest_host: dest_host.to_string(),
            dest_port: dest_port.parse().map_err(|_| invalid(spec))?,
        })
    }

    /// True when the destination is the inviting party's own machine.
    pub fn is_local_destination(&self) -> bool {
        self.dest_host == "localhost" || self.dest_host == "127.0.0.1"
    }
}

fn invalid(spec: &str) -> Error {
    Error::InvalidForwardSpec { spec: spec.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_goes_to_localhost() {
        let p = ForwardedPort::parse_invite("5000").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("localhost", 5000));

        let p = ForwardedPort::parse_invite("8888").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("localhost", 8888));
    }

    #[test]
    fn host_port_spec() {
        let p = ForwardedPort::parse_invite("host:22").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("host", 22));

        let p = ForwardedPort::parse_invite("localhost:5000").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("localhost", 5000));
    }

    #[test]
    fn scheme_selects_well_known_port() {
        let p = ForwardedPort::parse_invite("http://ex.com").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("ex.com", 80));

        let p = ForwardedPort::parse_invite("https://ex.com").unwrap();
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("ex.com", 443));
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in ["foo", "", "host:", ":80x", "host:port"] {
            let err = ForwardedPort::parse_invite(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidForwardSpec { .. }), "{bad}");
        }
    }

    #[test]
    fn local_spec_parses_three_parts() {
        let p = ForwardedPort::parse_local("5000:gravitational.com:80").unwrap();
        assert_eq!(p.src_ip, "127.0.0.1");
        assert_eq!(p.src_port, 5000);
        assert_eq!((p.dest_host.as_str(), p.dest_port), ("gravitational.com", 80));

        assert!(ForwardedPort::parse_local("5000:80").is_err());
        assert!(ForwardedPort::parse_local("a:b:c").is_err());
    }

    #[test]
    fn wire_form_round_trips_byte_equal() {
        let p = ForwardedPort {
            src_ip: "127.0.0.1".into(),
            src_port: 9000,
            dest_host: "localhost".into(),
            dest_port: 5000,
        };
        let doc = serde_json::to_string(&p).unwrap();
        let back: ForwardedPort = serde_json::from_str(&doc).unwrap();
        assert_eq!(back, p);
        assert_eq!(serde_json::to_string(&back).unwrap(), doc);
    }

    #[test]
    fn local_destination_predicate() {
        assert!(ForwardedPort::parse_invite("5000").unwrap().is_local_destination());
        assert!(!ForwardedPort::parse_invite("ex.com:80").unwrap().is_local_destination());
    }
}
