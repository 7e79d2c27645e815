//! Small networking helpers shared by the broadcast and join engines.

use std::net::TcpListener;

use crate::{Error, Result};

/// Returns `n` TCP ports that were free at the time of the call.
///
/// Each port is discovered by binding an ephemeral listener and recording the
/// OS-assigned number. The listeners are dropped before returning, so the
/// caller must re-bind promptly.
pub fn get_free_ports(n: usize) -> Result<Vec<u16>> {
    let mut ports = Vec::with_capacity(n);
    // Keep the listeners alive until all ports are collected so the OS
    // cannot hand the same port out twice.
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }
    Ok(ports)
}

/// Takes a `host:port` string (port optional), replaces the host with
/// `new_host` and returns the result. `new_host` may itself carry a port,
/// which is ignored.
pub fn replace_host(host_port: &str, new_host: &str) -> String {
    let new_host = match split_host_port(new_host) {
        Ok((h, _)) => h,
        Err(_) => new_host.to_string(),
    };
    match split_host_port(host_port) {
        Ok((_, port)) => format!("{new_host}:{port}"),
        Err(_) => new_host,
    }
}

/// Splits `host:port` into a hostname and an integer port.
pub fn split_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::Config {
        message: format!("missing port in address '{s}'"),
    })?;
    if host.is_empty() {
        return Err(Error::Config {
            message: format!("missing host in address '{s}'"),
        });
    }
    let port: u16 = port.parse().map_err(|_| Error::Config {
        message: format!("invalid port in address '{s}'"),
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_ports_are_distinct() {
        let ports = get_free_ports(5).unwrap();
        assert_eq!(ports.len(), 5);
        let mut deduped = ports.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), 5);
        assert!(ports.iter().all(|p| *p > 0));
    }

    #[test]
    fn replace_host_keeps_port() {
        assert_eq!(replace_host("proxy.example:3023", "eu.example"), "eu.example:3023");
        assert_eq!(
            replace_host("proxy.example:3023", "eu.example:443"),
            "eu.example:3023"
        );
    }

    #[test]
    fn replace_host_without_port() {
        assert_eq!(replace_host("proxy.example", "eu.example"), "eu.example");
    }

    #[test]
    fn split_host_port_happy_path() {
        let (host, port) = split_host_port("localhost:3022").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 3022);
    }

    #[test]
    fn split_host_port_rejects_garbage() {
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port("localhost:http").is_err());
        assert!(split_host_port(":80").is_err());
    }
}
