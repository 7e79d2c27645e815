//! Session descriptor and the other broker wire forms.
//!
//! These objects travel as JSON between the client and the broker. Field
//! names are a cross-version contract with deployed brokers and must never
//! change.

use serde::{Deserialize, Serialize};

use crate::forward::ForwardedPort;
use crate::identity::UserMap;
use crate::net;
use crate::Result;

/// Host CA material a party must trust to talk to a site or proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertAuthority {
    /// Site the authority vouches for.
    pub domain: String,
    /// OpenSSH-encoded public key of the authority.
    #[serde(rename = "public_key")]
    pub public_key: String,
}

/// Everything a party needs to trust and join a session: the site's CA
/// material, its reverse tunnel address, and the announced users.
///
/// Secrets are set when the session is created and never mutated afterwards;
/// only the listen address gets its host rewritten, because the issuing
/// server does not know which DNS name it is reachable by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSecrets {
    #[serde(rename = "site_name")]
    pub site_name: String,
    /// `host:port` the disposable proxy listens on for the reverse tunnel.
    #[serde(rename = "tunnel_addr")]
    pub listen_addr: String,
    pub cas: Vec<CertAuthority>,
    pub users: UserMap,
}

/// A session descriptor as exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Web session id, assigned client-side, opaque to the broker client.
    pub id: String,

    /// Internal session id of the live terminal; written once by the
    /// broadcaster as soon as the local shell comes up.
    #[serde(rename = "teleport_session_id", default)]
    pub tsid: String,

    /// Secrets and login are what a joining party needs.
    pub secrets: SessionSecrets,
    pub login: String,

    /// `host:port` of the disposable SSH proxy created for this session.
    #[serde(rename = "proxy_addr", default)]
    pub proxy_host_port: String,

    /// `host:port` of the broadcaster's machine, as seen by itself.
    #[serde(rename = "node_addr")]
    pub node_host_port: String,

    /// Port the broadcaster invites joiners to, if any.
    #[serde(rename = "forwarded_port")]
    pub forwarded_port: Option<ForwardedPort>,
}

impl Session {
    /// Splits the broadcaster's node address into host and port.
    pub fn node_host_port(&self) -> Result<(String, u16)> {
        net::split_host_port(&self.node_host_port)
    }
}

/// One connected party, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    #[serde(rename = "remote_addr")]
    pub remote_addr: String,
    #[serde(rename = "last_active")]
    pub last_active: String,
}

/// Session statistics polled by the broadcaster during tunnel detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    #[serde(rename = "connected_parties", default)]
    pub parties: Vec<Party>,
    #[serde(rename = "term_width", default)]
    pub term_width: u16,
    #[serde(rename = "term_height", default)]
    pub term_height: u16,
}

/// JSON response returned by the broker at the beginning of every API
/// conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    /// Server's version and build data.
    #[serde(rename = "server_ver")]
    pub server_version: String,

    /// Clients must show this message to users when non-empty.
    #[serde(rename = "warn_msg", default)]
    pub warning: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            id: "abcdef0123456789abcdef0123456789abcdef01".into(),
            tsid: String::new(),
            secrets: SessionSecrets {
                site_name: "teleconsole-client".into(),
                listen_addr: "localhost:3024".into(),
                cas: vec![CertAuthority {
                    domain: "teleconsole-client".into(),
                    public_key: "ssh-ed25519 AAAA host-ca".into(),
                }],
                users: UserMap::new(),
            },
            login: "alice".into(),
            proxy_host_port: "proxy.example:3023".into(),
            node_host_port: "localhost:3022".into(),
            forwarded_port: None,
        }
    }

    #[test]
    fn node_host_port_splits() {
        let s = sample_session();
        let (host, port) = s.node_host_port().unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 3022);
    }

    #[test]
    fn node_host_port_rejects_bare_host() {
        let mut s = sample_session();
        s.node_host_port = "localhost".into();
        assert!(s.node_host_port().is_err());
    }

    #[test]
    fn wire_names_are_stable() {
        // Key-name stability is required for cross-version compatibility
        // with deployed brokers.
        let doc = serde_json::to_value(sample_session()).unwrap();
        for key in [
            "id",
            "teleport_session_id",
            "secrets",
            "login",
            "proxy_addr",
            "node_addr",
            "forwarded_port",
        ] {
            assert!(doc.get(key).is_some(), "missing wire key {key}");
        }
        let secrets = doc.get("secrets").unwrap();
        for key in ["site_name", "tunnel_addr", "cas", "users"] {
            assert!(secrets.get(key).is_some(), "missing secrets key {key}");
        }
    }

    #[test]
    fn session_round_trips() {
        let s = sample_session();
        let doc = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&doc).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn stats_default_on_missing_fields() {
        let stats: SessionStats = serde_json::from_str("{}").unwrap();
        assert!(stats.parties.is_empty());

        let stats: SessionStats = serde_json::from_str(
            r#"{"connected_parties":[{"remote_addr":"1.2.3.4:555","last_active":"2016-09-01T00:00:00Z"}],"term_width":80,"term_height":24}"#,
        )
        .unwrap();
        assert_eq!(stats.parties.len(), 1);
        assert_eq!(stats.parties[0].remote_addr, "1.2.3.4:555");
        assert_eq!((stats.term_width, stats.term_height), (80, 24));
    }

    #[test]
    fn server_version_warning_is_optional() {
        let v: ServerVersion = serde_json::from_str(r#"{"server_ver":"1.0.0"}"#).unwrap();
        assert_eq!(v.server_version, "1.0.0");
        assert!(v.warning.is_empty());
    }
}
