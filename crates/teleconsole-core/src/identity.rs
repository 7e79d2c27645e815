//! Identity model and credential handling.
//!
//! An identity describes the keys a shared session will accept. There are
//! two kinds:
//!
//! 1. An *anonymous* identity maps to the local OS user and carries one
//!    freshly generated keypair. Both halves travel with the session to the
//!    broker, so anyone holding the session id can join.
//!
//! 2. A *named* identity is built from user-supplied SSH keys, either from
//!    files or from a public key-discovery service. Named private keys never
//!    leave the machine they were read on; a joining party must hold a
//!    matching private key of their own.

use std::collections::BTreeMap;
use std::path::Path;

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::debug;

use crate::constants::KEY_DISCOVERY_URL;
use crate::{Error, Result};

/// An SSH keypair in OpenSSH text encoding. The private half is absent for
/// keys learned from a discovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(rename = "pub")]
    pub public: String,
    #[serde(rename = "priv")]
    pub private: Option<String>,
}

impl KeyPair {
    /// Generate a fresh single-use keypair.
    pub fn generate() -> Result<Self> {
        let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::identity(format!("failed to generate keypair: {e}")))?;
        let public = private
            .public_key()
            .to_openssh()
            .map_err(|e| Error::identity(format!("failed to encode public key: {e}")))?;
        let private = private
            .to_openssh(LineEnding::LF)
            .map_err(|e| Error::identity(format!("failed to encode private key: {e}")))?;
        Ok(KeyPair {
            public,
            private: Some(private.to_string()),
        })
    }
}

/// SSH credentials under one identity. The username acts only as a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub key: KeyPair,
}

/// A session user as announced to the local site and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeleportUser {
    pub username: String,
    pub key: KeyPair,
    #[serde(rename = "allowed_logins")]
    pub allowed_logins: Vec<String>,
}

/// Mapping of login label to announced user.
pub type UserMap = BTreeMap<String, TeleportUser>;

/// A teleconsole user identity: one or more SSH logins under a local OS
/// username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub anonymous: bool,
    /// The local OS user name; a label, not an authentication subject.
    pub username: String,
    pub logins: Vec<Login>,
}

impl Identity {
    /// Create an identity from an identity source. An empty source produces
    /// an anonymous identity; otherwise the source is a comma-separated list
    /// where each item is either a private key file or a username on the key
    /// discovery service.
    pub async fn make(source: &str) -> Result<Identity> {
        Self::make_at(source, KEY_DISCOVERY_URL).await
    }

    /// Like [`Identity::make`] with an explicit discovery service base URL.
    pub async fn make_at(source: &str, discovery_base: &str) -> Result<Identity> {
        let username = local_os_user();
        if source.is_empty() {
            return Ok(Identity {
                anonymous: true,
                username: username.clone(),
                logins: vec![Login {
                    username,
                    key: KeyPair::generate()?,
                }],
            });
        }

        let mut logins = Vec::new();
        for item in source.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if Path::new(item).is_file() {
                logins.push(login_from_file(Path::new(item))?);
            } else {
                logins.extend(logins_from_discovery(item, discovery_base).await?);
            }
        }
        if logins.is_empty() {
            return Err(Error::identity(format!(
                "identity source '{source}' produced no keys"
            )));
        }
        dedup_labels(&mut logins);
        Ok(Identity {
            anonymous: false,
            username,
            logins,
        })
    }

    /// Create a named identity from a single private key file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Identity> {
        Ok(Identity {
            anonymous: false,
            username: local_os_user(),
            logins: vec![login_from_file(path.as_ref())?],
        })
    }

    /// Users suitable for logging into the local site. Public and private
    /// halves are both present for every login whose source provided them.
    ///
    /// Allowed logins are `[local-os-user, label]`, deduplicated so the OS
    /// user always comes first.
    pub fn login_users(&self) -> UserMap {
        let mut m = UserMap::new();
        for login in &self.logins {
            let mut allowed = vec![self.username.clone()];
            if login.username != self.username {
                allowed.push(login.username.clone());
            }
            m.insert(
                login.username.clone(),
                TeleportUser {
                    username: login.username.clone(),
                    key: login.key.clone(),
                    allowed_logins: allowed,
                },
            );
        }
        m
    }

    /// Users to send along with a new session. Anonymous identities include
    /// private keys; named identities never do.
    pub fn announce_users(&self) -> UserMap {
        let mut users = self.login_users();
        if !self.anonymous {
            for user in users.values_mut() {
                user.key.private = None;
            }
        }
        users
    }

    /// Returns the private key whose public half matches `public_key`, if
    /// this identity holds one. Comparison is whitespace-trimmed.
    pub fn private_key_for(&self, public_key: &str) -> Option<&str> {
        let wanted = public_key.trim();
        self.logins
            .iter()
            .find(|l| l.key.public.trim() == wanted)
            .and_then(|l| l.key.private.as_deref())
    }
}

/// Local OS user name; used as a label and as the default shell login.
pub fn local_os_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

/// Load a login from a private key file, deriving the public half.
fn login_from_file(path: &Path) -> Result<Login> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::identity(format!("cannot read {}: {e}", path.display())))?;
    let private = PrivateKey::from_openssh(&content)
        .map_err(|e| Error::identity(format!("cannot parse {}: {e}", path.display())))?;

    match private.algorithm() {
        Algorithm::Rsa { .. }
        | Algorithm::Dsa
        | Algorithm::Ecdsa { .. }
        | Algorithm::Ed25519 => {}
        other => {
            return Err(Error::UnsupportedKey {
                algorithm: other.to_string(),
            })
        }
    }

    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| Error::identity(format!("failed to encode public key: {e}")))?;
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Login {
        username: label,
        key: KeyPair {
            public,
            private: Some(content),
        },
    })
}

/// One key as returned by the discovery service.
#[derive(Debug, Deserialize)]
struct DiscoveredKey {
    #[allow(dead_code)]
    id: u64,
    key: String,
}

/// Fetch a user's public SSH keys from the discovery service. Every key
/// becomes a public-only login labelled `name<index>`.
async fn logins_from_discovery(name: &str, base: &str) -> Result<Vec<Login>> {
    let url = format!("{base}/users/{name}/keys");
    debug!(url = %url, "fetching public keys");
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| Error::identity(format!("cannot fetch keys for '{name}': {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::identity(format!(
            "cannot fetch keys for '{name}': {}",
            resp.status()
        )));
    }
    let keys: Vec<DiscoveredKey> = resp
        .json()
        .await
        .map_err(|e| Error::identity(format!("malformed key list for '{name}': {e}")))?;
    if keys.is_empty() {
        return Err(Error::identity(format!("'{name}' has no public keys")));
    }
    Ok(keys
        .into_iter()
        .enumerate()
        .map(|(i, k)| Login {
            username: format!("{name}{i}"),
            key: KeyPair {
                public: k.key,
                private: None,
            },
        })
        .collect())
}

/// Login labels within one identity must be unique; collisions get an index
/// appended.
fn dedup_labels(logins: &mut [Login]) {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for login in logins.iter_mut() {
        let count = seen.entry(login.username.clone()).or_insert(0);
        if *count > 0 {
            login.username = format!("{}{}", login.username, count);
        }
        *count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_generated_key(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let pair = KeyPair::generate().unwrap();
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(pair.private.unwrap().as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn anonymous_identity() {
        let me = local_os_user();
        let i = Identity::make("").await.unwrap();
        assert!(i.anonymous);
        assert_eq!(i.username, me);
        assert_eq!(i.logins.len(), 1);

        for users in [i.login_users(), i.announce_users()] {
            assert_eq!(users.len(), 1);
            let user = &users[&me];
            assert_eq!(user.username, me);
            assert_eq!(user.allowed_logins, vec![me.clone()]);
            assert!(!user.key.public.is_empty());
            // Anonymous identities travel with their private key.
            assert!(user.key.private.is_some());
        }
    }

    #[tokio::test]
    async fn named_identity_from_files() {
        let me = local_os_user();
        let dir = tempfile::tempdir().unwrap();
        let one = write_generated_key(&dir, "one");
        let two = write_generated_key(&dir, "two");

        let source = format!("{},{}", one.display(), two.display());
        let i = Identity::make(&source).await.unwrap();
        assert!(!i.anonymous);
        assert_eq!(i.logins.len(), 2);
        assert_ne!(i.logins[0].username, i.logins[1].username);

        for (label, login) in [("one", &i.logins[0]), ("two", &i.logins[1])] {
            assert_eq!(login.username, label);
            assert!(!login.key.public.is_empty());
            assert!(login.key.private.is_some());
        }

        let users = i.login_users();
        for label in ["one", "two"] {
            let user = &users[label];
            assert_eq!(user.allowed_logins[0], me, "local user must come first");
            assert_eq!(user.allowed_logins[1], label);
            assert!(!user.key.public.is_empty());
        }

        // Private keys must never be announced for named identities.
        for user in i.announce_users().values() {
            assert!(user.key.private.is_none());
        }
    }

    #[test]
    fn identity_from_file_has_one_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_generated_key(&dir, "id_ed25519");
        let i = Identity::from_file(&path).unwrap();
        assert!(!i.anonymous);
        assert_eq!(i.logins.len(), 1);
        assert_eq!(i.logins[0].username, "id_ed25519");
    }

    #[test]
    fn unreadable_file_is_identity_invalid() {
        let err = Identity::from_file("/nonexistent/id_rsa").unwrap_err();
        assert!(matches!(err, Error::IdentityInvalid { .. }));
    }

    #[tokio::test]
    async fn remote_logins_from_discovery_service() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/users/{name}/keys",
            get(|| async {
                Json(serde_json::json!([
                    {"id": 1, "key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINRHlNW52FYlU/5DcNv/dWdr23dIHEGiPUziQX7ICCTm a"},
                    {"id": 2, "key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl b"},
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let i = Identity::make_at("kontsevoy", &base).await.unwrap();
        assert!(!i.anonymous);
        assert_eq!(i.logins.len(), 2);
        assert_eq!(i.logins[0].username, "kontsevoy0");
        assert_eq!(i.logins[1].username, "kontsevoy1");
        for login in &i.logins {
            assert!(!login.key.public.is_empty());
            assert!(login.key.private.is_none(), "remote keys are public-only");
        }
    }

    #[tokio::test]
    async fn empty_remote_key_list_fails() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/users/{name}/keys",
            get(|| async { Json(serde_json::json!([])) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let err = Identity::make_at("nobody", &base).await.unwrap_err();
        assert!(matches!(err, Error::IdentityInvalid { .. }));
    }

    #[test]
    fn private_key_for_trims_whitespace() {
        let pair = KeyPair::generate().unwrap();
        let i = Identity {
            anonymous: true,
            username: "u".into(),
            logins: vec![Login {
                username: "u".into(),
                key: pair.clone(),
            }],
        };
        let padded = format!("  {}\n", pair.public);
        assert_eq!(i.private_key_for(&padded), pair.private.as_deref());
        assert_eq!(i.private_key_for("ssh-ed25519 AAAA nope"), None);
    }

    #[test]
    fn duplicate_labels_get_indexed() {
        let key = KeyPair::generate().unwrap();
        let mut logins = vec![
            Login {
                username: "id_rsa".into(),
                key: key.clone(),
            },
            Login {
                username: "id_rsa".into(),
                key: key.clone(),
            },
            Login {
                username: "id_rsa".into(),
                key,
            },
        ];
        dedup_labels(&mut logins);
        assert_eq!(logins[0].username, "id_rsa");
        assert_eq!(logins[1].username, "id_rsa1");
        assert_eq!(logins[2].username, "id_rsa2");
    }
}
