//! The join engine.
//!
//! Resolves a visible session id to a broker endpoint, fetches the session,
//! selects a matching key, and attaches to the live terminal through the
//! disposable proxy.

use std::path::PathBuf;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use teleconsole_core::constants::{
    INVITED_PORT_BIND_IP, INVITED_PORT_BIND_PORT, JOIN_ATTEMPTS, JOIN_RETRY_INTERVAL,
};
use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::geo::endpoint_for_session;
use teleconsole_core::identity::{Identity, KeyPair, TeleportUser};
use teleconsole_core::net::replace_host;
use teleconsole_core::session::Session;
use teleconsole_core::{Error, Result};

use crate::api::ApiClient;
use crate::conf::Config;
use crate::site::SESSION_ENV_VAR;
use crate::ssh::{ShellOptions, SshConnection};

/// Joins someone's session given its visible id.
pub async fn join(config: &mut Config, api: &mut ApiClient, visible_sid: &str) -> Result<()> {
    if config.forward_port.is_some() {
        return Err(Error::config("-f cannot be used with join"));
    }
    println!("\x1b[1mTeleconsole:\x1b[0m joining session...");

    // The id's geo prefix tells us which broker minted it, unless the user
    // pinned an endpoint explicitly.
    let mut wsid = visible_sid.to_string();
    if !config.is_endpoint_specified() {
        let (endpoint_host, stripped) = endpoint_for_session(visible_sid);
        wsid = stripped.to_string();
        config.set_endpoint_host(endpoint_host)?;
        api.set_endpoint(config.api_endpoint_url.clone());
        debug!(endpoint = endpoint_host, "routed by session prefix");
    }

    // Request credentials from the broker.
    let mut session = api.get_session_details(&wsid).await?;
    session.proxy_host_port = replace_host(&session.proxy_host_port, &api.endpoint_host());

    let user = find_user_for(&session, config.identity_source.as_deref()).await?;

    // A session may carry a port-forwarding invite; it is always exposed on
    // a fixed local port.
    let mut forwards = config.forward_ports.clone();
    if let Some(invited) = &session.forwarded_port {
        let mut invited = invited.clone();
        invited.src_ip = INVITED_PORT_BIND_IP.to_string();
        invited.src_port = INVITED_PORT_BIND_PORT;
        print_port_invite(&session.login, &invited);
        forwards.push(invited);
    }

    info!(
        proxy = %session.proxy_host_port,
        node = %session.node_host_port,
        login = %session.login,
        "joining via disposable proxy"
    );

    let mut last_err = Error::JoinFailed {
        attempts: JOIN_ATTEMPTS,
    };
    for attempt in 1..=JOIN_ATTEMPTS {
        match try_join(&session, &user, &forwards).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "join attempt failed");
                last_err = e;
            }
        }
        if attempt < JOIN_ATTEMPTS {
            tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
        }
    }
    debug!(error = %last_err, "all join attempts failed");
    Err(Error::JoinFailed {
        attempts: JOIN_ATTEMPTS,
    })
}

async fn try_join(
    session: &Session,
    user: &TeleportUser,
    forwards: &[ForwardedPort],
) -> Result<()> {
    let conn = SshConnection::connect(
        &session.proxy_host_port,
        &session.login,
        &user.key,
        &session.secrets.cas,
    )
    .await?;

    let mut forward_tasks: Vec<JoinHandle<()>> = Vec::new();
    for fp in forwards {
        forward_tasks.push(conn.spawn_port_forward(fp.clone()).await?);
    }

    // Ask the proxy for the running terminal, not a fresh one.
    let mut env = vec![(SESSION_ENV_VAR.to_string(), session.tsid.clone())];
    env.retain(|(_, v)| !v.is_empty());

    let result = conn
        .run_shell(ShellOptions {
            command: None,
            env,
            ready: None,
            abort: None,
        })
        .await;

    for task in forward_tasks {
        task.abort();
    }
    conn.close().await;
    result.map(|_| ())
}

/// Selects the session user to authenticate as.
///
/// Sessions whose users come with private keys are anonymous: any such user
/// works as-is. Otherwise the session is key-protected and we must find a
/// local private key matching one of the announced public keys, either from
/// `-i` or from the user's SSH directory.
pub async fn find_user_for(
    session: &Session,
    identity_source: Option<&str>,
) -> Result<TeleportUser> {
    if let Some(user) = session
        .secrets
        .users
        .values()
        .find(|u| u.key.private.is_some())
    {
        debug!(user = %user.username, "anonymous session, using supplied key");
        return Ok(user.clone());
    }

    let identities = match identity_source {
        Some(source) => vec![Identity::from_file(source)?],
        None => candidate_identities(),
    };
    for identity in &identities {
        for user in session.secrets.users.values() {
            if let Some(private) = identity.private_key_for(&user.key.public) {
                debug!(user = %user.username, "matched a local private key");
                return Ok(TeleportUser {
                    username: user.username.clone(),
                    allowed_logins: user.allowed_logins.clone(),
                    key: KeyPair {
                        public: user.key.public.clone(),
                        private: Some(private.to_string()),
                    },
                });
            }
        }
    }
    Err(Error::KeyMismatch {
        message: "this session is key-protected and none of your local keys match.\n\
                  Use 'teleconsole -i <identity-file>' to specify the key to use"
            .into(),
    })
}

/// Identities from `~/.ssh/id_*` files (excluding `.pub` halves). Files
/// that do not parse as private keys are skipped.
fn candidate_identities() -> Vec<Identity> {
    let Ok(home) = std::env::var("HOME") else {
        return Vec::new();
    };
    let ssh_dir = PathBuf::from(home).join(".ssh");
    let Ok(entries) = std::fs::read_dir(&ssh_dir) else {
        return Vec::new();
    };
    let mut identities = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("id_") || name.ends_with(".pub") {
            continue;
        }
        match Identity::from_file(entry.path()) {
            Ok(identity) => identities.push(identity),
            Err(e) => debug!(file = %entry.path().display(), error = %e, "skipping key file"),
        }
    }
    identities
}

/// Human description of what an invited port does.
fn print_port_invite(login: &str, p: &ForwardedPort) {
    let friendly_src = match p.dest_port {
        80 => format!("http://localhost:{}", p.src_port),
        443 => format!("https://localhost:{}", p.src_port),
        _ => format!("localhost:{}", p.src_port),
    };
    let friendly_dest = if p.is_local_destination() {
        format!("port {} on their machine", p.dest_port)
    } else {
        format!(
            "{}:{} using their machine as proxy",
            p.dest_host, p.dest_port
        )
    };
    println!("ATTENTION: {login} has invited you to access {friendly_dest} via {friendly_src}");
}
