//! The broadcast engine.
//!
//! Spins up the local SSH site, asks the broker for a disposable proxy,
//! maintains the reverse tunnel, publishes the live session id, and attaches
//! the local terminal to the shared shell.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use teleconsole_core::constants::{
    DEFAULT_SITE_NAME, SYNC_REFRESH_INTERVAL, TUNNEL_PROBE_ATTEMPTS,
};
use teleconsole_core::geo::session_prefix_for;
use teleconsole_core::identity::Identity;
use teleconsole_core::net::replace_host;
use teleconsole_core::{Error, Result};

use crate::api::ApiClient;
use crate::conf::Config;
use crate::site::{LocalSite, SiteConfig, SitePorts};
use crate::ssh::{ShellOptions, SshConnection};

/// Starts a new SSH session exposed to the world via a disposable proxy.
///
/// 1. Generates a new SSH keypair and creates a temporary SSH server which
///    trusts this pair.
/// 2. Sends the credentials via HTTPS to the broker, which creates a
///    single-use, single-tenant SSH proxy just for us.
/// 3. Receives the id of the server-side proxy session; sharing that id is
///    how other people join.
/// 4. Launches the shell. When the shell exits, the session terminates,
///    disconnecting all parties.
pub async fn start_broadcast(config: &Config, api: &mut ApiClient) -> Result<()> {
    if !config.forward_ports.is_empty() {
        return Err(Error::config("-L must be used with join"));
    }
    // Check API connectivity and compatibility.
    api.check_version().await?;

    // `me` always gets fresh single-use keys; `them` is who we announce.
    let me = Identity::make("").await?;
    let them = match &config.identity_source {
        Some(source) => Identity::make(source).await?,
        None => me.clone(),
    };

    let hostname = "localhost";
    println!("Starting local SSH server on {hostname}...");
    let site_config = SiteConfig {
        site_name: DEFAULT_SITE_NAME.to_string(),
        hostname: hostname.to_string(),
        ports: SitePorts::allocate()?,
        refresh_interval: SYNC_REFRESH_INTERVAL,
        data_dir: std::env::temp_dir().join(format!("teleconsole-{}", std::process::id())),
    };
    let node_host_port = site_config.ssh_addr();
    let site = LocalSite::new(site_config, them.announce_users())?;

    println!("Requesting a disposable SSH proxy for {}...", me.username);
    let mut session = api
        .request_new_session(
            &me.username,
            site.secrets().clone(),
            &node_host_port,
            config.forward_port.clone(),
        )
        .await?;
    debug!(session = %session.id, proxy = %session.proxy_host_port, "session created");

    // The issuing server does not know which DNS name it is reachable by;
    // give the proxy and tunnel addresses the endpoint's host, keep ports.
    let endpoint_host = api.endpoint_host();
    session.proxy_host_port = replace_host(&session.proxy_host_port, &endpoint_host);
    session.secrets.listen_addr = replace_host(&session.secrets.listen_addr, &endpoint_host);

    // Trust the proxy, and let us SSH into ourselves as the local OS user.
    site.trust(&session.secrets);
    site.add_users(me.login_users());
    site.set_run_command(config.run_command.clone());

    let result = run_broadcast(&site, api, &me).await;

    // Teardown runs in reverse acquisition order on every path: the SSH
    // client died inside run_broadcast, then the site, then its scratch dir.
    site.stop().await;
    if let Err(e) = site.delete_data_dir() {
        warn!(error = %e, "failed to delete site data directory");
    }
    match &result {
        Ok(()) => println!("You have ended your session broadcast and the SSH tunnel is closed."),
        Err(e) => debug!(error = %e, "broadcast ended with error"),
    }
    result
}

async fn run_broadcast(site: &Arc<LocalSite>, api: &ApiClient, me: &Identity) -> Result<()> {
    site.start().await?;
    let publisher = spawn_publisher(site, api);

    // SSH into ourselves.
    let login_users = me.login_users();
    let my_user = login_users
        .get(&me.username)
        .ok_or_else(|| Error::identity("anonymous identity lost its own login"))?;
    let conn = SshConnection::connect(
        &site.config().ssh_addr(),
        &me.username,
        &my_user.key,
        &site.secrets().cas,
    )
    .await?;

    // Once the shell exists, watch the tunnel come up; a dead tunnel aborts
    // the shell.
    let (ready_tx, ready_rx) = oneshot::channel();
    let (abort_tx, abort_rx) = watch::channel(false);
    let monitor = spawn_tunnel_monitor(api, me.anonymous, ready_rx, abort_tx);

    let shell_result = conn
        .run_shell(ShellOptions {
            command: None, // the site injects the run command into the first shell
            env: Vec::new(),
            ready: Some(ready_tx),
            abort: Some(abort_rx),
        })
        .await;
    conn.close().await;
    publisher.abort();

    // A tunnel failure is the root cause; report it over the shell's fate.
    match monitor.await {
        Ok(Err(e)) => return Err(e),
        Ok(Ok(())) | Err(_) => {}
    }
    shell_result.map(|_| ())
}

/// Waits for the local site to report its first session, then publishes the
/// internal session id to the broker exactly once.
fn spawn_publisher(site: &Arc<LocalSite>, api: &ApiClient) -> JoinHandle<()> {
    let mut events = site.session_events();
    let api = api.clone();
    let site = site.clone();
    tokio::spawn(async move {
        // The channel ends with the site; no session ever means no publish.
        let Some(sid) = events.recv().await else {
            return;
        };
        debug!(session = %sid, "publishing internal session id");
        if let Err(e) = api.publish_session_id(&sid).await {
            error!(error = %e, "failed to publish to the broker");
            site.stop().await;
        }
    })
}

/// Polls session stats until the proxy sees us (the tunnel works), then
/// prints the session banner. Gives up after [`TUNNEL_PROBE_ATTEMPTS`].
fn spawn_tunnel_monitor(
    api: &ApiClient,
    anonymous: bool,
    ready_rx: oneshot::Receiver<()>,
    abort_tx: watch::Sender<bool>,
) -> JoinHandle<Result<()>> {
    let api = api.clone();
    tokio::spawn(async move {
        if ready_rx.await.is_err() {
            // The shell never came up; its error speaks for itself.
            return Ok(());
        }
        println!("Checking status of the SSH tunnel...\r");
        let wsid = api.session_id().to_string();
        for attempt in 1..=TUNNEL_PROBE_ATTEMPTS {
            tokio::time::sleep(SYNC_REFRESH_INTERVAL).await;
            match api.get_session_stats(&wsid).await {
                Ok(stats) if !stats.parties.is_empty() => {
                    // Found ourselves: the proxy sees the tunnel.
                    print_session_banner(&api, anonymous);
                    return Ok(());
                }
                Ok(_) => debug!(attempt, "no parties yet"),
                Err(e) => {
                    debug!(attempt, error = %e, "stats poll failed");
                    let _ = abort_tx.send(true);
                    return Err(Error::TunnelNotEstablished);
                }
            }
        }
        let _ = abort_tx.send(true);
        Err(Error::TunnelNotEstablished)
    })
}

fn print_session_banner(api: &ApiClient, anonymous: bool) {
    let visible_sid = format!(
        "{}{}",
        session_prefix_for(&api.endpoint_host()),
        api.session_id()
    );
    info!(session = %visible_sid, "tunnel established");
    print!("\n\rYour Teleconsole ID: \x1b[1m{visible_sid}\x1b[0m\n\r");
    if anonymous {
        print!(
            "WebUI for this session: {}/s/{}\n\r",
            api.friendly_proxy_url(),
            api.session_id()
        );
    } else {
        // No private key was shared with the broker, so the web terminal
        // cannot log in.
        print!("WebUI not available for key-protected sessions\n\r");
    }
    print!("To stop broadcasting, exit current shell by typing 'exit' or closing the window.\n\r");
    use std::io::Write;
    let _ = std::io::stdout().flush();
}
