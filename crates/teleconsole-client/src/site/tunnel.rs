//! Reverse tunnel from the local site to the disposable proxy.
//!
//! The site dials out, authenticates with its host key, and asks the proxy
//! to forward joiner connections back over the tunnel. Forwarded channels
//! are piped into the site's own SSH listener. The SSH keepalive doubles as
//! the tunnel heartbeat; when the proxy goes silent for the idle timeout,
//! the connection drops and the broadcast ends with it.

use std::sync::Arc;

use russh::client::{self, Handler};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::LocalSite;

struct TunnelHandler {
    /// Parsed CA keys of the proxy we agreed to trust.
    trusted: Vec<PublicKey>,
    /// `host:port` of the site's own SSH listener.
    local_ssh: String,
}

impl Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let trusted = self
            .trusted
            .iter()
            .any(|ca| ca.key_data() == server_public_key.key_data());
        if !trusted {
            warn!("proxy presented a host key outside the session's CA set");
        }
        Ok(trusted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            via = %format!("{connected_address}:{connected_port}"),
            party = %format!("{originator_address}:{originator_port}"),
            "joiner routed through the tunnel"
        );
        let local_ssh = self.local_ssh.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&local_ssh).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await
                    {
                        debug!(error = %e, "tunneled connection ended");
                    }
                }
                Err(e) => warn!(error = %e, "cannot reach the local SSH listener"),
            }
        });
        Ok(())
    }
}

/// Runs the tunnel until the proxy connection dies or the site shuts down.
/// A dead tunnel stops the site, which terminates the broadcast.
pub async fn run(site: Arc<LocalSite>, proxy_addr: String) {
    let mut shutdown_rx = site.shutdown_tx.subscribe();
    let result = tokio::select! {
        r = maintain(&site, &proxy_addr) => r,
        _ = shutdown_rx.changed() => return,
    };
    if let Err(e) = result {
        error!(proxy = %proxy_addr, error = %e, "reverse tunnel lost");
        site.stop().await;
    }
}

async fn maintain(site: &Arc<LocalSite>, proxy_addr: &str) -> teleconsole_core::Result<()> {
    let heartbeat = site.config().heartbeat();
    let config = Arc::new(client::Config {
        keepalive_interval: Some(heartbeat),
        keepalive_max: 3,
        inactivity_timeout: Some(site.config().idle_timeout()),
        ..Default::default()
    });

    let trusted = site
        .trusted_ca_keys()
        .iter()
        .filter_map(|key| match PublicKey::from_openssh(key.trim()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, "skipping unparseable proxy CA key");
                None
            }
        })
        .collect();
    let handler = TunnelHandler {
        trusted,
        local_ssh: site.config().ssh_addr(),
    };

    info!(proxy = %proxy_addr, "opening reverse tunnel");
    let mut handle = client::connect(config, proxy_addr, handler)
        .await
        .map_err(teleconsole_core::Error::ssh)?;

    let host_key = site.host_key();
    let hash = if matches!(host_key.algorithm(), russh::keys::Algorithm::Rsa { .. }) {
        Some(HashAlg::Sha512)
    } else {
        None
    };
    let auth = handle
        .authenticate_publickey(
            site.config().site_name.as_str(),
            PrivateKeyWithHashAlg::new(host_key, hash),
        )
        .await
        .map_err(teleconsole_core::Error::ssh)?;
    if !auth.success() {
        return Err(teleconsole_core::Error::ssh("proxy rejected the site's host key"));
    }

    let ssh_port = site.config().ports.ssh;
    handle
        .tcpip_forward("", ssh_port as u32)
        .await
        .map_err(teleconsole_core::Error::ssh)?;
    info!(proxy = %proxy_addr, "reverse tunnel established");

    // The keepalive machinery heartbeats underneath; we only watch for the
    // connection to go away.
    loop {
        tokio::time::sleep(heartbeat).await;
        if handle.is_closed() {
            return Err(teleconsole_core::Error::ssh("tunnel connection closed"));
        }
    }
}
