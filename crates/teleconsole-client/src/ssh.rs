//! SSH client used to attach to a shared terminal.
//!
//! The broadcaster uses it to SSH into its own site; a joiner uses it to
//! reach the broadcaster's site through the disposable proxy. In both cases
//! the server is trusted via the session's CA material, never interactively.

use std::io::{Read, Write};
use std::sync::Arc;

use russh::client::{self, Handler};
use russh::keys::{decode_secret_key, Algorithm, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use teleconsole_core::constants::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};
use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::identity::KeyPair;
use teleconsole_core::session::CertAuthority;
use teleconsole_core::{Error, Result};

/// Host trust rooted in the session's CA material.
struct TrustHandler {
    trusted: Vec<PublicKey>,
}

impl Handler for TrustHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let ok = self
            .trusted
            .iter()
            .any(|ca| ca.key_data() == server_public_key.key_data());
        if !ok {
            warn!("server host key is not vouched for by the session");
        }
        Ok(ok)
    }
}

/// Options for running the remote shell.
#[derive(Default)]
pub struct ShellOptions {
    /// Command to run instead of an interactive shell.
    pub command: Option<String>,
    /// Extra environment sent before the shell request.
    pub env: Vec<(String, String)>,
    /// Fired once the shell is created on the far side.
    pub ready: Option<oneshot::Sender<()>>,
    /// When it flips, the pump stops and the shell returns.
    pub abort: Option<watch::Receiver<bool>>,
}

/// An authenticated SSH connection.
pub struct SshConnection {
    handle: Arc<client::Handle<TrustHandler>>,
}

impl SshConnection {
    /// Dials `addr` and authenticates `login` with `key`. The server must
    /// present a host key matching one of `trusted_cas`.
    pub async fn connect(
        addr: &str,
        login: &str,
        key: &KeyPair,
        trusted_cas: &[CertAuthority],
    ) -> Result<SshConnection> {
        let private = key
            .private
            .as_deref()
            .ok_or_else(|| Error::KeyMismatch {
                message: "selected login has no private key".into(),
            })?;
        let private = decode_secret_key(private, None)
            .map_err(|e| Error::ssh(format!("cannot decode private key: {e}")))?;

        let trusted = trusted_cas
            .iter()
            .filter_map(|ca| match PublicKey::from_openssh(ca.public_key.trim()) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!(domain = %ca.domain, error = %e, "skipping unparseable CA key");
                    None
                }
            })
            .collect();

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, TrustHandler { trusted })
            .await
            .map_err(|e| Error::ssh(format!("cannot connect to {addr}: {e}")))?;

        let hash = if matches!(private.algorithm(), Algorithm::Rsa { .. }) {
            Some(HashAlg::Sha512)
        } else {
            None
        };
        let auth = handle
            .authenticate_publickey(login, PrivateKeyWithHashAlg::new(Arc::new(private), hash))
            .await
            .map_err(|e| Error::ssh(format!("authentication failed: {e}")))?;
        if !auth.success() {
            return Err(Error::ssh(format!("{addr} rejected the key for '{login}'")));
        }
        info!(addr, login, "SSH connection established");
        Ok(SshConnection {
            handle: Arc::new(handle),
        })
    }

    /// Opens a PTY, runs the shell (or command), and pumps bytes between it
    /// and the local terminal until it exits. Returns the exit status.
    pub async fn run_shell(&self, opts: ShellOptions) -> Result<u32> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(Error::ssh)?;
        for (name, value) in &opts.env {
            channel
                .set_env(false, name.as_str(), value.as_str())
                .await
                .map_err(Error::ssh)?;
        }

        let (cols, rows) = crossterm::terminal::size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        let term = std::env::var("TERM").unwrap_or_else(|_| DEFAULT_TERM.to_string());
        channel
            .request_pty(false, &term, cols as u32, rows as u32, 0, 0, &[])
            .await
            .map_err(Error::ssh)?;
        match &opts.command {
            Some(command) => channel.exec(true, command.as_str()).await.map_err(Error::ssh)?,
            None => channel.request_shell(true).await.map_err(Error::ssh)?,
        }
        if let Some(ready) = opts.ready {
            let _ = ready.send(());
        }

        let raw = crossterm::terminal::enable_raw_mode().is_ok();
        let result = pump_shell(channel, opts.abort).await;
        if raw {
            let _ = crossterm::terminal::disable_raw_mode();
        }
        // Leave the cursor on a fresh line after raw-mode output.
        println!("\r");
        result
    }

    /// Binds `fp.src_ip:fp.src_port` and forwards every accepted connection
    /// to `fp.dest_host:fp.dest_port` on the far side.
    pub async fn spawn_port_forward(&self, fp: ForwardedPort) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind((fp.src_ip.as_str(), fp.src_port)).await?;
        info!(
            listen = %format!("{}:{}", fp.src_ip, fp.src_port),
            dest = %format!("{}:{}", fp.dest_host, fp.dest_port),
            "forwarding port"
        );
        let handle = self.handle.clone();
        Ok(tokio::spawn(async move {
            loop {
                let Ok((mut stream, peer)) = listener.accept().await else {
                    break;
                };
                let opened = handle
                    .channel_open_direct_tcpip(
                        fp.dest_host.as_str(),
                        fp.dest_port as u32,
                        &peer.ip().to_string(),
                        peer.port() as u32,
                    )
                    .await;
                match opened {
                    Ok(channel) => {
                        tokio::spawn(async move {
                            let mut channel_stream = channel.into_stream();
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut stream, &mut channel_stream)
                                    .await
                            {
                                debug!(error = %e, "forwarded connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "forward channel refused"),
                }
            }
        }))
    }

    /// Closes the connection. Errors are ignored; the session is over.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
    }
}

/// Pumps stdin to the channel and channel data to stdout until the remote
/// side closes or `abort` flips.
async fn pump_shell(
    mut channel: russh::Channel<client::Msg>,
    abort: Option<watch::Receiver<bool>>,
) -> Result<u32> {
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(256);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(n) if n > 0 => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let mut abort = abort;
    let mut stdout = std::io::stdout();
    let mut exit_code = 0u32;
    loop {
        tokio::select! {
            Some(bytes) = stdin_rx.recv() => {
                channel.data(&bytes[..]).await.map_err(Error::ssh)?;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let mut stderr = std::io::stderr();
                    stderr.write_all(&data)?;
                    stderr.flush()?;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = exit_status;
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                _ => {}
            },
            _ = wait_abort(&mut abort) => break,
        }
    }
    Ok(exit_code)
}

async fn wait_abort(abort: &mut Option<watch::Receiver<bool>>) {
    match abort {
        Some(rx) => loop {
            if rx.changed().await.is_err() {
                // The monitor finished without aborting; never fire.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        },
        None => std::future::pending().await,
    }
}
