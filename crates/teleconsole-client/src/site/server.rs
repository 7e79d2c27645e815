//! SSH server loop of the local site.
//!
//! Authenticates parties against the announced users, attaches them to the
//! live terminal (spawning it for the first arrival), and serves
//! direct-tcpip channels for invited port forwards.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use teleconsole_core::constants::{DEFAULT_COLS, DEFAULT_ROWS};

use super::{LiveSession, LocalSite};

/// Environment variable a joiner sets to pick a specific live session.
pub const SESSION_ENV_VAR: &str = "TELECONSOLE_SESSION";

/// Builds the russh server configuration for a site.
pub fn russh_config(site: &LocalSite) -> russh::server::Config {
    russh::server::Config {
        keys: vec![(*site.host_key()).clone()],
        auth_rejection_time: std::time::Duration::from_secs(1),
        auth_rejection_time_initial: Some(std::time::Duration::ZERO),
        inactivity_timeout: None,
        ..Default::default()
    }
}

/// Per-connection handler state.
pub struct ServerHandler {
    site: Arc<LocalSite>,
    peer: SocketAddr,
    /// Login the connection authenticated as.
    login: Option<String>,
    term: Option<String>,
    pty_size: Option<(u16, u16)>,
    /// Session id requested via the environment, if any.
    requested_session: Option<String>,
    /// Live sessions by channel, for input routing.
    attached: HashMap<ChannelId, Arc<LiveSession>>,
}

impl ServerHandler {
    pub fn new(site: Arc<LocalSite>, peer: SocketAddr) -> ServerHandler {
        ServerHandler {
            site,
            peer,
            login: None,
            term: None,
            pty_size: None,
            requested_session: None,
            attached: HashMap::new(),
        }
    }

    /// True when `offered` belongs to a user that may log in as `login`.
    fn key_matches_user(&self, login: &str, offered: &PublicKey) -> bool {
        for user in self.site.users().values() {
            if user.username != login && !user.allowed_logins.iter().any(|l| l == login) {
                continue;
            }
            match PublicKey::from_openssh(user.key.public.trim()) {
                Ok(known) if known.key_data() == offered.key_data() => return true,
                Ok(_) => {}
                Err(e) => debug!(user = %user.username, error = %e, "unparseable announced key"),
            }
        }
        false
    }

    /// Finds the session to attach to, spawning the first one on demand.
    fn attach_target(&mut self, command: Option<String>) -> teleconsole_core::Result<Arc<LiveSession>> {
        if let Some(sid) = &self.requested_session {
            if let Some(live) = self.site.registry().get(sid) {
                return Ok(live);
            }
        }
        if let Some(live) = self.site.registry().first() {
            return Ok(live);
        }
        let size = self.pty_size.unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        let term = self
            .term
            .clone()
            .unwrap_or_else(LocalSite::default_term);
        self.site.spawn_session(command, size, &term)
    }

    /// Wires a channel to a live session: output pumps until the shell
    /// exits, input is routed through [`ServerHandler::attached`].
    fn attach(&mut self, channel_id: ChannelId, session: &mut Session, live: Arc<LiveSession>) {
        let handle = session.handle();
        let mut output = live.subscribe_output();
        let mut closed = live.closed();
        self.attached.insert(channel_id, live);

        tokio::spawn(async move {
            while !*closed.borrow() {
                tokio::select! {
                    out = output.recv() => match out {
                        Ok(bytes) => {
                            if handle.data(channel_id, CryptoVec::from(bytes)).await.is_err() {
                                return;
                            }
                        }
                        // Slow party: skip what it missed, keep streaming.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = closed.changed() => break,
                }
            }
            let _ = handle.exit_status_request(channel_id, 0).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.key_matches_user(user, public_key) {
            Ok(Auth::Accept)
        } else {
            debug!(user, peer = %self.peer, "offered key does not match any announced user");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.key_matches_user(user, public_key) {
            debug!(user, peer = %self.peer, "party authenticated");
            self.login = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        Ok(true)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == SESSION_ENV_VAR {
            self.requested_session = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.term = Some(term.to_string());
        self.pty_size = Some((col_width as u16, row_height as u16));
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.login.is_none() {
            return Err(russh::Error::Inconsistent);
        }
        let command = self.site.take_run_command();
        match self.attach_target(command) {
            Ok(live) => {
                debug!(channel = ?channel_id, session = %live.id(), "party attached");
                self.attach(channel_id, session, live);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to start shell");
                Err(russh::Error::Inconsistent)
            }
        }
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.login.is_none() {
            return Err(russh::Error::Inconsistent);
        }
        let command = String::from_utf8_lossy(data).to_string();
        match self.attach_target(Some(command)) {
            Ok(live) => {
                self.attach(channel_id, session, live);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to run command");
                Err(russh::Error::Inconsistent)
            }
        }
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(live) = self.attached.get(&channel_id) {
            live.write_input(data.to_vec()).await;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(live) = self.attached.get(&channel_id) {
            live.resize(col_width as u16, row_height as u16).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.attached.remove(&channel_id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.attached.remove(&channel_id);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.login.is_none() {
            return Ok(false);
        }
        debug!(
            dest = %format!("{host_to_connect}:{port_to_connect}"),
            orig = %format!("{originator_address}:{originator_port}"),
            "direct-tcpip request"
        );
        let target = format!("{host_to_connect}:{port_to_connect}");
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await
                    {
                        debug!(error = %e, "forwarded connection ended");
                    }
                }
                Err(e) => warn!(target = %target, error = %e, "cannot reach forward target"),
            }
        });
        Ok(true)
    }
}
