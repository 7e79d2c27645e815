//! The local SSH site: an embedded SSH server on the broadcaster's machine.
//!
//! The broadcaster logs into this site as itself; joiners are routed into it
//! by the disposable proxy through the reverse tunnel the site maintains.
//! The site owns the live session registry; the publisher consumes session
//! events over a channel, so nothing reaches back into the running server.

mod server;
mod tunnel;

pub use server::SESSION_ENV_VAR;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{CommandBuilder, PtySize};
use rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use teleconsole_core::constants::{DEFAULT_TERM, FREE_PORT_COUNT, HEARTBEAT_IDLE_MULTIPLIER};
use teleconsole_core::identity::UserMap;
use teleconsole_core::net::get_free_ports;
use teleconsole_core::session::{CertAuthority, SessionSecrets};
use teleconsole_core::{Error, Result};

/// TCP ports the site binds. Allocated up front so the session descriptor
/// can be populated before the site starts.
#[derive(Debug, Clone)]
pub struct SitePorts {
    /// SSH listener joiners and the broadcaster itself connect to.
    pub ssh: u16,
    /// Local half of the reverse tunnel.
    pub tunnel: u16,
    /// Spares kept for parity with the session descriptor's port block.
    pub reserved: Vec<u16>,
}

impl SitePorts {
    /// Grabs [`FREE_PORT_COUNT`] free ports from the OS.
    pub fn allocate() -> Result<SitePorts> {
        let ports = get_free_ports(FREE_PORT_COUNT)?;
        Ok(SitePorts {
            ssh: ports[0],
            tunnel: ports[1],
            reserved: ports[2..].to_vec(),
        })
    }
}

/// Configuration of the local site, threaded down from the CLI.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub site_name: String,
    pub hostname: String,
    pub ports: SitePorts,
    /// Session-state sync cadence shared with the disposable proxy.
    pub refresh_interval: Duration,
    /// Scratch directory, deleted when the broadcast ends.
    pub data_dir: PathBuf,
}

impl SiteConfig {
    /// `host:port` of the SSH listener.
    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.ports.ssh)
    }

    /// Reverse tunnel heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        self.refresh_interval * 2
    }

    /// Idle timeout after which a silent tunnel is considered dead.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat() * HEARTBEAT_IDLE_MULTIPLIER
    }
}

/// A live PTY session on the site.
///
/// Input fans in over a channel; output fans out over a broadcast channel so
/// any number of parties can attach to the same terminal.
pub struct LiveSession {
    id: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    closed_rx: watch::Receiver<bool>,
}

impl LiveSession {
    /// Internal session id, published to the broker.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    /// Watch that flips to `true` when the shell exits.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub async fn write_input(&self, bytes: Vec<u8>) {
        let _ = self.input_tx.send(bytes).await;
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows)).await;
    }

    /// Spawns a PTY running `command` (or the user's shell) and registers
    /// the session.
    fn spawn(
        registry: Arc<SessionRegistry>,
        command: Option<String>,
        size: (u16, u16),
        term: &str,
    ) -> Result<Arc<LiveSession>> {
        let id = uuid::Uuid::new_v4().to_string();
        let (cols, rows) = size;

        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(Error::ssh)?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut builder = CommandBuilder::new(&shell);
        if let Some(command) = &command {
            builder.arg("-c");
            builder.arg(command);
        }
        builder.env("TERM", term);
        let mut child = pair.slave.spawn_command(builder).map_err(Error::ssh)?;
        let master = pair.master;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(1024);
        let (closed_tx, closed_rx) = watch::channel(false);

        // PTY -> parties.
        let mut reader = master.try_clone_reader().map_err(Error::ssh)?;
        let reader_output = output_tx.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(n) if n > 0 => {
                        // No receivers is fine: parties may lag behind.
                        let _ = reader_output.send(buf[..n].to_vec());
                    }
                    _ => break,
                }
            }
        });

        // Parties -> PTY.
        let mut writer = master.take_writer().map_err(Error::ssh)?;
        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = input_rx.blocking_recv() {
                if std::io::Write::write_all(&mut writer, &bytes).is_err() {
                    break;
                }
            }
        });

        // Terminal resizes, from whoever attached last.
        tokio::spawn(async move {
            while let Some((cols, rows)) = resize_rx.recv().await {
                if let Err(e) = master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    warn!(error = %e, "failed to resize PTY");
                }
            }
        });

        let session = Arc::new(LiveSession {
            id: id.clone(),
            input_tx,
            output_tx,
            resize_tx,
            closed_rx,
        });
        registry.insert(session.clone());

        // Reap the child; the session ends when the shell does.
        let reap_registry = registry;
        let reap_id = id;
        tokio::task::spawn_blocking(move || {
            let status = child.wait();
            debug!(session = %reap_id, status = ?status, "shell exited");
            reap_registry.remove(&reap_id);
            let _ = closed_tx.send(true);
        });

        Ok(session)
    }
}

/// In-memory registry of live sessions.
///
/// The site's server loop mutates it; the publisher only consumes the event
/// channel handed out by [`SessionRegistry::subscribe`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Arc<LiveSession>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::default())
    }

    fn insert(&self, session: Arc<LiveSession>) {
        let id = session.id().to_string();
        self.sessions.lock().unwrap().push(session);
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(id.clone()).is_ok());
    }

    fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().retain(|s| s.id() != id);
    }

    pub fn list(&self) -> Vec<Arc<LiveSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn first(&self) -> Option<Arc<LiveSession>> {
        self.sessions.lock().unwrap().first().cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<LiveSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Stream of session ids, starting with the sessions already live. The
    /// channel ends when the registry is dropped with the site.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Hold the sessions lock so an insert cannot slip between the
        // replay and the registration.
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.iter() {
            let _ = tx.send(session.id().to_string());
        }
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// The local SSH site.
pub struct LocalSite {
    config: SiteConfig,
    host_key: Arc<PrivateKey>,
    secrets: SessionSecrets,
    users: Mutex<UserMap>,
    trusted_cas: Mutex<Vec<CertAuthority>>,
    tunnel_addr: Mutex<Option<String>>,
    registry: Arc<SessionRegistry>,
    run_command: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalSite {
    /// Creates a site seeded with the announced users. Generates a fresh
    /// host key which doubles as the site's CA.
    pub fn new(config: SiteConfig, announce_users: UserMap) -> Result<Arc<LocalSite>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::ssh(format!("failed to generate host key: {e}")))?;
        let host_public = host_key
            .public_key()
            .to_openssh()
            .map_err(|e| Error::ssh(format!("failed to encode host key: {e}")))?;
        // The key is scratch state like the rest of the data dir; keeping it
        // on disk aids debugging a live broadcast.
        let key_path = config.data_dir.join("host_ed25519_key");
        std::fs::write(
            &key_path,
            host_key
                .to_openssh(ssh_key::LineEnding::LF)
                .map_err(|e| Error::ssh(format!("failed to encode host key: {e}")))?
                .as_bytes(),
        )?;

        let secrets = SessionSecrets {
            site_name: config.site_name.clone(),
            listen_addr: format!("{}:{}", config.hostname, config.ports.tunnel),
            cas: vec![CertAuthority {
                domain: config.site_name.clone(),
                public_key: host_public,
            }],
            users: announce_users.clone(),
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(LocalSite {
            config,
            host_key: Arc::new(host_key),
            secrets,
            users: Mutex::new(announce_users),
            trusted_cas: Mutex::new(Vec::new()),
            tunnel_addr: Mutex::new(None),
            registry: SessionRegistry::new(),
            run_command: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Secrets to announce with a new session: our CA, tunnel address, and
    /// allowed users.
    pub fn secrets(&self) -> &SessionSecrets {
        &self.secrets
    }

    /// Trusts the CA material of the disposable proxy and records its
    /// reverse tunnel address.
    pub fn trust(&self, secrets: &SessionSecrets) {
        self.trusted_cas
            .lock()
            .unwrap()
            .extend(secrets.cas.iter().cloned());
        *self.tunnel_addr.lock().unwrap() = Some(secrets.listen_addr.clone());
    }

    /// Merges more users into the trusted set (e.g. our own login users so
    /// we can SSH into ourselves).
    pub fn add_users(&self, users: UserMap) {
        self.users.lock().unwrap().extend(users);
    }

    /// Command the first shell runs instead of an interactive shell.
    pub fn set_run_command(&self, command: Option<String>) {
        *self.run_command.lock().unwrap() = command;
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stream of live session ids; see [`SessionRegistry::subscribe`].
    pub fn session_events(&self) -> mpsc::UnboundedReceiver<String> {
        self.registry.subscribe()
    }

    /// Binds the SSH listener and, if a proxy was trusted, opens the
    /// reverse tunnel.
    pub async fn start(self: &Arc<LocalSite>) -> Result<()> {
        let addr = self.config.ssh_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "local SSH site listening");

        let accept_site = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let accept_task = tokio::spawn(async move {
            let server_config = Arc::new(server::russh_config(&accept_site));
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        debug!(peer = %peer, "inbound SSH connection");
                        let handler = server::ServerHandler::new(accept_site.clone(), peer);
                        let config = server_config.clone();
                        tokio::spawn(async move {
                            match russh::server::run_stream(config, stream, handler).await {
                                Ok(session) => {
                                    if let Err(e) = session.await {
                                        debug!(error = %e, "SSH session ended with error");
                                    }
                                }
                                Err(e) => debug!(error = %e, "SSH handshake failed"),
                            }
                        });
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.tasks.lock().unwrap().push(accept_task);

        let tunnel_addr = self.tunnel_addr.lock().unwrap().clone();
        if let Some(proxy_addr) = tunnel_addr {
            let tunnel_site = self.clone();
            let tunnel_task = tokio::spawn(async move {
                tunnel::run(tunnel_site, proxy_addr).await;
            });
            self.tasks.lock().unwrap().push(tunnel_task);
        }
        Ok(())
    }

    /// Public keys of the trusted proxy CAs, for tunnel host verification.
    pub fn trusted_ca_keys(&self) -> Vec<String> {
        self.trusted_cas
            .lock()
            .unwrap()
            .iter()
            .map(|ca| ca.public_key.clone())
            .collect()
    }

    pub(crate) fn host_key(&self) -> Arc<PrivateKey> {
        self.host_key.clone()
    }

    pub(crate) fn users(&self) -> UserMap {
        self.users.lock().unwrap().clone()
    }

    pub(crate) fn take_run_command(&self) -> Option<String> {
        self.run_command.lock().unwrap().take()
    }

    pub(crate) fn default_term() -> String {
        std::env::var("TERM").unwrap_or_else(|_| DEFAULT_TERM.to_string())
    }

    pub(crate) fn spawn_session(
        &self,
        command: Option<String>,
        size: (u16, u16),
        term: &str,
    ) -> Result<Arc<LiveSession>> {
        LiveSession::spawn(self.registry.clone(), command, size, term)
    }

    /// Signals every task to stop. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }

    /// Removes the scratch directory. Called last during teardown.
    pub fn delete_data_dir(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.config.data_dir)?;
        info!(dir = %self.config.data_dir.display(), "deleted site data directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> SiteConfig {
        SiteConfig {
            site_name: "teleconsole-client".into(),
            hostname: "127.0.0.1".into(),
            ports: SitePorts::allocate().unwrap(),
            refresh_interval: Duration::from_secs(1),
            data_dir: dir.path().join("site"),
        }
    }

    #[test]
    fn ports_allocation_matches_descriptor_block() {
        let ports = SitePorts::allocate().unwrap();
        assert_eq!(ports.reserved.len(), FREE_PORT_COUNT - 2);
        assert_ne!(ports.ssh, 0);
        assert_ne!(ports.tunnel, 0);
    }

    #[test]
    fn heartbeat_derives_from_refresh_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        assert_eq!(config.heartbeat(), Duration::from_secs(2));
        assert_eq!(
            config.idle_timeout(),
            config.heartbeat() * HEARTBEAT_IDLE_MULTIPLIER
        );
    }

    #[tokio::test]
    async fn site_secrets_carry_ca_and_users() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let tunnel_port = config.ports.tunnel;

        let mut users = UserMap::new();
        users.insert(
            "alice".into(),
            teleconsole_core::identity::TeleportUser {
                username: "alice".into(),
                key: teleconsole_core::identity::KeyPair {
                    public: "ssh-ed25519 AAAA alice".into(),
                    private: None,
                },
                allowed_logins: vec!["alice".into()],
            },
        );

        let site = LocalSite::new(config, users).unwrap();
        let secrets = site.secrets();
        assert_eq!(secrets.site_name, "teleconsole-client");
        assert_eq!(secrets.listen_addr, format!("127.0.0.1:{tunnel_port}"));
        assert_eq!(secrets.cas.len(), 1);
        assert!(secrets.cas[0].public_key.starts_with("ssh-ed25519"));
        assert!(secrets.users.contains_key("alice"));

        // Trusting proxy secrets records its CA and tunnel address.
        let proxy_secrets = SessionSecrets {
            site_name: "proxy".into(),
            listen_addr: "proxy.example:3024".into(),
            cas: vec![CertAuthority {
                domain: "proxy".into(),
                public_key: "ssh-ed25519 BBBB proxy".into(),
            }],
            users: UserMap::new(),
        };
        site.trust(&proxy_secrets);
        assert_eq!(site.trusted_ca_keys(), vec!["ssh-ed25519 BBBB proxy"]);

        site.stop().await;
        site.delete_data_dir().unwrap();
        assert!(!site.config().data_dir.exists());
    }

    #[tokio::test]
    async fn registry_streams_session_ids_to_late_subscribers() {
        let registry = SessionRegistry::new();
        let mut events = registry.subscribe();

        let session = LiveSession::spawn(
            registry.clone(),
            Some("true".into()),
            (80, 24),
            "xterm-256color",
        )
        .unwrap();
        let id = session.id().to_string();

        let seen = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        assert_eq!(seen, id);

        // A subscriber arriving after the fact still learns about it if the
        // shell is alive, and a fresh subscription replays nothing once the
        // session is gone.
        let mut closed = session.closed();
        if !*closed.borrow() {
            let mut late = registry.subscribe();
            if registry.get(&id).is_some() {
                let replayed =
                    tokio::time::timeout(Duration::from_secs(1), late.recv()).await;
                assert!(matches!(replayed, Ok(Some(ref s)) if *s == id));
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), closed.changed()).await;
        assert!(registry.get(&id).is_none());
    }
}
