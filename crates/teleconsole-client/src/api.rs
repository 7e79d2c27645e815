//! HTTP client for the broker control protocol.
//!
//! The broker provisions disposable SSH proxies on demand; this client
//! drives the conversation: version handshake, session creation, publishing
//! the live session id, and fetching details/stats. The broker pins
//! conversations to a backend via cookies, so one client instance (and its
//! cookie jar) must be used for a whole conversation.

use rand::RngCore;
use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode};
use tracing::{debug, info};
use url::Url;

use teleconsole_core::constants::{
    CLIENT_VERSION_HEADER, MAX_VERSION_REDIRECTS, WEB_SESSION_ID_BYTES,
};
use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::session::{ServerVersion, Session, SessionSecrets, SessionStats};
use teleconsole_core::{Error, Result};

use crate::conf::Config;

/// Client for the broker's HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    /// Web session id of the session this client created, if any.
    session_id: String,
    endpoint: Url,
    client_version: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Creates an API client for the configured endpoint.
    pub fn new(config: &Config, client_version: &str) -> Result<ApiClient> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            // The broker uses cookies to pin us to a backend.
            .cookie_store(true)
            // Redirects are protocol-visible; check_version handles them.
            .redirect(reqwest::redirect::Policy::none());
        if config.insecure_https {
            println!("\x1b[1mWARNING:\x1b[0m running in insecure mode!");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(|e| Error::Config {
            message: format!("cannot initialize HTTP client: {e}"),
        })?;
        Ok(ApiClient {
            session_id: String::new(),
            endpoint: config.api_endpoint_url.clone(),
            client_version: client_version.to_string(),
            http,
        })
    }

    /// The endpoint this client currently talks to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Hostname of the current endpoint, without the port.
    pub fn endpoint_host(&self) -> String {
        self.endpoint.host_str().unwrap_or_default().to_string()
    }

    pub fn set_endpoint(&mut self, endpoint: Url) {
        self.endpoint = endpoint;
    }

    /// Web session id generated by [`ApiClient::request_new_session`].
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reports our version to the server and receives its own, plus an
    /// optional warning banner which is printed for the user. Every new API
    /// conversation must start here.
    ///
    /// The server may answer with a 307 pointing at a less busy region; at
    /// most [`MAX_VERSION_REDIRECTS`] redirects are followed, rewriting the
    /// endpoint each time.
    pub async fn check_version(&mut self) -> Result<ServerVersion> {
        for _ in 0..=MAX_VERSION_REDIRECTS {
            info!("getting version from {}", self.endpoint);
            let resp = self.get("/api/version").await?;
            if resp.status() == StatusCode::TEMPORARY_REDIRECT {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::BrokerProtocol {
                        status: StatusCode::TEMPORARY_REDIRECT.as_u16(),
                        message: "invalid redirect from the server".into(),
                    })?;
                self.endpoint = Url::parse(location).map_err(|_| Error::BrokerProtocol {
                    status: StatusCode::TEMPORARY_REDIRECT.as_u16(),
                    message: format!("invalid redirect from the server to '{location}'"),
                })?;
                continue;
            }
            if resp.status() != StatusCode::OK {
                return Err(http_error(resp).await);
            }
            let version: ServerVersion = resp.json().await.map_err(|e| Error::VersionMismatch {
                message: e.to_string(),
            })?;
            if !version.warning.is_empty() {
                println!("\x1b[1mWARNING:\x1b[0m {}", version.warning);
            }
            info!("connecting to {}", self.endpoint);
            return Ok(version);
        }
        Err(Error::BrokerProtocol {
            status: StatusCode::TEMPORARY_REDIRECT.as_u16(),
            message: "too many redirects from the server".into(),
        })
    }

    /// Asks the broker for a disposable SSH proxy pre-configured to trust
    /// the local site, passing along the session secrets.
    ///
    /// Returns the server's echo of the descriptor, which carries the
    /// `host:port` of the newly created proxy.
    pub async fn request_new_session(
        &mut self,
        login: &str,
        secrets: SessionSecrets,
        node_host_port: &str,
        invited_port: Option<ForwardedPort>,
    ) -> Result<Session> {
        info!(login, forwarding = ?invited_port, "requesting a new session");

        let mut sid_bytes = [0u8; WEB_SESSION_ID_BYTES];
        rand::rng().fill_bytes(&mut sid_bytes);
        self.session_id = hex::encode(sid_bytes);

        let session = Session {
            id: self.session_id.clone(),
            tsid: String::new(),
            secrets,
            login: login.to_string(),
            proxy_host_port: String::new(),
            node_host_port: node_host_port.to_string(),
            forwarded_port: invited_port,
        };

        let resp = self.post_json("/api/sessions", &session).await?;
        if resp.status() != StatusCode::OK {
            return Err(http_error(resp).await);
        }
        resp.json().await.map_err(|e| Error::VersionMismatch {
            message: e.to_string(),
        })
    }

    /// Publishes the internal session id of the live terminal, linking the
    /// broker session to a running PTY. Fired exactly once per broadcast.
    pub async fn publish_session_id(&self, internal_sid: &str) -> Result<()> {
        let path = format!("/api/session/{}", self.session_id);
        let resp = self.post_text(&path, internal_sid.to_string()).await?;
        if resp.status() != StatusCode::OK {
            return Err(http_error(resp).await);
        }
        Ok(())
    }

    /// Fetches the session details (keys) for a given web session id.
    ///
    /// The broker always sends the proxy's CA material; for anonymous
    /// sessions it sends single-use user keys too. Named sessions require
    /// the joiner's own key from `~/.ssh`.
    pub async fn get_session_details(&self, wsid: &str) -> Result<Session> {
        let resp = self.get(&format!("/api/sessions/{wsid}")).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::SessionNotFound(wsid.to_string()));
        }
        if resp.status() != StatusCode::OK {
            return Err(http_error(resp).await);
        }
        resp.json().await.map_err(|e| Error::VersionMismatch {
            message: e.to_string(),
        })
    }

    /// Fetches who is connected to a session; polled during tunnel
    /// detection until the broadcaster sees itself.
    pub async fn get_session_stats(&self, wsid: &str) -> Result<SessionStats> {
        let resp = self.get(&format!("/api/sessions/{wsid}/stats")).await?;
        if resp.status() != StatusCode::OK {
            return Err(http_error(resp).await);
        }
        resp.json().await.map_err(|e| Error::VersionMismatch {
            message: e.to_string(),
        })
    }

    /// URL of the session's web UI, as printed for the user. The `:443` of
    /// an https endpoint is dropped for readability.
    pub fn friendly_proxy_url(&self) -> String {
        let mut url = self.endpoint.to_string();
        if let Some(host) = self.endpoint.host_str() {
            if self.endpoint.scheme() == "https" && self.endpoint.port() == Some(443) {
                url = url.replace(&format!("{host}:443"), host);
            }
        }
        url.trim_end_matches('/').to_string()
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let url = self.url_for(path)?;
        self.http
            .get(url.clone())
            .header(CLIENT_VERSION_HEADER, &self.client_version)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))
    }

    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<Response> {
        let url = self.url_for(path)?;
        self.http
            .post(url.clone())
            .header(CLIENT_VERSION_HEADER, &self.client_version)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))
    }

    async fn post_text(&self, path: &str, body: String) -> Result<Response> {
        let url = self.url_for(path)?;
        self.http
            .post(url.clone())
            .header(CLIENT_VERSION_HEADER, &self.client_version)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.endpoint.join(path).map_err(|e| Error::Config {
            message: format!("invalid API path '{path}': {e}"),
        })
    }

    /// Classifies a network-level failure. Unknown-authority TLS errors get
    /// their own kind so the CLI can suggest `--insecure`.
    fn transport_error(&self, url: &Url, err: reqwest::Error) -> Error {
        let chain = format!("{err:?}");
        debug!(error = %chain, "transport error");
        if chain.contains("UnknownIssuer")
            || chain.contains("InvalidCertificate")
            || chain.contains("self-signed")
            || chain.to_ascii_lowercase().contains("certificate")
        {
            return Error::UntrustedCertificate {
                url: url.to_string(),
            };
        }
        Error::BrokerTransport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Converts a non-200 HTTP response into an error. Bodies of the shape
/// `{"message": "..."}` surface the message; anything else is passed
/// through as raw text.
async fn http_error(resp: Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or(body);
    Error::BrokerProtocol { status, message }
}
