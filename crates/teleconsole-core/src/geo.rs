//! Geo endpoint selection.
//!
//! The broker runs in several regions. Broadcasters pick the fastest endpoint
//! by racing HTTP pings; joiners recover the region from the session id's
//! prefix. Once a prefix is published for a host it must never be reused or
//! renamed, or existing session ids stop routing.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::constants::{DEFAULT_SERVER_HOST, ENDPOINT_PING_TIMEOUT};

/// One broker endpoint and the session-id prefix it stamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    #[serde(rename = "dns_name")]
    pub hostname: &'static str,
    #[serde(rename = "session_prefix")]
    pub session_prefix: &'static str,
}

/// All known broker endpoints. The first entry is the default and keeps the
/// empty prefix for compatibility with ids minted before geo balancing.
pub static ENDPOINTS: [Endpoint; 3] = [
    Endpoint {
        hostname: DEFAULT_SERVER_HOST,
        session_prefix: "",
    },
    Endpoint {
        hostname: "eu.teleconsole.com",
        session_prefix: "eu",
    },
    Endpoint {
        hostname: "as.teleconsole.com",
        session_prefix: "as",
    },
];

/// The endpoint used when nothing faster answers.
pub fn default_endpoint() -> &'static Endpoint {
    &ENDPOINTS[0]
}

/// Returns the endpoint that answers an HTTP ping first, or the default
/// after the ping timeout.
pub async fn find_fastest_endpoint() -> &'static Endpoint {
    fastest_of(&ENDPOINTS, ENDPOINT_PING_TIMEOUT).await
}

async fn fastest_of(endpoints: &'static [Endpoint], timeout: Duration) -> &'static Endpoint {
    let (tx, mut rx) = mpsc::channel::<&'static Endpoint>(endpoints.len());
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();

    for ep in endpoints {
        let tx = tx.clone();
        let client = client.clone();
        let url = format!("http://{}/ping", ep.hostname);
        tokio::spawn(async move {
            debug!(url = %url, "ping");
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let _ = tx.send(ep).await;
                }
                Ok(resp) => debug!(url = %url, status = %resp.status(), "ping rejected"),
                Err(e) => debug!(url = %url, error = %e, "ping failed"),
            }
        });
    }
    drop(tx);

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(ep)) => {
            info!(host = ep.hostname, elapsed = ?start.elapsed(), "endpoint responded");
            ep
        }
        // Every ping failed, or nothing answered in time.
        Ok(None) | Err(_) => {
            error!("no endpoint answered the ping, falling back to default");
            default_endpoint()
        }
    }
}

/// Finds the session prefix for a given endpoint host (with or without a
/// port). Hosts not in the table get the empty prefix.
pub fn session_prefix_for(endpoint: &str) -> &'static str {
    let host = endpoint.split(':').next().unwrap_or(endpoint);
    ENDPOINTS
        .iter()
        .find(|ep| ep.hostname == host)
        .map(|ep| ep.session_prefix)
        .unwrap_or("")
}

/// Determines which endpoint minted a visible session id by looking at its
/// prefix. The longest matching non-empty prefix wins; unprefixed ids route
/// to the default endpoint.
///
/// Returns the endpoint hostname and the id with the prefix stripped.
pub fn endpoint_for_session(sid: &str) -> (&'static str, &str) {
    let mut best: Option<&'static Endpoint> = None;
    for ep in &ENDPOINTS {
        if ep.session_prefix.is_empty() || !sid.starts_with(ep.session_prefix) {
            continue;
        }
        if best.is_none_or(|b| ep.session_prefix.len() > b.session_prefix.len()) {
            best = Some(ep);
        }
    }
    match best {
        Some(ep) => (ep.hostname, &sid[ep.session_prefix.len()..]),
        None => (default_endpoint().hostname, sid),
    }
}

/// Returns true if the given visible session id starts with a geo prefix.
pub fn is_geobalanced(sid: &str) -> bool {
    let (_, stripped) = endpoint_for_session(sid);
    stripped != sid
}
