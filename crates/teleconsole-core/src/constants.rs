//! Protocol and configuration constants for teleconsole.

use std::time::Duration;

// =============================================================================
// Broker Protocol Constants
// =============================================================================

/// HTTP header carrying the client's semver on every broker request.
pub const CLIENT_VERSION_HEADER: &str = "X-Client-Version";

/// Length of the broker-scoped web session id, in hex characters.
pub const WEB_SESSION_ID_LEN: usize = 40;

/// Number of random bytes behind a web session id.
pub const WEB_SESSION_ID_BYTES: usize = 20;

/// Maximum number of 307 redirects followed during the version handshake.
pub const MAX_VERSION_REDIRECTS: usize = 2;

// =============================================================================
// Endpoint Constants
// =============================================================================

/// Default broker host (the first endpoint in the geo table).
pub const DEFAULT_SERVER_HOST: &str = "teleconsole.com";

/// Default broker port (HTTPS).
pub const DEFAULT_SERVER_PORT: u16 = 443;

/// How long endpoint selection waits before falling back to the default.
pub const ENDPOINT_PING_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Broadcast Constants
// =============================================================================

/// Name of the embedded SSH site on the broadcaster's machine.
pub const DEFAULT_SITE_NAME: &str = "teleconsole-client";

/// Number of ephemeral TCP ports allocated for the local site.
pub const FREE_PORT_COUNT: usize = 5;

/// Minimum time for the local site and the disposable proxy to synchronize
/// session state. The tunnel heartbeat is derived from this.
pub const SYNC_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Number of stats probes before the tunnel is declared broken.
pub const TUNNEL_PROBE_ATTEMPTS: usize = 10;

/// Idle timeout on the reverse tunnel, as a multiple of the heartbeat period.
pub const HEARTBEAT_IDLE_MULTIPLIER: u32 = 10;

// =============================================================================
// Join Constants
// =============================================================================

/// Number of SSH connect attempts when joining a session.
pub const JOIN_ATTEMPTS: u32 = 3;

/// Delay between join attempts.
pub const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Local bind address for a session's invited forwarded port.
pub const INVITED_PORT_BIND_IP: &str = "127.0.0.1";

/// Local bind port for a session's invited forwarded port.
pub const INVITED_PORT_BIND_PORT: u16 = 9000;

// =============================================================================
// Identity Constants
// =============================================================================

/// Base URL of the public SSH key discovery service.
pub const KEY_DISCOVERY_URL: &str = "https://api.github.com";

// =============================================================================
// Default Values
// =============================================================================

/// Default TERM when none can be determined.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Environment variable that forces debug-level logging.
pub const DEBUG_ENV_VAR: &str = "TELECONSOLE_DEBUG";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_session_id_lengths_agree() {
        assert_eq!(WEB_SESSION_ID_BYTES * 2, WEB_SESSION_ID_LEN);
    }

    #[test]
    fn heartbeat_timing_is_sane() {
        // The tunnel must notice a dead proxy well before the probe loop
        // gives up on it.
        let heartbeat = SYNC_REFRESH_INTERVAL * 2;
        assert!(heartbeat < ENDPOINT_PING_TIMEOUT * 2);
        assert!(HEARTBEAT_IDLE_MULTIPLIER >= 2);
    }
}
