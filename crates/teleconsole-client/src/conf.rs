//! Process configuration: defaults, the per-user rc file, and CLI overrides.
//!
//! Everything the engines need is threaded through this struct; nothing is
//! kept in globals.

use std::path::PathBuf;

use ini::Ini;
use url::Url;

use teleconsole_core::constants::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::{Error, Result};

/// Name of the ini-style rc file in the user's home directory.
pub const CONFIG_FILE_NAME: &str = ".teleconsolerc";

/// Configuration of a teleconsole process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the broker API.
    pub api_endpoint_url: Url,

    /// Level of debugging output; greater means more.
    pub verbosity: u8,

    /// When set, this command is launched instead of a shell.
    pub run_command: Option<String>,

    /// Trust unknown TLS certificates (`--insecure`).
    pub insecure_https: bool,

    /// Ports to forward when joining (`-L`).
    pub forward_ports: Vec<ForwardedPort>,

    /// Forward-by-invite when broadcasting (`-f`).
    pub forward_port: Option<ForwardedPort>,

    /// Identity source (`-i`): a key file, a remote username, or a
    /// comma-separated list of both.
    pub identity_source: Option<String>,
}

impl Config {
    /// Default configuration overlaid with the rc file, if one exists.
    pub fn load() -> Result<Config> {
        let mut config = Config::default_config()?;
        if let Some(path) = Config::rc_file_path() {
            config.apply_rc_file(&path)?;
        }
        Ok(config)
    }

    fn default_config() -> Result<Config> {
        let mut config = Config {
            api_endpoint_url: Url::parse("https://invalid.invalid").expect("static url"),
            verbosity: 0,
            run_command: None,
            insecure_https: false,
            forward_ports: Vec::new(),
            forward_port: None,
            identity_source: None,
        };
        config.set_endpoint_host(DEFAULT_SERVER_HOST)?;
        Ok(config)
    }

    fn rc_file_path() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(CONFIG_FILE_NAME))
    }

    fn apply_rc_file(&mut self, path: &PathBuf) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let rc = Ini::load_from_file(path).map_err(|e| Error::Config {
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        if let Some(server) = rc.general_section().get("server") {
            self.set_endpoint_host(server)?;
        }
        Ok(())
    }

    /// Sets the broker endpoint from a `host` or `host:port` pair.
    pub fn set_endpoint_host(&mut self, host_port: &str) -> Result<()> {
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| Error::Config {
                    message: format!("invalid endpoint port in '{host_port}'"),
                })?;
                (host.to_string(), port)
            }
            None => (host_port.to_string(), DEFAULT_SERVER_PORT),
        };
        if host.is_empty() {
            return Err(Error::config(format!("invalid endpoint '{host_port}'")));
        }
        self.api_endpoint_url =
            Url::parse(&format!("https://{host}:{port}")).map_err(|e| Error::Config {
                message: format!("invalid endpoint '{host_port}': {e}"),
            })?;
        Ok(())
    }

    /// Hostname of the broker endpoint, without the port.
    pub fn endpoint_host(&self) -> String {
        self.api_endpoint_url
            .host_str()
            .unwrap_or(DEFAULT_SERVER_HOST)
            .to_string()
    }

    /// True when the endpoint was set via `-s` or the rc file. Geo selection
    /// and session-prefix routing only apply to the default endpoint.
    pub fn is_endpoint_specified(&self) -> bool {
        self.endpoint_host() != DEFAULT_SERVER_HOST
            || self.api_endpoint_url.port_or_known_default() != Some(DEFAULT_SERVER_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bare_config() -> Config {
        Config::default_config().unwrap()
    }

    #[test]
    fn default_endpoint() {
        let c = bare_config();
        assert_eq!(c.endpoint_host(), DEFAULT_SERVER_HOST);
        assert!(!c.is_endpoint_specified());
    }

    #[test]
    fn endpoint_without_port_gets_default() {
        let mut c = bare_config();
        c.set_endpoint_host("eu.teleconsole.com").unwrap();
        // The url crate normalizes away the default https port.
        assert_eq!(c.api_endpoint_url.as_str(), "https://eu.teleconsole.com/");
        assert_eq!(c.api_endpoint_url.port_or_known_default(), Some(443));
        assert!(c.is_endpoint_specified());
    }

    #[test]
    fn endpoint_with_port() {
        let mut c = bare_config();
        c.set_endpoint_host("localhost:8080").unwrap();
        assert_eq!(c.endpoint_host(), "localhost");
        assert_eq!(c.api_endpoint_url.port(), Some(8080));
        assert!(c.is_endpoint_specified());
    }

    #[test]
    fn bad_endpoint_is_config_error() {
        let mut c = bare_config();
        assert!(matches!(
            c.set_endpoint_host("host:not-a-port"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            c.set_endpoint_host(""),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn rc_file_presets_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "server = eu.teleconsole.com:8443").unwrap();

        let mut c = bare_config();
        c.apply_rc_file(&path).unwrap();
        assert_eq!(c.endpoint_host(), "eu.teleconsole.com");
        assert_eq!(c.api_endpoint_url.port(), Some(8443));
    }

    #[test]
    fn missing_rc_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = bare_config();
        c.apply_rc_file(&dir.path().join("does-not-exist")).unwrap();
        assert!(!c.is_endpoint_specified());
    }

    #[test]
    fn malformed_rc_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[unclosed\nserver eu").unwrap();
        let mut c = bare_config();
        assert!(matches!(
            c.apply_rc_file(&path),
            Err(Error::Config { .. })
        ));
    }
}
