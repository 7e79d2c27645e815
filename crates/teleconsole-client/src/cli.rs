//! Command-line argument parsing.

use clap::{ArgAction, Parser, Subcommand};

use teleconsole_core::forward::ForwardedPort;
use teleconsole_core::Result;

use crate::conf::Config;

const AFTER_HELP: &str = "\
Examples:
  > teleconsole -f 5000

    Starts a shared SSH session, also letting joining parties access TCP
    port 5000 on your machine.

  > teleconsole -f gravitational.com:80

    Starts a shared SSH session, forwarding TCP port 80 to joining parties.
    They will be able to visit http://gravitational.com using your machine
    as a proxy.

  > teleconsole -L 5000:gravitational.com:80 join <session-id>

    Joins the existing session requesting to forward gravitational.com:80
    to local port 5000.

  > teleconsole -i kontsevoy

    Starts a session shared only with the \"kontsevoy\" remote user. Only a
    party with a private SSH key for \"kontsevoy\" will be able to join.";

/// Teleconsole allows you to start a new shell session and invite your
/// friends into it. Simply close the session to stop sharing.
#[derive(Debug, Parser)]
#[command(name = "teleconsole", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Verbose logging; repeat (-vv, -vvv) for more detail
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Teleconsole server address [teleconsole.com]
    #[arg(short = 's', value_name = "HOST[:PORT]")]
    pub server: Option<String>,

    /// Trust invalid SSL certificates
    #[arg(long)]
    pub insecure: bool,

    /// Invite joining parties to connect to host:port (broadcast only)
    #[arg(short = 'f', value_name = "HOST:PORT")]
    pub forward_addr: Option<String>,

    /// Request port forwarding when joining an existing session
    #[arg(short = 'L', value_name = "LISTEN:HOST:PORT")]
    pub forward_spec: Option<String>,

    /// Identity to share a session with: a key file like ~/.ssh/id_rsa, a
    /// remote username, or a comma-separated list of both
    #[arg(short = 'i', value_name = "SOURCE")]
    pub identity: Option<String>,

    /// Run a command instead of launching a shell
    #[arg(short = 'c', value_name = "COMMAND")]
    pub run_command: Option<String>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Join an active session
    Join {
        /// Session id as printed by the broadcaster
        session_id: String,
    },
    /// Print the version
    Version,
}

impl Cli {
    /// Builds the process configuration: rc-file defaults overlaid with
    /// these flags.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        config.verbosity = self.verbose;
        config.insecure_https = self.insecure;
        config.run_command = self.run_command.clone();
        config.identity_source = self.identity.clone();

        if let Some(server) = &self.server {
            config.set_endpoint_host(server)?;
        }
        if let Some(spec) = &self.forward_spec {
            config.forward_ports = vec![ForwardedPort::parse_local(spec)?];
        }
        if let Some(spec) = &self.forward_addr {
            config.forward_port = Some(ForwardedPort::parse_invite(spec)?);
        }
        Ok(config)
    }
}
